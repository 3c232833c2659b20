use crate::core::errors::Result;
use crate::operation::{Operation, OperationRegistry, ParamSpec, ParamType};
use crate::pipeline::FieldMapping;

pub const FLIGHT_SEARCH: &str = "flight_search";
pub const HOTEL_SEARCH: &str = "hotel_search";
pub const ITINERARY_GENERATOR: &str = "itinerary_generator";
/// Free-form lookup the itinerary stage may use; never required
pub const WEB_SEARCH: &str = "web_search";

const IATA_CODE: &str = "^[A-Z]{3}$";

pub fn flight_search() -> Operation {
    Operation::new(FLIGHT_SEARCH, "Search for flight options")
        .with_param(
            ParamSpec::required("originLocationCode", ParamType::String)
                .with_pattern(IATA_CODE)
                .with_description("Starting airport IATA code"),
        )
        .with_param(
            ParamSpec::required("destinationLocationCode", ParamType::String)
                .with_pattern(IATA_CODE)
                .with_description("Target airport IATA code"),
        )
        .with_param(ParamSpec::required("departureDate", ParamType::Date))
        .with_param(ParamSpec::required("adults", ParamType::Integer).with_minimum(1.0))
}

pub fn hotel_search() -> Operation {
    Operation::new(HOTEL_SEARCH, "Search for hotel options")
        .with_param(ParamSpec::required("cityCode", ParamType::String).with_pattern(IATA_CODE))
        .with_param(ParamSpec::required("check_in", ParamType::Date))
        .with_param(ParamSpec::required("check_out", ParamType::Date))
        .with_param(
            ParamSpec::required("max_budget", ParamType::Number)
                .with_minimum(0.0)
                .with_description("Maximum price per night in USD"),
        )
        .with_param(ParamSpec::optional("adults", ParamType::Integer).with_minimum(1.0))
}

pub fn itinerary_generator() -> Operation {
    Operation::new(ITINERARY_GENERATOR, "Generate a day-by-day itinerary plan for a trip")
        .with_param(ParamSpec::required("city", ParamType::String))
        .with_param(ParamSpec::required("trip_length_days", ParamType::Integer).with_minimum(1.0))
}

pub fn web_search() -> Operation {
    Operation::new(WEB_SEARCH, "Search the web for attractions and ideas")
        .with_param(ParamSpec::required("query", ParamType::String))
}

pub fn trip_operations() -> Vec<Operation> {
    vec![flight_search(), hotel_search(), itinerary_generator(), web_search()]
}

pub fn trip_registry() -> Result<OperationRegistry> {
    let mut registry = OperationRegistry::new();
    for operation in trip_operations() {
        registry.register(operation)?;
    }
    Ok(registry)
}

/// How each required trip operation draws its arguments from a `TripRequest`
pub fn trip_extraction_rules() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new(FLIGHT_SEARCH)
            .bind("originLocationCode", "origin_code")
            .bind("destinationLocationCode", "destination_code")
            .bind("departureDate", "departure_date")
            .bind("adults", "adults"),
        FieldMapping::new(HOTEL_SEARCH)
            .bind("cityCode", "destination_code")
            .bind("check_in", "departure_date")
            .bind("check_out", "return_date")
            .bind("max_budget", "max_budget_per_night")
            .bind_optional("adults", "adults"),
        FieldMapping::new(ITINERARY_GENERATOR)
            .bind("city", "destination_city")
            .bind("trip_length_days", "trip_length_days"),
    ]
}
