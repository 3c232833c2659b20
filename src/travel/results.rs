use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::catalog::{FLIGHT_SEARCH, HOTEL_SEARCH, ITINERARY_GENERATOR};
use super::pipeline::{FLIGHT_OPTIONS, HOTEL_OPTIONS, ITINERARY_PLAN};
use crate::pipeline::{RunResult, StageStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightOption {
    pub flight_id: String,
    pub airline: String,
    /// Round-trip price in USD
    pub price: f64,
    pub departure_time: String,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlightSearchResult {
    pub options: Vec<FlightOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelOption {
    pub name: String,
    pub price_per_night: f64,
    pub rating: f64,
    pub amenities_summary: String,
    #[serde(default)]
    pub distance_to_center: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HotelSearchResult {
    pub options: Vec<HotelOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyActivity {
    pub time: String,
    pub description: String,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPlan {
    pub day_number: u32,
    pub theme: String,
    pub activities: Vec<DailyActivity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItineraryPlanResult {
    pub city: String,
    pub total_days: u32,
    pub daily_plans: Vec<DailyPlan>,
}

/// Typed view of a trip pipeline's outputs
///
/// A section is `None` when its stage produced nothing readable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TripPlan {
    pub flights: Option<FlightSearchResult>,
    pub hotels: Option<HotelSearchResult>,
    pub itinerary: Option<ItineraryPlanResult>,
}

impl TripPlan {
    /// Decode each section on its own; a section that cannot be read is left out
    pub fn from_run(result: &RunResult) -> Self {
        Self {
            flights: section(result, FLIGHT_OPTIONS, FLIGHT_SEARCH),
            hotels: section(result, HOTEL_OPTIONS, HOTEL_SEARCH),
            itinerary: section(result, ITINERARY_PLAN, ITINERARY_GENERATOR),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.flights.is_some() && self.hotels.is_some() && self.itinerary.is_some()
    }
}

/// Prefer the operation's own result from a satisfied stage's trace, then
/// the stored output with any `{operation: value}` wrapper removed
fn section<T: DeserializeOwned>(result: &RunResult, key: &str, operation: &str) -> Option<T> {
    let from_trace = result
        .stages
        .values()
        .filter(|report| report.output_key == key)
        .filter(|report| {
            matches!(report.status, StageStatus::Verified | StageStatus::Recovered)
        })
        .find_map(|report| report.final_trace().last_success(operation).cloned());
    let value = from_trace.or_else(|| {
        result.output(key).map(|output| match output {
            Value::Object(map) if map.contains_key(operation) => map[operation].clone(),
            other => other.clone(),
        })
    })?;

    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(
                output_key = key,
                operation,
                error = %err,
                "Trip section could not be decoded"
            );
            None
        }
    }
}
