//! Trip planning on top of the engine
//!
//! Flight and hotel searches run in parallel, followed by an itinerary
//! stage that reads both results from the session.

pub mod catalog;
pub mod pipeline;
pub mod request;
pub mod results;

pub use catalog::{trip_extraction_rules, trip_operations, trip_registry};
pub use pipeline::{trip_coordinator, trip_fallback, trip_pipeline, trip_pipeline_from_yaml};
pub use request::TripRequest;
pub use results::{
    DailyActivity, DailyPlan, FlightOption, FlightSearchResult, HotelOption, HotelSearchResult,
    ItineraryPlanResult, TripPlan,
};
