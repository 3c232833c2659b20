use std::sync::Arc;

use super::catalog::{
    trip_extraction_rules, FLIGHT_SEARCH, HOTEL_SEARCH, ITINERARY_GENERATOR, WEB_SEARCH,
};
use crate::core::config::EngineConfig;
use crate::core::errors::Result;
use crate::operation::{DeterministicExecutor, OperationRegistry};
use crate::pipeline::{
    Delegate, DelegateRegistry, FallbackController, PipelineCoordinator, PipelineDefinition,
    PipelineGraph, StageSpec,
};

pub const TRIP_PIPELINE: &str = "trip_planner";

pub const FLIGHT_STAGE: &str = "flights";
pub const HOTEL_STAGE: &str = "hotels";
pub const ITINERARY_STAGE: &str = "itinerary";

pub const FLIGHT_OPTIONS: &str = "flight_options";
pub const HOTEL_OPTIONS: &str = "hotel_options";
pub const ITINERARY_PLAN: &str = "itinerary_plan";

/// Delegate names used by [`TRIP_PIPELINE_YAML`]
pub const FLIGHT_AGENT: &str = "flight_agent";
pub const HOTEL_AGENT: &str = "hotel_agent";
pub const ITINERARY_AGENT: &str = "itinerary_agent";

/// Flights and hotels run side by side; the itinerary waits for both.
pub const TRIP_PIPELINE_YAML: &str = r#"
name: trip_planner
description: Flights and hotels in parallel, then a day-by-day itinerary
stages:
  - id: flights
    delegate: flight_agent
    requires: [flight_search]
    output_key: flight_options
  - id: hotels
    delegate: hotel_agent
    requires: [hotel_search]
    output_key: hotel_options
  - id: itinerary
    delegate: itinerary_agent
    requires: [itinerary_generator]
    operations: [web_search]
    depends_on: [flights, hotels]
    output_key: itinerary_plan
"#;

pub fn trip_pipeline(
    registry: &OperationRegistry,
    flights: Arc<dyn Delegate>,
    hotels: Arc<dyn Delegate>,
    itinerary: Arc<dyn Delegate>,
) -> Result<PipelineGraph> {
    let stages = vec![
        StageSpec::new(FLIGHT_STAGE, flights)
            .requires(FLIGHT_SEARCH)
            .output_key(FLIGHT_OPTIONS),
        StageSpec::new(HOTEL_STAGE, hotels)
            .requires(HOTEL_SEARCH)
            .output_key(HOTEL_OPTIONS),
        StageSpec::new(ITINERARY_STAGE, itinerary)
            .requires(ITINERARY_GENERATOR)
            .allows(WEB_SEARCH)
            .depends_on(FLIGHT_STAGE)
            .depends_on(HOTEL_STAGE)
            .output_key(ITINERARY_PLAN),
    ];
    let mut graph = PipelineGraph::build(TRIP_PIPELINE, stages, registry)?;
    graph.set_description("Flights and hotels in parallel, then a day-by-day itinerary");
    Ok(graph)
}

/// Build the trip pipeline from [`TRIP_PIPELINE_YAML`]
pub fn trip_pipeline_from_yaml(
    delegates: &DelegateRegistry,
    registry: &OperationRegistry,
) -> Result<PipelineGraph> {
    let definition = PipelineDefinition::from_yaml_str(TRIP_PIPELINE_YAML)?;
    PipelineGraph::from_definition(definition, delegates, registry)
}

/// Fallback controller with an extraction rule for every required trip operation
pub fn trip_fallback(
    executor: Arc<DeterministicExecutor>,
    config: &EngineConfig,
) -> FallbackController {
    trip_extraction_rules()
        .into_iter()
        .fold(FallbackController::from_config(executor, config), |fallback, mapping| {
            fallback.with_mapping(mapping)
        })
}

pub fn trip_coordinator(
    executor: Arc<DeterministicExecutor>,
    config: EngineConfig,
) -> Result<PipelineCoordinator> {
    let fallback = trip_fallback(Arc::clone(&executor), &config);
    PipelineCoordinator::new(executor, fallback, config)
}
