use anyhow::Result;
use serde_json::json;
use stagehand::pipeline::RunEvent;
use stagehand::travel::catalog::{FLIGHT_SEARCH, HOTEL_SEARCH, ITINERARY_GENERATOR, WEB_SEARCH};
use stagehand::travel::{trip_coordinator, trip_registry, TripPlan, TripRequest};
use stagehand::{
    DelegateRegistry, DeterministicExecutor, EngineConfig, PipelineDefinition, PipelineGraph,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod agents;
mod providers;

use agents::{FlightAgent, HotelAgent, ItineraryAgent};
use providers::{FlightDesk, HotelDesk, ItineraryWriter, WebSearch};

const CONFIG_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config.yaml");
const PIPELINE_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/pipeline.yaml");

fn load_config() -> Result<EngineConfig> {
    if Path::new(CONFIG_FILE).exists() {
        info!(path = CONFIG_FILE, "Loading engine config");
        Ok(EngineConfig::from_yaml_file(CONFIG_FILE)?)
    } else {
        Ok(EngineConfig::default())
    }
}

fn load_definition() -> Result<PipelineDefinition> {
    let definition = if Path::new(PIPELINE_FILE).exists() {
        info!(path = PIPELINE_FILE, "Loading pipeline definition");
        PipelineDefinition::from_yaml_file(PIPELINE_FILE)?
    } else {
        PipelineDefinition::from_yaml_str(stagehand::travel::pipeline::TRIP_PIPELINE_YAML)?
    };
    Ok(definition)
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config()?;
    let registry = Arc::new(trip_registry()?);
    let executor = DeterministicExecutor::from_config(Arc::clone(&registry), &config)
        .with_provider(FLIGHT_SEARCH, FlightDesk::default())?
        .with_provider(HOTEL_SEARCH, HotelDesk)?
        .with_provider(ITINERARY_GENERATOR, ItineraryWriter)?
        .with_provider(WEB_SEARCH, WebSearch)?;
    let coordinator = trip_coordinator(Arc::new(executor), config)?;

    let delegates = DelegateRegistry::new()
        .with_delegate(Arc::new(FlightAgent))
        .with_delegate(Arc::new(HotelAgent))
        .with_delegate(Arc::new(ItineraryAgent));
    let graph = PipelineGraph::from_definition(load_definition()?, &delegates, &registry)?;
    info!(levels = ?graph.levels(), "Pipeline ready");

    let mut events = coordinator.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::StageUnverified { stage_id, missing, .. } => {
                    warn!(
                        stage_id = %stage_id,
                        missing = ?missing,
                        "Delegate skipped required operations"
                    );
                }
                RunEvent::StageFinished { stage_id, status, elapsed_ms, .. } => {
                    info!(stage_id = %stage_id, status = %status, elapsed_ms, "Stage finished");
                }
                RunEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let request: TripRequest = serde_json::from_value(json!({
        "origin_code": "JFK",
        "destination_code": "PAR",
        "destination_city": "Paris",
        "departure_date": "2026-06-10",
        "return_date": "2026-06-14",
        "adults": 2,
        "max_budget_per_night": 250.0
    }))?;
    let result = coordinator.run(&graph, request.into_context()?).await?;
    listener.await?;

    for (id, report) in &result.stages {
        info!(
            stage_id = %id,
            status = %report.status,
            fallback = report.used_fallback(),
            calls = report.final_trace().len(),
            "Stage report"
        );
        for (operation, reason) in &report.failure_reasons {
            warn!(
                stage_id = %id,
                operation = %operation,
                reason = %reason,
                "Unsatisfied requirement"
            );
        }
    }

    let plan = TripPlan::from_run(&result);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    println!("{}", serde_json::to_string_pretty(&result.statuses())?);
    Ok(())
}
