// Delegates with varying discipline about calling their operations

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use stagehand::pipeline::Toolbox;
use stagehand::travel::catalog::{FLIGHT_SEARCH, ITINERARY_GENERATOR, WEB_SEARCH};
use stagehand::travel::pipeline::{FLIGHT_AGENT, HOTEL_AGENT, ITINERARY_AGENT};
use stagehand::{Delegate, RunContext};
use tracing::info;

/// Calls flight_search once and returns what it got
pub struct FlightAgent;

#[async_trait]
impl Delegate for FlightAgent {
    fn name(&self) -> &str {
        FLIGHT_AGENT
    }

    async fn attempt(&self, ctx: &RunContext, toolbox: &Toolbox) -> anyhow::Result<Option<Value>> {
        let mut args = Map::new();
        args.insert("originLocationCode".into(), json!(ctx.str_param("origin_code")));
        args.insert("destinationLocationCode".into(), json!(ctx.str_param("destination_code")));
        args.insert("departureDate".into(), json!(ctx.str_param("departure_date")));
        args.insert("adults".into(), ctx.param("adults").cloned().unwrap_or(json!(1)));
        let call = toolbox.invoke(FLIGHT_SEARCH, args).await?;
        Ok(call.outcome.value().cloned())
    }
}

/// Answers from memory; never searches
pub struct HotelAgent;

#[async_trait]
impl Delegate for HotelAgent {
    fn name(&self) -> &str {
        HOTEL_AGENT
    }

    async fn attempt(&self, ctx: &RunContext, _toolbox: &Toolbox) -> anyhow::Result<Option<Value>> {
        let city = ctx.str_param("destination_city").unwrap_or("the city");
        Ok(Some(json!(format!("{} has plenty of charming hotels.", city))))
    }
}

/// Looks up ideas, then generates the plan with both searches in view
pub struct ItineraryAgent;

#[async_trait]
impl Delegate for ItineraryAgent {
    fn name(&self) -> &str {
        ITINERARY_AGENT
    }

    async fn attempt(&self, ctx: &RunContext, toolbox: &Toolbox) -> anyhow::Result<Option<Value>> {
        let city = ctx.str_param("destination_city").unwrap_or_default().to_string();
        info!(
            flights = ctx.upstream("flight_options").is_some(),
            hotels = ctx.upstream("hotel_options").is_some(),
            "Planning with upstream results"
        );

        let mut query = Map::new();
        query.insert("query".into(), json!(format!("things to do in {}", city)));
        toolbox.invoke(WEB_SEARCH, query).await?;

        let mut args = Map::new();
        args.insert("city".into(), json!(city));
        args.insert(
            "trip_length_days".into(),
            ctx.param("trip_length_days").cloned().unwrap_or(json!(1)),
        );
        let call = toolbox.invoke(ITINERARY_GENERATOR, args).await?;
        Ok(call.outcome.value().cloned())
    }
}
