// Simulated backends for the trip operations

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use stagehand::{OperationProvider, ProviderFailure};
use std::sync::atomic::{AtomicUsize, Ordering};

fn text<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Rejects its first request as rate limited, then answers
#[derive(Default)]
pub struct FlightDesk {
    requests: AtomicUsize,
}

#[async_trait]
impl OperationProvider for FlightDesk {
    async fn perform(&self, args: &Map<String, Value>) -> Result<Value, ProviderFailure> {
        if self.requests.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ProviderFailure::rate_limited("429 from flight desk"));
        }
        let origin = text(args, "originLocationCode");
        let destination = text(args, "destinationLocationCode");
        let date = text(args, "departureDate");
        let adults = args.get("adults").and_then(Value::as_u64).unwrap_or(1) as f64;
        Ok(json!({"options": [
            {
                "flight_id": format!("{}{}-001", origin, destination),
                "airline": "Air France",
                "price": 612.0 * adults,
                "departure_time": format!("{}T08:30", date),
                "duration": "7h 20m"
            },
            {
                "flight_id": format!("{}{}-002", origin, destination),
                "airline": "Delta",
                "price": 548.0 * adults,
                "departure_time": format!("{}T18:05", date),
                "duration": "7h 45m"
            }
        ]}))
    }
}

pub struct HotelDesk;

#[async_trait]
impl OperationProvider for HotelDesk {
    async fn perform(&self, args: &Map<String, Value>) -> Result<Value, ProviderFailure> {
        let budget = args.get("max_budget").and_then(Value::as_f64).unwrap_or(0.0);
        let options: Vec<Value> = [
            ("Hotel du Marais", 180.0, 4.4, "Wifi, breakfast", Some(0.8)),
            ("Rive Gauche Suites", 240.0, 4.7, "Wifi, spa, gym", Some(1.5)),
            ("Gare du Nord Inn", 95.0, 3.6, "Wifi", None),
        ]
        .into_iter()
        .filter(|(_, price, _, _, _)| *price <= budget)
        .map(|(name, price, rating, amenities, distance)| {
            json!({
                "name": name,
                "price_per_night": price,
                "rating": rating,
                "amenities_summary": amenities,
                "distance_to_center": distance
            })
        })
        .collect();
        if options.is_empty() {
            return Err(ProviderFailure::not_found(format!(
                "no hotel in {} under {}",
                text(args, "cityCode"),
                budget
            )));
        }
        Ok(json!({ "options": options }))
    }
}

pub struct ItineraryWriter;

#[async_trait]
impl OperationProvider for ItineraryWriter {
    async fn perform(&self, args: &Map<String, Value>) -> Result<Value, ProviderFailure> {
        let city = text(args, "city");
        let days = args.get("trip_length_days").and_then(Value::as_u64).unwrap_or(1);
        let themes = ["Landmarks", "Museums", "Neighbourhoods", "Food"];
        let daily_plans: Vec<Value> = (1..=days)
            .map(|day| {
                let theme = themes[(day as usize - 1) % themes.len()];
                json!({
                    "day_number": day,
                    "theme": theme,
                    "activities": [
                        {
                            "time": "09:30",
                            "description": format!("{} of {}", theme, city),
                            "estimated_cost": 25.0
                        },
                        {"time": "19:00", "description": "Dinner", "estimated_cost": 60.0}
                    ]
                })
            })
            .collect();
        Ok(json!({"city": city, "total_days": days, "daily_plans": daily_plans}))
    }
}

pub struct WebSearch;

#[async_trait]
impl OperationProvider for WebSearch {
    async fn perform(&self, args: &Map<String, Value>) -> Result<Value, ProviderFailure> {
        let query = text(args, "query");
        if query.trim().is_empty() {
            return Err(ProviderFailure::rejected("empty query"));
        }
        Ok(json!({"query": query, "results": ["Top 10 sights", "Local food guide"]}))
    }
}
