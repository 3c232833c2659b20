use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::errors::{Result, StagehandError};
use crate::pipeline::RunContext;

/// A trip planning request, already resolved to airport codes and dates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRequest {
    pub origin_code: String,
    pub destination_code: String,
    pub destination_city: String,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
    #[serde(default = "default_adults")]
    pub adults: u32,
    /// Nightly lodging cap in USD; lodging cannot be searched without it
    #[serde(default)]
    pub max_budget_per_night: Option<f64>,
}

fn default_adults() -> u32 {
    1
}

fn is_iata(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

impl TripRequest {
    pub fn validate(&self) -> Result<()> {
        if !is_iata(&self.origin_code) {
            return Err(StagehandError::invalid_request(
                "origin_code",
                format!("'{}' is not a three-letter IATA code", self.origin_code),
            ));
        }
        if !is_iata(&self.destination_code) {
            return Err(StagehandError::invalid_request(
                "destination_code",
                format!("'{}' is not a three-letter IATA code", self.destination_code),
            ));
        }
        if self.destination_city.trim().is_empty() {
            return Err(StagehandError::invalid_request("destination_city", "cannot be empty"));
        }
        if self.return_date <= self.departure_date {
            return Err(StagehandError::invalid_request(
                "return_date",
                "must be after the departure date",
            ));
        }
        if self.adults == 0 {
            return Err(StagehandError::invalid_request("adults", "at least one adult is required"));
        }
        if let Some(budget) = self.max_budget_per_night {
            if !budget.is_finite() || budget < 0.0 {
                return Err(StagehandError::invalid_request(
                    "max_budget_per_night",
                    "must be a non-negative amount",
                ));
            }
        }
        Ok(())
    }

    pub fn nights(&self) -> i64 {
        (self.return_date - self.departure_date).num_days()
    }

    /// Days covered by the itinerary, counting both travel days
    pub fn trip_length_days(&self) -> i64 {
        self.nights() + 1
    }

    /// Flattened request fields, including derived ones
    pub fn to_request_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("origin_code".into(), json!(self.origin_code));
        map.insert("destination_code".into(), json!(self.destination_code));
        map.insert("destination_city".into(), json!(self.destination_city));
        map.insert(
            "departure_date".into(),
            json!(self.departure_date.format("%Y-%m-%d").to_string()),
        );
        map.insert(
            "return_date".into(),
            json!(self.return_date.format("%Y-%m-%d").to_string()),
        );
        map.insert("adults".into(), json!(self.adults));
        if let Some(budget) = self.max_budget_per_night {
            map.insert("max_budget_per_night".into(), json!(budget));
        }
        map.insert("nights".into(), json!(self.nights()));
        map.insert("trip_length_days".into(), json!(self.trip_length_days()));
        map
    }

    pub fn into_context(self) -> Result<RunContext> {
        self.validate()?;
        Ok(RunContext::new(self.to_request_map()))
    }
}
