use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::core::errors::{Result, StagehandError};
use crate::session::SessionStore;

/// Identifier of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(cuid2::create_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct ContextInner {
    run_id: RunId,
    request: Map<String, Value>,
    session: SessionStore,
    started_at: DateTime<Utc>,
}

/// The original request plus the run's session store
///
/// Cheap to clone; every stage of a run sees the same request and session.
#[derive(Debug, Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

impl RunContext {
    pub fn new(request: Map<String, Value>) -> Self {
        Self::with_run_id(RunId::generate(), request)
    }

    pub fn with_run_id(run_id: RunId, request: Map<String, Value>) -> Self {
        let session = SessionStore::new(run_id.as_str());
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                request,
                session,
                started_at: Utc::now(),
            }),
        }
    }

    /// Build a context from any serializable request that encodes as an object
    pub fn from_serializable<T: Serialize>(request: &T) -> Result<Self> {
        match serde_json::to_value(request)? {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(StagehandError::configuration(format!(
                "run request must serialize to an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn request(&self) -> &Map<String, Value> {
        &self.inner.request
    }

    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Request field by dotted path, e.g. `traveller.adults`
    pub fn param(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.inner.request.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Null => None,
            value => Some(value),
        }
    }

    pub fn str_param(&self, path: &str) -> Option<&str> {
        self.param(path).and_then(Value::as_str)
    }

    /// Output written by an upstream stage, if it wrote one
    pub fn upstream(&self, key: &str) -> Option<Value> {
        self.inner.session.get(key)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> RunContext {
        RunContext::new(
            json!({
                "destination": "PAR",
                "party": {"adults": 2, "ages": [34, 36]},
                "budget": null
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
    }

    #[test]
    fn test_dotted_paths() {
        let ctx = context();
        assert_eq!(ctx.str_param("destination"), Some("PAR"));
        assert_eq!(ctx.param("party.adults"), Some(&json!(2)));
        assert_eq!(ctx.param("party.ages.1"), Some(&json!(36)));
        assert_eq!(ctx.param("party.children"), None);
        assert_eq!(ctx.param("destination.code"), None);
    }

    #[test]
    fn test_null_counts_as_absent() {
        assert!(context().param("budget").is_none());
    }

    #[test]
    fn test_clones_share_session() {
        let ctx = context();
        let other = ctx.clone();
        ctx.session().put("k", "stage", json!("v")).unwrap();
        assert_eq!(other.upstream("k"), Some(json!("v")));
        assert_eq!(other.run_id(), ctx.run_id());
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }

    #[test]
    fn test_from_serializable_requires_object() {
        #[derive(Serialize)]
        struct Req {
            city: String,
        }
        let ctx = RunContext::from_serializable(&Req { city: "Rome".into() }).unwrap();
        assert_eq!(ctx.str_param("city"), Some("Rome"));
        assert!(RunContext::from_serializable(&vec![1, 2]).is_err());
    }
}
