use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::errors::{Result, StagehandError};

/// A value written to the session along with who wrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub value: Value,
    pub writer: String,
    pub written_at: DateTime<Utc>,
}

/// Run-scoped, write-once key/value store shared by the stages of one run
///
/// Clones share the same entries. Each key may be written once; a second
/// write fails with `KeyCollision` and leaves the first value in place.
#[derive(Debug, Clone)]
pub struct SessionStore {
    run_id: Arc<str>,
    entries: Arc<DashMap<String, SessionEntry>>,
    closed: Arc<AtomicBool>,
}

impl SessionStore {
    pub fn new(run_id: impl Into<String>) -> Self {
        let run_id: String = run_id.into();
        Self {
            run_id: Arc::from(run_id),
            entries: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write `value` under `key` on behalf of `writer`
    pub fn put(&self, key: &str, writer: &str, value: Value) -> Result<()> {
        if self.is_closed() {
            return Err(StagehandError::session_unavailable(self.run_id.as_ref()));
        }
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                let existing_writer = existing.get().writer.clone();
                warn!(
                    run_id = %self.run_id,
                    key,
                    existing_writer = %existing_writer,
                    writer,
                    "Rejected second write to session key"
                );
                Err(StagehandError::KeyCollision {
                    run_id: self.run_id.to_string(),
                    key: key.to_string(),
                    existing_writer,
                    writer: writer.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    value,
                    writer: writer.to_string(),
                    written_at: Utc::now(),
                });
                debug!(run_id = %self.run_id, key, writer, "Session key written");
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<SessionEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn writer_of(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.writer.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted copy of every value
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    /// Refuse all further writes; reads keep working
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_once() {
        let store = SessionStore::new("run-1");
        store.put("flight_options", "flights", json!([1, 2])).unwrap();

        let err = store
            .put("flight_options", "rogue", json!("overwrite"))
            .unwrap_err();
        match err {
            StagehandError::KeyCollision {
                key,
                existing_writer,
                writer,
                ..
            } => {
                assert_eq!(key, "flight_options");
                assert_eq!(existing_writer, "flights");
                assert_eq!(writer, "rogue");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.get("flight_options"), Some(json!([1, 2])));
        assert_eq!(store.writer_of("flight_options").as_deref(), Some("flights"));
    }

    #[test]
    fn test_stores_are_isolated_per_run() {
        let a = SessionStore::new("a");
        let b = SessionStore::new("b");
        a.put("k", "s", json!(1)).unwrap();
        assert!(b.get("k").is_none());
        assert!(b.put("k", "s", json!(2)).is_ok());
    }

    #[test]
    fn test_closed_store_rejects_writes() {
        let store = SessionStore::new("run-2");
        store.put("k", "s", json!(1)).unwrap();
        store.clone().close();
        assert!(matches!(
            store.put("other", "s", json!(2)),
            Err(StagehandError::SessionUnavailable { .. })
        ));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_concurrent_writers_to_one_key() {
        let store = SessionStore::new("run-3");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.put("shared", &format!("w{}", i), json!(i)).is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(store.len(), 1);
    }
}
