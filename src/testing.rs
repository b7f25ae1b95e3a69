//! Shared test support for the relay pipeline
//!
//! Helpers used by the unit tests and the integration tests under
//! `tests/`. Nothing here talks to a real database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::event::{Event, Operation, RowChange, RowData};
use crate::publish::Publisher;

/// Publisher that records everything it is asked to publish.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<Event>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<Mutex<usize>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn published(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn published_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Number of publish calls, successful or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// Make every subsequent publish call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, event: &Event) -> Result<()> {
        *self.attempts.lock().unwrap() += 1;
        if self.failing.load(Ordering::SeqCst) {
            bail!("publisher unavailable");
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Build a one-row INSERT change carrying `marker` so tests can assert
/// ordering across coalesced changes.
pub fn insert_change(table: &str, marker: i64) -> RowChange {
    let mut pk = serde_json::Map::new();
    pk.insert("id".to_string(), json!(marker));
    let mut after = serde_json::Map::new();
    after.insert("id".to_string(), json!(marker));

    RowChange {
        schema: "testdb".to_string(),
        table: table.to_string(),
        op: Operation::Insert,
        rows: vec![RowData {
            pk,
            before: None,
            after: Some(after),
        }],
    }
}
