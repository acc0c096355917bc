//! Operation timing keyed by explicit operation ids
//!
//! Each scenario run owns one [`OperationTimer`] and threads the
//! [`OperationId`] it got from `start` through to `stop`. Entries are removed
//! with `finish` once the run is reported.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Identifier of one timed operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct OperationId(Uuid);

impl OperationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Start/stop record of one operation
#[derive(Clone, Debug, Serialize)]
pub struct TimerEntry {
    /// Id handed out by [`OperationTimer::start`]
    pub operation_id: OperationId,
    /// Human-readable operation name
    pub name: String,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock stop, once stopped
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    stopped: Option<Instant>,
}

impl TimerEntry {
    /// Monotonic duration, once stopped
    pub fn duration(&self) -> Option<Duration> {
        self.stopped.map(|stopped| stopped - self.started)
    }
}

/// Start/stop timestamps for the operations of one run
#[derive(Debug, Default)]
pub struct OperationTimer {
    entries: HashMap<OperationId, TimerEntry>,
}

impl OperationTimer {
    /// Empty timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing an operation
    pub fn start(&mut self, name: impl Into<String>) -> OperationId {
        let mut id = OperationId::new();
        while self.entries.contains_key(&id) {
            id = OperationId::new();
        }
        let name = name.into();
        debug!(operation_id = %id, name = %name, "Timer started");
        self.entries.insert(
            id,
            TimerEntry {
                operation_id: id,
                name,
                started_at: Utc::now(),
                stopped_at: None,
                started: Instant::now(),
                stopped: None,
            },
        );
        id
    }

    /// Monotonic start of an open operation, for budgets counting from it
    pub fn started_instant(&self, id: OperationId) -> Result<Instant> {
        Ok(self.entry(id)?.started)
    }

    /// Stop an operation and return its duration. Stopping twice is an error.
    pub fn stop(&mut self, id: OperationId) -> Result<Duration> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::timer(format!("unknown operation {}", id)))?;
        if entry.stopped.is_some() {
            return Err(Error::timer(format!(
                "operation {} ({}) already stopped",
                id, entry.name
            )));
        }
        let now = Instant::now();
        entry.stopped = Some(now);
        entry.stopped_at = Some(Utc::now());
        let duration = now - entry.started;
        debug!(
            operation_id = %id,
            name = %entry.name,
            elapsed_ms = duration.as_millis() as u64,
            "Timer stopped"
        );
        Ok(duration)
    }

    /// Duration of a stopped operation
    pub fn elapsed(&self, id: OperationId) -> Result<Duration> {
        let entry = self.entry(id)?;
        entry
            .duration()
            .ok_or_else(|| Error::timer(format!("operation {} ({}) not stopped", id, entry.name)))
    }

    /// Look at an entry without removing it
    pub fn entry(&self, id: OperationId) -> Result<&TimerEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| Error::timer(format!("unknown operation {}", id)))
    }

    /// Remove and return an entry
    pub fn finish(&mut self, id: OperationId) -> Result<TimerEntry> {
        self.entries
            .remove(&id)
            .ok_or_else(|| Error::timer(format!("unknown operation {}", id)))
    }

    /// Number of entries not yet finished
    pub fn open_entries(&self) -> usize {
        self.entries.len()
    }
}
