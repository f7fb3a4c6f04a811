//! Structured operational event log.
//!
//! Every state change in the control plane emits an event with a source, a
//! name, a UTC timestamp and a nested JSON `extra` object. Events are
//! encoded as one marker-tagged JSON line inside the ordinary log stream,
//! so they can be extracted later from a log file by a prefix filter over
//! source and name.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

/// Marker token preceding the JSON payload on an event line.
pub const EVENT_MARKER: &str = "EPUCTL_EVENT_JSON:";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event {field} must be non-empty")]
    Empty { field: &'static str },

    #[error("event {field} must not contain newlines: {value:?}")]
    Newline { field: &'static str, value: String },

    #[error("failed to read event log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One extracted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

// High-water mark guaranteeing strictly increasing event timestamps even
// for back-to-back emissions within clock resolution.
static LAST_STAMP: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);

fn unique_timestamp() -> DateTime<Utc> {
    let mut last = LAST_STAMP.lock().unwrap_or_else(|e| e.into_inner());
    let mut now = Utc::now();
    if let Some(prev) = *last {
        if now <= prev {
            now = prev + Duration::microseconds(1);
        }
    }
    *last = Some(now);
    now
}

fn check_field(field: &'static str, value: &str) -> Result<(), EventError> {
    if value.is_empty() {
        return Err(EventError::Empty { field });
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(EventError::Newline { field, value: value.to_string() });
    }
    Ok(())
}

/// Render the log-line text for an event without emitting it.
pub fn event_logtxt(
    source: &str,
    name: &str,
    extra: Map<String, Value>,
) -> Result<String, EventError> {
    check_field("source", source)?;
    check_field("name", name)?;

    let event = Event {
        source: source.to_string(),
        name: name.to_string(),
        timestamp: unique_timestamp(),
        extra,
    };
    let json = serde_json::to_string(&event)?;
    Ok(format!("{} {}", EVENT_MARKER, json))
}

/// Emit an event into the log stream.
pub fn emit(source: &str, name: &str, extra: Map<String, Value>) -> Result<(), EventError> {
    let line = event_logtxt(source, name, extra)?;
    info!(target: "epuctl::events", "{}", line);
    Ok(())
}

/// Extract events from a log file.
///
/// A line contributes an event when it contains [`EVENT_MARKER`] followed by
/// a JSON payload. `sourcefilter` and `namefilter` select events whose
/// source / name start with the given prefix; both must match when both are
/// given.
pub fn events_from_file(
    path: &Path,
    sourcefilter: Option<&str>,
    namefilter: Option<&str>,
) -> Result<Vec<Event>, EventError> {
    let content = std::fs::read_to_string(path).map_err(|e| EventError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut events = Vec::new();
    for line in content.lines() {
        let Some(at) = line.find(EVENT_MARKER) else { continue };
        let payload = &line[at + EVENT_MARKER.len()..];
        let event: Event = match serde_json::from_str(payload.trim()) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping malformed event line");
                continue;
            }
        };
        if let Some(prefix) = sourcefilter {
            if !event.source.starts_with(prefix) {
                continue;
            }
        }
        if let Some(prefix) = namefilter {
            if !event.name.starts_with(prefix) {
                continue;
            }
        }
        events.push(event);
    }
    Ok(events)
}
