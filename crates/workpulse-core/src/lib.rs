pub mod cooldown;
pub mod hashing;
pub mod protocol;
pub mod scheduler;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use cooldown::{CooldownError, CooldownPhase, CooldownTimer, SegmentState};
pub use scheduler::{BackoffPolicy, ErrorTracker, Scheduler};

pub type Payload = Map<String, Value>;

pub const EVENT_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event label must not be empty")]
    EmptyLabel,
    #[error("event type must not be empty")]
    EmptyEventType,
    #[error("label is not identifier-safe: {0:?}")]
    InvalidLabel(String),
}

/// Labels start with an ASCII letter and continue with letters, digits, `_` or `-`.
pub fn is_identifier_safe(label: &str) -> bool {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

pub fn validate_label(label: &str) -> Result<(), EventError> {
    if label.trim().is_empty() {
        return Err(EventError::EmptyLabel);
    }
    if !is_identifier_safe(label) {
        return Err(EventError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

/// An instantaneous observation reported by a source.
///
/// Fields are private so the non-empty label/type invariant holds for every
/// constructed value. Attaching an id produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    timestamp: DateTime<Utc>,
    label: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

impl Event {
    pub fn new(
        label: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        let label = label.into();
        let event_type = event_type.into();
        if label.trim().is_empty() {
            return Err(EventError::EmptyLabel);
        }
        if event_type.trim().is_empty() {
            return Err(EventError::EmptyEventType);
        }
        Ok(Self {
            timestamp,
            label,
            event_type,
            payload: None,
            id: None,
        })
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self.id = None;
        self
    }

    /// Returns the event with its content hash attached. Events that already
    /// carry an id are returned as-is.
    pub fn with_computed_id(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(hashing::event_content_id(
                self.timestamp,
                &self.label,
                &self.event_type,
                self.payload.as_ref(),
            ));
        }
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn payload_value(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|payload| payload.get(key))
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn to_ref(&self) -> EventRef {
        EventRef {
            timestamp: self.timestamp,
            label: self.label.clone(),
            event_type: self.event_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub event_type: String,
}

/// A closed work segment, produced once by the aggregator and handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_s: f64,
    #[serde(default)]
    pub events: Vec<EventRef>,
    #[serde(default)]
    pub aggregated: BTreeMap<String, Value>,
    pub resets_count: u32,
}

impl Segment {
    pub fn from_state(
        state: SegmentState,
        events: Vec<EventRef>,
        aggregated: BTreeMap<String, Value>,
    ) -> Self {
        let duration = state.last - state.start;
        Self {
            start: state.start,
            end: state.last,
            duration_s: duration_secs(duration),
            events,
            aggregated,
            resets_count: state.resets_count,
        }
    }
}

pub fn duration_secs(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1_000.0
}

pub fn duration_from_secs_f64(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let millis = (secs * 1_000.0).round();
    if millis > i64::MAX as f64 {
        return None;
    }
    Some(Duration::milliseconds(millis as i64))
}

/// Static registration metadata for one monitoring source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub label: String,
    pub data_header: Option<String>,
    pub resets_cooldown: bool,
    pub infrequent: bool,
    pub poll_interval: Duration,
}

impl SourceSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data_header: None,
            resets_cooldown: false,
            infrequent: false,
            poll_interval: Duration::seconds(1),
        }
    }

    pub fn with_data_header(mut self, header: impl Into<String>) -> Self {
        let header = header.into();
        self.data_header = if header.trim().is_empty() {
            None
        } else {
            Some(header)
        };
        self
    }

    pub fn resetting(mut self, resets_cooldown: bool) -> Self {
        self.resets_cooldown = resets_cooldown;
        self
    }

    pub fn infrequent(mut self, infrequent: bool) -> Self {
        self.infrequent = infrequent;
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn data_header(&self) -> Option<&str> {
        self.data_header
            .as_deref()
            .filter(|header| !header.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Starting,
    Ok,
    Degraded,
    Overload,
    Failed,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self::Starting
    }
}

impl AgentHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Overload => "overload",
            Self::Failed => "failed",
        }
    }

    pub fn is_live(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentHealth {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "starting" => Ok(Self::Starting),
            "ok" | "healthy" => Ok(Self::Ok),
            "degraded" => Ok(Self::Degraded),
            "overload" | "overloaded" => Ok(Self::Overload),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Unknown health: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    #[test]
    fn event_requires_label_and_type() {
        assert_eq!(
            Event::new("", "tick", ts(0)).unwrap_err(),
            EventError::EmptyLabel
        );
        assert_eq!(
            Event::new("files", "  ", ts(0)).unwrap_err(),
            EventError::EmptyEventType
        );
    }

    #[test]
    fn computed_id_is_stable_and_content_sensitive() {
        let mut payload = Payload::new();
        payload.insert("files".to_string(), json!(["a.rs"]));
        let first = Event::new("files", "file_change", ts(0))
            .expect("event")
            .with_payload(payload.clone())
            .with_computed_id();
        let second = Event::new("files", "file_change", ts(0))
            .expect("event")
            .with_payload(payload)
            .with_computed_id();
        let other = Event::new("files", "file_change", ts(1))
            .expect("event")
            .with_computed_id();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.id().map(str::len), Some(EVENT_ID_LEN));
        assert_ne!(first.id(), other.id());
    }

    #[test]
    fn segment_duration_spans_start_to_last() {
        let state = SegmentState {
            start: ts(0),
            last: ts(3_000),
            resets_count: 1,
        };
        let segment = Segment::from_state(state, Vec::new(), BTreeMap::new());
        assert_eq!(segment.duration_s, 3.0);
        assert_eq!(segment.end, ts(3_000));
        assert_eq!(segment.resets_count, 1);
    }

    #[test]
    fn identifier_safe_labels() {
        assert!(is_identifier_safe("file_changes"));
        assert!(is_identifier_safe("agent-1"));
        assert!(!is_identifier_safe("1agent"));
        assert!(!is_identifier_safe("has space"));
        assert!(!is_identifier_safe("../escape"));
        assert!(matches!(
            validate_label("a/b"),
            Err(EventError::InvalidLabel(_))
        ));
    }

    #[test]
    fn data_header_ignores_blank_values() {
        let spec = SourceSpec::new("example").with_data_header(" ");
        assert_eq!(spec.data_header(), None);
        let spec = SourceSpec::new("example").with_data_header("examples");
        assert_eq!(spec.data_header(), Some("examples"));
    }

    #[test]
    fn health_parses_aliases() {
        assert_eq!("healthy".parse::<AgentHealth>(), Ok(AgentHealth::Ok));
        assert_eq!(AgentHealth::Overload.to_string(), "overload");
        assert!(!AgentHealth::Failed.is_live());
    }
}
