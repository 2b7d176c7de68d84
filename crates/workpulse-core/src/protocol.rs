use crate::{AgentHealth, Event, EventError, Payload};
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const SUMMARY_EVENT_TYPE: &str = "summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_compatible(self) -> bool {
        self == Self::CURRENT
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if !value.is_finite() || value < 0.0 {
                    return Err(E::custom(format!("invalid protocol version: {value}")));
                }
                self.visit_u64(value.trunc() as u64)
            }

            // "1", "v1" and "1.2" all name major version 1.
            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let major = cleaned.split('.').next().unwrap_or_default();
                let version = major.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// True when `current` is at least `minimum`, comparing dotted numeric
/// components. Missing components count as zero and any non-digit suffix of a
/// component is ignored, so `1.2` satisfies `1.2.0` and `0.3.1-dev` satisfies `0.3`.
pub fn version_satisfies(current: &str, minimum: &str) -> bool {
    let current = version_components(current);
    let minimum = version_components(minimum);
    let len = current.len().max(minimum.len());
    for index in 0..len {
        let have = current.get(index).copied().unwrap_or(0);
        let need = minimum.get(index).copied().unwrap_or(0);
        if have != need {
            return have > need;
        }
    }
    true
}

fn version_components(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().unwrap_or(0)
        })
        .collect()
}

/// One agent -> orchestrator line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent_id: String,
    pub agent_label: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<AgentHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Handshake {
        min_app_version: String,
        capabilities: Vec<String>,
    },
    Summary,
    Heartbeat {
        metrics: Map<String, Value>,
    },
    Status,
    Error,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Summary => "summary",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Status => "status",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("message is not a summary: {0}")]
    NotSummary(&'static str),
    #[error("invalid event: {0}")]
    Event(#[from] EventError),
}

impl AgentMessage {
    pub fn new(agent_label: impl Into<String>, timestamp: DateTime<Utc>, body: MessageBody) -> Self {
        let agent_label = agent_label.into();
        Self {
            timestamp,
            agent_id: agent_label.clone(),
            agent_label,
            protocol_version: ProtocolVersion::CURRENT,
            agent_version: String::new(),
            data: Map::new(),
            health: None,
            message: None,
            event_type: None,
            body,
        }
    }

    pub fn heartbeat(
        agent_label: impl Into<String>,
        timestamp: DateTime<Utc>,
        metrics: Map<String, Value>,
    ) -> Self {
        Self::new(agent_label, timestamp, MessageBody::Heartbeat { metrics })
    }

    /// Builds the synthetic summary that carries an in-process event.
    pub fn summary_from_event(event: &Event) -> Self {
        let mut message = Self::new(event.label(), event.timestamp(), MessageBody::Summary);
        message.data = event.payload().cloned().unwrap_or_default();
        message.event_type = Some(event.event_type().to_string());
        message
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.body, MessageBody::Heartbeat { .. })
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.agent_label.trim().is_empty() {
            return Err(ProtocolError::MissingField("agent_label"));
        }
        if let MessageBody::Handshake {
            min_app_version, ..
        } = &self.body
        {
            if min_app_version.trim().is_empty() {
                return Err(ProtocolError::MissingField("min_app_version"));
            }
        }
        Ok(())
    }

    /// Summary messages fold back into events, whichever side produced them.
    pub fn to_event(&self) -> Result<Event, ProtocolError> {
        if !matches!(self.body, MessageBody::Summary) {
            return Err(ProtocolError::NotSummary(self.kind()));
        }
        let event_type = self
            .event_type
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(SUMMARY_EVENT_TYPE);
        let event = Event::new(self.agent_label.clone(), event_type, self.timestamp)?;
        if self.data.is_empty() {
            return Ok(event);
        }
        Ok(event.with_payload(Payload::clone(&self.data)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Ack,
    Reject,
    Flush,
    Status,
    Shutdown,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Reject => "reject",
            Self::Flush => "flush",
            Self::Status => "status",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One orchestrator -> agent line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorCommand {
    pub cmd: CommandKind,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl OrchestratorCommand {
    pub fn new(cmd: CommandKind) -> Self {
        Self {
            cmd,
            args: Map::new(),
            id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn ack(agent_id: &str) -> Self {
        Self::new(CommandKind::Ack).with_arg("agent_id", Value::String(agent_id.to_string()))
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::new(CommandKind::Reject).with_arg("reason", Value::String(reason.into()))
    }

    pub fn flush() -> Self {
        Self::new(CommandKind::Flush)
    }

    pub fn status() -> Self {
        Self::new(CommandKind::Status)
    }

    pub fn shutdown() -> Self {
        Self::new(CommandKind::Shutdown)
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame rejected: {0}")]
    Invalid(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Parses one stdout line from an agent. Blank lines yield `Ok(None)`.
pub fn parse_agent_line(line: &str) -> Result<Option<AgentMessage>, FrameError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let message: AgentMessage = decode_frame(trimmed.as_bytes(), DEFAULT_MAX_FRAME_BYTES)?;
    message.validate()?;
    Ok(Some(message))
}

pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if frame.ends_with(b"\n") {
                frame.pop();
            }
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.decode_raw_frame(&frame, &mut report);
        }

        if !self.pending.is_empty() && self.pending.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            self.pending.clear();
            return DecodeReport::default();
        }

        let final_frame = std::mem::take(&mut self.pending);
        let mut report = DecodeReport::default();
        self.decode_raw_frame(&final_frame, &mut report);
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.push_frame(parsed),
            Err(err) => report.push_error(FrameError::Decode(err.to_string())),
        }
    }
}
