use crate::source::{RegisteredSource, SourceError};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use workpulse_core::protocol::AgentMessage;
use workpulse_core::AgentHealth;

/// Presents an in-process source with the same message shape as an agent, so
/// routing never has to tell the two apart.
pub struct LegacySourceAdapter<'a> {
    source: &'a mut RegisteredSource,
}

impl<'a> LegacySourceAdapter<'a> {
    pub fn new(source: &'a mut RegisteredSource) -> Self {
        Self { source }
    }

    pub fn label(&self) -> &str {
        self.source.label()
    }

    /// Polls the source once; an emitted event comes back as a summary.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Result<Option<AgentMessage>, SourceError> {
        let Some(event) = self.source.emit_event(now)? else {
            return Ok(None);
        };
        let mut message = AgentMessage::summary_from_event(&event);
        message.agent_label = self.source.label().to_string();
        message.agent_id = message.agent_label.clone();
        Ok(Some(message))
    }

    pub fn heartbeat(&self, now: DateTime<Utc>, metrics: Map<String, Value>) -> AgentMessage {
        synthetic_heartbeat(&*self.source, now, metrics, AgentHealth::Ok)
    }
}

pub fn synthetic_heartbeat(
    source: &RegisteredSource,
    now: DateTime<Utc>,
    metrics: Map<String, Value>,
    health: AgentHealth,
) -> AgentMessage {
    let mut message = AgentMessage::heartbeat(source.label(), now, metrics);
    message.agent_version = env!("CARGO_PKG_VERSION").to_string();
    message.health = Some(health);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::ScriptedSource;
    use crate::source::SourceRegistry;
    use chrono::TimeZone;
    use serde_json::json;
    use workpulse_core::protocol::MessageBody;
    use workpulse_core::{Payload, SourceSpec};

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    #[test]
    fn emitted_event_becomes_summary_and_back() {
        let mut source = ScriptedSource::new(SourceSpec::new("example").with_data_header("examples"));
        let mut payload = Payload::new();
        payload.insert("examples".to_string(), json!(["x1"]));
        source.push_payload(ts(0), payload);
        source.push_error("disk gone");
        let mut registry = SourceRegistry::new();
        registry.register(Box::new(source)).expect("register");
        let entry = registry.get_mut("example").expect("entry");
        let mut adapter = LegacySourceAdapter::new(entry);

        let message = adapter.poll(ts(0)).expect("poll").expect("summary");
        assert!(matches!(message.body, MessageBody::Summary));
        assert_eq!(message.agent_label, "example");
        let event = message.to_event().expect("event");
        assert_eq!(event.event_type(), "sample");
        assert_eq!(event.payload_value("examples"), Some(&json!(["x1"])));

        assert!(matches!(adapter.poll(ts(1)), Err(SourceError::Emit(_))));
        assert!(adapter.poll(ts(2)).expect("poll").is_none());
    }

    #[test]
    fn heartbeat_is_synthetic_and_healthy() {
        let mut registry = SourceRegistry::new();
        registry
            .register(Box::new(ScriptedSource::new(SourceSpec::new("example"))))
            .expect("register");
        let entry = registry.get_mut("example").expect("entry");
        let adapter = LegacySourceAdapter::new(entry);
        let mut metrics = Map::new();
        metrics.insert("consecutive_errors".to_string(), json!(0));

        let heartbeat = adapter.heartbeat(ts(5), metrics);
        assert!(heartbeat.is_heartbeat());
        assert_eq!(heartbeat.health, Some(AgentHealth::Ok));
        assert_eq!(heartbeat.timestamp, ts(5));
        assert_eq!(adapter.label(), "example");
    }
}
