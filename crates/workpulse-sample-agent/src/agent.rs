use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use workpulse_core::protocol::{AgentMessage, CommandKind, MessageBody, OrchestratorCommand};
use workpulse_core::{duration_secs, AgentHealth};

pub const SAMPLES_HEADER: &str = "samples";
pub const SAMPLE_BATCH_EVENT: &str = "sample_batch";
pub const MIN_APP_VERSION: &str = "0.1.0";

/// What the IO loop should do after a command.
#[derive(Debug, Default)]
pub struct Reply {
    pub messages: Vec<AgentMessage>,
    pub exit: bool,
}

pub struct SampleAgent {
    label: String,
    agent_id: String,
    started: DateTime<Utc>,
    taken: u64,
    pending: Vec<Value>,
}

impl SampleAgent {
    pub fn new(label: impl Into<String>, agent_id: impl Into<String>, started: DateTime<Utc>) -> Self {
        Self {
            label: label.into(),
            agent_id: agent_id.into(),
            started,
            taken: 0,
            pending: Vec::new(),
        }
    }

    fn message(&self, now: DateTime<Utc>, body: MessageBody) -> AgentMessage {
        let mut message = AgentMessage::new(self.label.clone(), now, body);
        message.agent_id = self.agent_id.clone();
        message.agent_version = env!("CARGO_PKG_VERSION").to_string();
        message
    }

    pub fn handshake(&self, now: DateTime<Utc>) -> AgentMessage {
        self.message(
            now,
            MessageBody::Handshake {
                min_app_version: MIN_APP_VERSION.to_string(),
                capabilities: vec!["flush".to_string(), "status".to_string()],
            },
        )
    }

    fn uptime_secs(&self, now: DateTime<Utc>) -> f64 {
        duration_secs(now - self.started).max(0.0)
    }

    /// Takes one synthetic sample and reports it in a heartbeat.
    pub fn sample_and_heartbeat(&mut self, now: DateTime<Utc>) -> AgentMessage {
        self.taken += 1;
        let uptime = self.uptime_secs(now);
        self.pending.push(json!({
            "seq": self.taken,
            "uptime_s": uptime,
        }));

        let mut metrics = Map::new();
        metrics.insert("uptime_s".to_string(), json!(uptime));
        metrics.insert("samples".to_string(), json!(self.taken));
        let mut message = self.message(now, MessageBody::Heartbeat { metrics });
        message.health = Some(AgentHealth::Ok);
        message
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn summary(&mut self, now: DateTime<Utc>) -> AgentMessage {
        let samples = std::mem::take(&mut self.pending);
        let mut message = self.message(now, MessageBody::Summary);
        message.event_type = Some(SAMPLE_BATCH_EVENT.to_string());
        message.data.insert(SAMPLES_HEADER.to_string(), Value::Array(samples));
        message
    }

    fn status(&self, now: DateTime<Utc>) -> AgentMessage {
        let mut message = self.message(now, MessageBody::Status);
        message.health = Some(AgentHealth::Ok);
        message.message = Some(format!(
            "{} samples taken, {} pending",
            self.taken,
            self.pending.len()
        ));
        message
    }

    pub fn handle(&mut self, command: &OrchestratorCommand, now: DateTime<Utc>) -> Reply {
        let mut reply = Reply::default();
        match command.cmd {
            CommandKind::Ack => info!(event = "handshake_acked", label = %self.label),
            CommandKind::Reject => {
                let reason = command
                    .args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");
                warn!(event = "handshake_rejected", label = %self.label, reason = %reason);
            }
            CommandKind::Flush => reply.messages.push(self.summary(now)),
            CommandKind::Status => reply.messages.push(self.status(now)),
            CommandKind::Shutdown => {
                if !self.pending.is_empty() {
                    reply.messages.push(self.summary(now));
                }
                reply.exit = true;
            }
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    fn agent() -> SampleAgent {
        SampleAgent::new("sampler", "sampler-1", ts(0))
    }

    #[test]
    fn handshake_is_valid_and_compatible() {
        let handshake = agent().handshake(ts(0));
        handshake.validate().expect("valid");
        assert_eq!(handshake.kind(), "handshake");
        assert_eq!(handshake.agent_id, "sampler-1");
        assert!(handshake.protocol_version.is_compatible());
    }

    #[test]
    fn heartbeat_reports_uptime_and_sample_count() {
        let mut agent = agent();
        agent.sample_and_heartbeat(ts(1_000));
        let heartbeat = agent.sample_and_heartbeat(ts(2_500));
        let MessageBody::Heartbeat { metrics } = &heartbeat.body else {
            panic!("expected heartbeat, got {}", heartbeat.kind());
        };
        assert_eq!(metrics.get("uptime_s"), Some(&json!(2.5)));
        assert_eq!(metrics.get("samples"), Some(&json!(2)));
        assert_eq!(agent.pending(), 2);
    }

    #[test]
    fn flush_drains_pending_samples_into_a_summary() {
        let mut agent = agent();
        agent.sample_and_heartbeat(ts(1_000));
        let reply = agent.handle(&OrchestratorCommand::flush(), ts(2_000));
        assert!(!reply.exit);
        assert_eq!(reply.messages.len(), 1);
        let event = reply.messages[0].to_event().expect("summary converts");
        assert_eq!(event.event_type(), SAMPLE_BATCH_EVENT);
        assert_eq!(
            event.payload_value(SAMPLES_HEADER),
            Some(&json!([{"seq": 1, "uptime_s": 1.0}]))
        );
        assert_eq!(agent.pending(), 0);
    }

    #[test]
    fn status_and_shutdown_replies() {
        let mut agent = agent();
        let status = agent.handle(&OrchestratorCommand::status(), ts(0));
        assert_eq!(status.messages[0].kind(), "status");
        assert_eq!(status.messages[0].health, Some(AgentHealth::Ok));

        let idle = agent.handle(&OrchestratorCommand::shutdown(), ts(1));
        assert!(idle.exit);
        assert!(idle.messages.is_empty());

        agent.sample_and_heartbeat(ts(2));
        let busy = agent.handle(&OrchestratorCommand::shutdown(), ts(3));
        assert!(busy.exit);
        assert_eq!(busy.messages[0].kind(), "summary");
    }

    #[test]
    fn ack_and_reject_produce_no_output() {
        let mut agent = agent();
        assert!(agent.handle(&OrchestratorCommand::ack("sampler-1"), ts(0)).messages.is_empty());
        let reply = agent.handle(&OrchestratorCommand::reject("too old"), ts(0));
        assert!(reply.messages.is_empty());
        assert!(!reply.exit);
    }
}
