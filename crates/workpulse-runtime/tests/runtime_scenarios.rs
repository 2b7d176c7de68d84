use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use workpulse_core::{AgentHealth, CooldownPhase, Event, Payload, SourceSpec};
use workpulse_runtime::filters;
use workpulse_runtime::{MemorySink, Runtime, Source, SourceError};

fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
        .single()
        .expect("valid test timestamp")
}

/// Emits one queued payload per poll, stamped with the poll time.
struct QueueSource {
    spec: SourceSpec,
    payloads: VecDeque<Payload>,
}

impl QueueSource {
    fn new(spec: SourceSpec, payloads: Vec<Value>) -> Self {
        let payloads = payloads
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        Self { spec, payloads }
    }
}

impl Source for QueueSource {
    fn spec(&self) -> SourceSpec {
        self.spec.clone()
    }

    fn emit_event(&mut self, now: DateTime<Utc>) -> Result<Option<Event>, SourceError> {
        let Some(payload) = self.payloads.pop_front() else {
            return Ok(None);
        };
        Ok(Some(Event::new(self.spec.label.clone(), "example", now)?.with_payload(payload)))
    }

    fn filter(&self, values: Vec<Value>) -> Result<Value, SourceError> {
        Ok(filters::dedupe_sorted(values))
    }
}

#[tokio::test]
async fn resetting_source_closes_one_aggregated_segment() {
    let source = QueueSource::new(
        SourceSpec::new("example")
            .with_data_header("examples")
            .resetting(true),
        vec![json!({"examples": ["x1"]}), json!({"examples": ["x2", "x1"]})],
    );
    let memory = MemorySink::new();
    let mut runtime = Runtime::builder()
        .cooldown(Duration::seconds(10))
        .source(Box::new(source))
        .sink(Box::new(memory.clone()))
        .build()
        .expect("runtime");

    runtime.tick(ts(0)).await;
    assert_eq!(runtime.cooldown().phase(), CooldownPhase::Active);
    runtime.tick(ts(3_000)).await;
    let report = runtime.tick(ts(12_999)).await;
    assert_eq!(report.segments_closed, 0);

    let report = runtime.tick(ts(13_000)).await;
    assert_eq!(report.segments_closed, 1);
    assert!(report.faults.is_empty());

    let segments = memory.segments();
    assert_eq!(segments.len(), 1);
    let segment = &segments[0];
    assert_eq!(segment.aggregated.get("examples"), Some(&json!(["x1", "x2"])));
    assert_eq!(segment.resets_count, 1);
    assert_eq!(segment.duration_s, 3.0);
    assert_eq!(segment.start, ts(0));
    assert_eq!(segment.end, ts(3_000));
    assert_eq!(segment.events.len(), 2);
    assert!(memory.events().is_empty());
    assert_eq!(runtime.cooldown().phase(), CooldownPhase::Idle);
}

#[tokio::test]
async fn open_segment_is_closed_on_shutdown() {
    let source = QueueSource::new(
        SourceSpec::new("example")
            .with_data_header("examples")
            .resetting(true),
        vec![json!({"examples": ["only"]})],
    );
    let memory = MemorySink::new();
    let mut runtime = Runtime::builder()
        .cooldown(Duration::seconds(300))
        .source(Box::new(source))
        .sink(Box::new(memory.clone()))
        .build()
        .expect("runtime");

    runtime.tick(ts(0)).await;
    let report = runtime.shutdown(ts(1_000)).await;
    assert!(report.segment_closed);
    assert!(report.faults.is_empty());
    assert!(runtime.is_closed());
    let records = memory.snapshot();
    assert_eq!(records.segments.len(), 1);
    assert!(records.closed);
}

#[cfg(unix)]
mod agents {
    use super::*;
    use std::fs;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use workpulse_agents::AgentSpec;
    use workpulse_core::protocol::OrchestratorCommand;
    use workpulse_runtime::TickReport;

    const HANDSHAKE: &str = r#"{"type":"handshake","timestamp":"2026-02-07T21:00:00Z","agent_id":"sampler-1","agent_label":"sampler","agent_version":"0.1.0","protocol_version":"1","min_app_version":"0.0.1","capabilities":["flush","status"]}"#;
    const HEARTBEAT: &str = r#"{"type":"heartbeat","timestamp":"2026-02-07T21:00:01Z","agent_label":"sampler","metrics":{"samples":1},"health":"ok"}"#;
    const SUMMARY: &str = r#"{"type":"summary","timestamp":"2026-02-07T21:00:02Z","agent_label":"sampler","event_type":"sample_summary","data":{"samples":[1,2]}}"#;

    const STALE_CLOCK_HEARTBEAT: &str = r#"{"type":"heartbeat","timestamp":"2020-01-01T00:00:00Z","agent_label":"sampler","metrics":{},"health":"ok"}"#;
    const FOREIGN_SUMMARY: &str = r#"{"type":"summary","timestamp":"2026-02-07T21:00:02Z","agent_label":"file_changes","event_type":"file_change","data":{"files":["/etc/passwd"]}}"#;

    fn script(body: &str) -> String {
        format!(
            "{body}\nwhile read -r line; do\n  case \"$line\" in\n    *shutdown*) exit 0 ;;\n    *flush*) echo '{SUMMARY}' ;;\n    *status*) echo '{HEARTBEAT}' ;;\n  esac\ndone\n"
        )
    }

    fn runtime_with_agent(dir: &TempDir, body: &str, memory: &MemorySink) -> Runtime {
        fs::write(dir.path().join("sampler.sh"), script(body)).expect("write script");
        let mut runtime = Runtime::builder()
            .trusted_dirs(vec![dir.path().to_path_buf()])
            .shutdown_grace(StdDuration::from_millis(500))
            .heartbeat_timeout(Some(Duration::seconds(5)))
            .sink(Box::new(memory.clone()))
            .build()
            .expect("runtime");
        runtime
            .spawn_agent(
                AgentSpec::new("sampler", "sampler.sh")
                    .with_interpreter("/bin/sh")
                    .flush_every(Duration::hours(1)),
                ts(0),
            )
            .expect("spawn");
        runtime
    }

    async fn tick_until<F>(runtime: &mut Runtime, at: DateTime<Utc>, mut done: F) -> Vec<TickReport>
    where
        F: FnMut(&[TickReport]) -> bool,
    {
        let mut reports = Vec::new();
        for _ in 0..250 {
            reports.push(runtime.tick(at).await);
            if done(&reports) {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        reports
    }

    fn health(runtime: &Runtime) -> Option<AgentHealth> {
        runtime.agents().get("sampler").map(|handle| handle.health())
    }

    #[tokio::test]
    async fn heartbeats_are_never_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let body = format!(
            "echo '{HANDSHAKE}'\nread -r reply\ncase \"$reply\" in *ack*) ;; *) exit 1 ;; esac\necho '{HEARTBEAT}'\necho '{HEARTBEAT}'"
        );
        let mut runtime = runtime_with_agent(&dir, &body, &memory);

        let reports = tick_until(&mut runtime, ts(1_000), |reports| {
            reports.iter().map(|report| report.heartbeats).sum::<usize>() >= 2
        })
        .await;
        let heartbeats: usize = reports.iter().map(|report| report.heartbeats).sum();
        assert_eq!(heartbeats, 2);
        assert_eq!(health(&runtime), Some(AgentHealth::Ok));
        assert_eq!(
            runtime.agents().get("sampler").and_then(|handle| handle.agent_id()),
            Some("sampler-1")
        );
        assert!(memory.events().is_empty());
        assert!(memory.segments().is_empty());

        let shutdown = tokio::time::timeout(StdDuration::from_secs(5), runtime.shutdown(ts(2_000)))
            .await
            .expect("shutdown finished");
        assert_eq!(shutdown.agents_stopped, 1);
        // The shutdown flush is answered with a summary, which is the only write.
        assert_eq!(shutdown.summaries_written, 1);
        assert_eq!(memory.events().len(), 1);
    }

    #[tokio::test]
    async fn flush_summary_reaches_the_sink_with_an_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let mut runtime = runtime_with_agent(&dir, &format!("echo '{HANDSHAKE}'"), &memory);

        // Flush interval is one hour past the spawn time.
        let reports = tick_until(&mut runtime, ts(3_600_000), |reports| {
            reports.iter().map(|report| report.summaries_written).sum::<usize>() >= 1
        })
        .await;
        assert_eq!(reports.iter().map(|report| report.flushes_sent).sum::<usize>(), 1);

        let events = memory.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "sampler");
        assert_eq!(events[0].event_type(), "sample_summary");
        assert_eq!(events[0].payload_value("samples"), Some(&json!([1, 2])));
        assert!(events[0].id().is_some());
        runtime.shutdown(ts(3_601_000)).await;
    }

    #[tokio::test]
    async fn crashed_agent_is_reported_once_and_not_respawned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let mut runtime = runtime_with_agent(&dir, &format!("echo '{HEARTBEAT}'\nexit 7"), &memory);

        let reports = tick_until(&mut runtime, ts(1_000), |reports| {
            reports.iter().any(|report| !report.agents_exited.is_empty())
        })
        .await;
        let exits: Vec<&String> = reports
            .iter()
            .flat_map(|report| report.agents_exited.iter())
            .collect();
        assert_eq!(exits, vec!["sampler"]);
        assert!(runtime.tick(ts(2_000)).await.agents_exited.is_empty());
        assert_eq!(health(&runtime), Some(AgentHealth::Failed));

        let sent = runtime
            .agents_mut()
            .send_command("sampler", &OrchestratorCommand::flush())
            .await
            .expect("command to exited agent");
        assert!(!sent);
        assert_eq!(runtime.request_status().await, 0);

        let snapshot = runtime.health_snapshot(ts(2_000));
        assert_eq!(snapshot.agents.len(), 1);
        assert!(snapshot.agents[0].exited);
        assert_eq!(snapshot.agents[0].exit_code, Some(7));

        tokio::time::timeout(StdDuration::from_secs(5), runtime.shutdown(ts(3_000)))
            .await
            .expect("shutdown finished");
        assert!(runtime.agents().is_empty());
        assert!(memory.events().is_empty());
    }

    #[tokio::test]
    async fn incompatible_agent_is_rejected_and_its_summaries_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let handshake = HANDSHAKE.replace("\"min_app_version\":\"0.0.1\"", "\"min_app_version\":\"999.0\"");
        let body = format!(
            "echo '{handshake}'\nread -r reply\ncase \"$reply\" in *reject*) echo '{SUMMARY}' ;; esac"
        );
        let mut runtime = runtime_with_agent(&dir, &body, &memory);

        for _ in 0..250 {
            runtime.tick(ts(1_000)).await;
            if health(&runtime) == Some(AgentHealth::Failed) {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert_eq!(health(&runtime), Some(AgentHealth::Failed));
        for _ in 0..10 {
            runtime.tick(ts(1_000)).await;
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert!(memory.events().is_empty());
        runtime.shutdown(ts(2_000)).await;
        assert!(memory.events().is_empty());
    }

    #[tokio::test]
    async fn silent_agent_is_degraded_until_it_heartbeats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let mut runtime = runtime_with_agent(&dir, ":", &memory);

        runtime.tick(ts(4_000)).await;
        assert_eq!(health(&runtime), Some(AgentHealth::Starting));
        runtime.tick(ts(6_000)).await;
        assert_eq!(health(&runtime), Some(AgentHealth::Degraded));

        assert_eq!(runtime.request_status().await, 1);
        tick_until(&mut runtime, ts(7_000), |reports| {
            reports.iter().any(|report| report.heartbeats > 0)
        })
        .await;
        assert_eq!(health(&runtime), Some(AgentHealth::Ok));
        assert!(memory.events().is_empty());
        runtime.shutdown(ts(8_000)).await;
    }

    #[tokio::test]
    async fn summaries_are_attributed_to_the_registered_label() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let body = format!("echo '{HANDSHAKE}'\necho '{FOREIGN_SUMMARY}'");
        let mut runtime = runtime_with_agent(&dir, &body, &memory);

        tick_until(&mut runtime, ts(1_000), |reports| {
            reports.iter().map(|report| report.summaries_written).sum::<usize>() >= 1
        })
        .await;
        let events = memory.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "sampler");
        assert_eq!(events[0].event_type(), "file_change");
        runtime.shutdown(ts(2_000)).await;
    }

    #[tokio::test]
    async fn agent_clock_skew_does_not_mark_it_degraded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = MemorySink::new();
        let body = format!("echo '{STALE_CLOCK_HEARTBEAT}'");
        let mut runtime = runtime_with_agent(&dir, &body, &memory);

        tick_until(&mut runtime, ts(1_000), |reports| {
            reports.iter().any(|report| report.heartbeats > 0)
        })
        .await;
        assert_eq!(health(&runtime), Some(AgentHealth::Ok));
        runtime.tick(ts(4_000)).await;
        assert_eq!(health(&runtime), Some(AgentHealth::Ok));
        runtime.tick(ts(7_000)).await;
        assert_eq!(health(&runtime), Some(AgentHealth::Degraded));
        runtime.shutdown(ts(8_000)).await;
    }
}
