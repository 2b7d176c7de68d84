use crate::aggregator::{AggregationError, SegmentAggregator};
use crate::config::{ConfigError, RuntimeSettings, SourceSettings};
use crate::legacy::{synthetic_heartbeat, LegacySourceAdapter};
use crate::sink::{Sink, SinkError};
use crate::source::{RegistryError, Source, SourceError, SourceRegistry};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use workpulse_agents::{AgentError, AgentManager, AgentSpec, AgentStatus, DEFAULT_SHUTDOWN_GRACE};
use workpulse_core::protocol::{
    version_satisfies, AgentMessage, MessageBody, OrchestratorCommand, ProtocolError,
    ProtocolVersion,
};
use workpulse_core::{
    duration_from_secs_f64, AgentHealth, BackoffPolicy, CooldownError, CooldownTimer, Event,
    ErrorTracker, Scheduler, Segment, SourceSpec,
};

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every failure the runtime can observe, with the fatal/logged policy in
/// [`RuntimeFault::is_fatal`].
#[derive(Debug, Error)]
pub enum RuntimeFault {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("registration error: {0}")]
    Registry(#[from] RegistryError),
    #[error("cooldown error: {0}")]
    Cooldown(#[from] CooldownError),
    #[error("source {label} failed: {source}")]
    Source {
        label: String,
        #[source]
        source: SourceError,
    },
    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("sink {sink} failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },
    #[error("agent {label} failed: {source}")]
    Agent {
        label: String,
        #[source]
        source: AgentError,
    },
    #[error("agent {label} sent an unusable message: {source}")]
    Protocol {
        label: String,
        #[source]
        source: ProtocolError,
    },
}

impl RuntimeFault {
    /// Only setup-time failures may abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Registry(_) | Self::Cooldown(CooldownError::InvalidDuration(_))
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Registry(_) => "registry",
            Self::Cooldown(_) => "cooldown",
            Self::Source { .. } => "source",
            Self::Aggregation(_) => "aggregation",
            Self::Sink { .. } => "sink",
            Self::Agent { .. } => "agent",
            Self::Protocol { .. } => "protocol",
        }
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub segments_closed: usize,
    pub sources_polled: usize,
    pub sources_quarantined: usize,
    pub events_routed: usize,
    pub events_written: usize,
    pub summaries_written: usize,
    pub heartbeats: usize,
    pub flushes_sent: usize,
    pub agents_exited: Vec<String>,
    pub faults: Vec<RuntimeFault>,
}

impl TickReport {
    pub fn has_activity(&self) -> bool {
        self.segments_closed > 0
            || self.events_routed > 0
            || self.summaries_written > 0
            || !self.agents_exited.is_empty()
            || !self.faults.is_empty()
    }

    fn fault(&mut self, fault: RuntimeFault) {
        self.faults.push(fault);
    }
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub flushes_sent: usize,
    pub segment_closed: bool,
    pub agents_stopped: usize,
    pub summaries_written: usize,
    pub faults: Vec<RuntimeFault>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    pub sources: Vec<AgentMessage>,
    pub agents: Vec<AgentStatus>,
}

pub struct RuntimeBuilder {
    cooldown: Duration,
    backoff: BackoffPolicy,
    heartbeat_timeout: Option<Duration>,
    trusted_dirs: Vec<PathBuf>,
    shutdown_grace: std::time::Duration,
    overrides: BTreeMap<String, SourceSettings>,
    sources: Vec<Box<dyn Source>>,
    sinks: Vec<Box<dyn Sink>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            cooldown: Duration::seconds(300),
            backoff: BackoffPolicy::default(),
            heartbeat_timeout: None,
            trusted_dirs: Vec::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            overrides: BTreeMap::new(),
            sources: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

impl RuntimeBuilder {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            cooldown: settings.cooldown(),
            backoff: settings.backoff_policy(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            trusted_dirs: settings.trusted_dirs(),
            shutdown_grace: settings.shutdown_grace(),
            overrides: settings.sources.clone(),
            sources: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn trusted_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.trusted_dirs = dirs;
        self
    }

    pub fn shutdown_grace(mut self, grace: std::time::Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn source(mut self, source: Box<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<Runtime, RuntimeFault> {
        let cooldown = CooldownTimer::new(self.cooldown)?;
        let mut registry = SourceRegistry::new();
        for source in self.sources {
            let spec = source.spec();
            let spec = match self.overrides.get(&spec.label) {
                Some(settings) if !settings.enabled => {
                    info!(event = "source_disabled", label = %spec.label);
                    continue;
                }
                Some(settings) => settings.apply(spec),
                None => spec,
            };
            registry.register_with_spec(spec, source)?;
        }

        Ok(Runtime {
            registry,
            aggregator: SegmentAggregator::new(),
            cooldown,
            scheduler: Scheduler::new(),
            errors: ErrorTracker::new(self.backoff),
            agents: AgentManager::new(self.trusted_dirs).with_shutdown_grace(self.shutdown_grace),
            sinks: self.sinks,
            heartbeat_timeout: self.heartbeat_timeout,
            stale_agents: HashSet::new(),
            heartbeats_received: HashMap::new(),
            rejected_agents: HashSet::new(),
            closed: false,
        })
    }
}

/// The orchestrator: one tick polls due sources, drains every agent and
/// closes the segment once the cooldown has elapsed.
pub struct Runtime {
    registry: SourceRegistry,
    aggregator: SegmentAggregator,
    cooldown: CooldownTimer,
    scheduler: Scheduler,
    errors: ErrorTracker,
    agents: AgentManager,
    sinks: Vec<Box<dyn Sink>>,
    heartbeat_timeout: Option<Duration>,
    stale_agents: HashSet<String>,
    heartbeats_received: HashMap<String, DateTime<Utc>>,
    rejected_agents: HashSet<String>,
    closed: bool,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn cooldown(&self) -> &CooldownTimer {
        &self.cooldown
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut AgentManager {
        &mut self.agents
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn spawn_agent(&mut self, spec: AgentSpec, now: DateTime<Utc>) -> Result<(), RuntimeFault> {
        let label = spec.label.clone();
        self.agents
            .spawn_agent(spec, now)
            .map_err(|source| RuntimeFault::Agent { label, source })
    }

    /// Spawns each agent independently; failures are logged and skipped.
    pub fn spawn_agents(&mut self, specs: Vec<AgentSpec>, now: DateTime<Utc>) -> usize {
        let mut spawned = 0;
        for spec in specs {
            let label = spec.label.clone();
            match self.spawn_agent(spec, now) {
                Ok(()) => spawned += 1,
                Err(err) => warn!(event = "agent_spawn_failed", label = %label, error = %err),
            }
        }
        spawned
    }

    /// Changes a source's poll interval and makes it due on the next tick.
    pub fn set_poll_interval(&mut self, label: &str, secs: f64) -> bool {
        let Some(interval) = duration_from_secs_f64(secs).filter(|d| *d > Duration::zero()) else {
            return false;
        };
        if !self.registry.set_poll_interval(label, interval) {
            return false;
        }
        self.scheduler.reset(label);
        info!(event = "source_rescheduled", label = %label, interval_s = secs);
        true
    }

    pub async fn request_status(&mut self) -> usize {
        let mut sent = 0;
        for label in self.agents.labels() {
            match self
                .agents
                .send_command(&label, &OrchestratorCommand::status())
                .await
            {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(err) => warn!(event = "agent_command_failed", label = %label, error = %err),
            }
        }
        sent
    }

    pub fn health_snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let sources = self
            .registry
            .iter()
            .map(|entry| {
                let label = entry.label();
                let quarantined = self.errors.is_quarantined(label, now);
                let mut metrics = Map::new();
                metrics.insert(
                    "consecutive_errors".to_string(),
                    json!(self.errors.consecutive_errors(label)),
                );
                metrics.insert("quarantined".to_string(), json!(quarantined));
                if let Some(until) = self.errors.quarantined_until(label).filter(|_| quarantined) {
                    metrics.insert("quarantined_until".to_string(), json!(until.to_rfc3339()));
                }
                let health = if quarantined {
                    AgentHealth::Degraded
                } else {
                    AgentHealth::Ok
                };
                synthetic_heartbeat(entry, now, metrics, health)
            })
            .collect();
        HealthSnapshot {
            taken_at: now,
            sources,
            agents: self.agents.statuses(),
        }
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if self.closed {
            return report;
        }

        if self.cooldown.check_expiration(now) {
            self.close_segment(&mut report.faults, &mut report.segments_closed);
        }
        self.poll_sources(now, &mut report);
        self.service_agents(now, &mut report).await;
        self.check_heartbeats(now);

        if report.has_activity() {
            debug!(
                event = "tick",
                segments_closed = report.segments_closed,
                events_routed = report.events_routed,
                summaries_written = report.summaries_written,
                faults = report.faults.len()
            );
        }
        report
    }

    /// Ticks every `interval` until `stop` resolves, then shuts down.
    pub async fn run_until<F>(&mut self, interval: std::time::Duration, stop: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        self.shutdown(Utc::now()).await
    }

    /// Flushes agents, closes any open segment, stops every agent and closes
    /// the sinks. Each phase runs even if an earlier one failed.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.closed {
            return report;
        }
        info!(event = "runtime_shutdown", agents = self.agents.len());

        for label in self.agents.labels() {
            match self
                .agents
                .send_command(&label, &OrchestratorCommand::flush())
                .await
            {
                Ok(true) => report.flushes_sent += 1,
                Ok(false) => {}
                Err(source) => {
                    warn!(event = "agent_command_failed", label = %label, error = %source);
                    report.faults.push(RuntimeFault::Agent { label, source });
                }
            }
        }

        if self.cooldown.is_open() {
            let mut closed = 0;
            self.close_segment(&mut report.faults, &mut closed);
            report.segment_closed = closed > 0;
        }

        for (label, messages) in self.agents.shutdown_all().await {
            report.agents_stopped += 1;
            for message in messages {
                if self.route_final_message(&label, message, &mut report.faults) {
                    report.summaries_written += 1;
                }
            }
        }

        for sink in &mut self.sinks {
            if let Err(source) = sink.close() {
                warn!(event = "sink_close_failed", sink = %sink.name(), error = %source);
                report.faults.push(RuntimeFault::Sink {
                    sink: sink.name().to_string(),
                    source,
                });
            }
        }

        self.closed = true;
        debug!(event = "runtime_stopped", at = %now, faults = report.faults.len());
        report
    }

    fn close_segment(&mut self, faults: &mut Vec<RuntimeFault>, closed: &mut usize) {
        let state = match self.cooldown.close_segment() {
            Ok(state) => state,
            Err(err) => {
                warn!(event = "segment_close_failed", error = %err);
                self.aggregator.clear();
                faults.push(err.into());
                return;
            }
        };
        match self.aggregator.build_segment(state, &self.registry) {
            Ok(segment) => {
                info!(
                    event = "segment_closed",
                    start = %segment.start,
                    duration_s = segment.duration_s,
                    events = segment.events.len(),
                    resets = segment.resets_count
                );
                write_segment(&mut self.sinks, &segment, faults);
                *closed += 1;
            }
            Err(err) => {
                warn!(event = "aggregation_failed", header = %err.header(), error = %err);
                self.aggregator.clear();
                faults.push(err.into());
            }
        }
    }

    fn poll_sources(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        for label in self.registry.labels() {
            if self.errors.is_quarantined(&label, now) {
                report.sources_quarantined += 1;
                continue;
            }
            let Some(entry) = self.registry.get_mut(&label) else {
                continue;
            };
            if !self
                .scheduler
                .should_poll(&label, entry.spec().poll_interval, now)
            {
                continue;
            }
            report.sources_polled += 1;
            let polled = LegacySourceAdapter::new(entry).poll(now);
            match polled {
                Ok(Some(message)) => {
                    self.errors.record_success(&label);
                    self.route_source_message(&label, message, report);
                }
                Ok(None) => self.errors.record_success(&label),
                Err(source) => {
                    let until = self.errors.record_error(&label, now);
                    warn!(
                        event = "source_emit_failed",
                        label = %label,
                        consecutive = self.errors.consecutive_errors(&label),
                        quarantined_until = %until,
                        error = %source
                    );
                    report.fault(RuntimeFault::Source { label, source });
                }
            }
        }
    }

    fn route_source_message(&mut self, label: &str, message: AgentMessage, report: &mut TickReport) {
        let Some(spec) = self.registry.spec(label).cloned() else {
            return;
        };
        match message.to_event() {
            Ok(event) => self.route_event(&spec, event, report),
            Err(source) => report.fault(RuntimeFault::Protocol {
                label: label.to_string(),
                source,
            }),
        }
    }

    fn route_event(&mut self, spec: &SourceSpec, event: Event, report: &mut TickReport) {
        report.events_routed += 1;
        if spec.infrequent {
            write_event(&mut self.sinks, &event.with_computed_id(), &mut report.faults);
            report.events_written += 1;
            return;
        }
        if spec.resets_cooldown {
            if self.cooldown.on_resetting_event(event.timestamp()) {
                info!(event = "segment_opened", label = %spec.label, at = %event.timestamp());
            }
        } else {
            self.cooldown.on_non_resetting_event(event.timestamp());
        }
        if self.cooldown.is_open() {
            self.aggregator.add_event(&event, &self.registry);
        }
    }

    async fn service_agents(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        for (label, status) in self.agents.poll_exits() {
            warn!(
                event = "agent_exited",
                label = %label,
                exit_code = status.code().unwrap_or(-1)
            );
            report.agents_exited.push(label);
        }

        for label in self.agents.labels() {
            let flush_due = self
                .agents
                .get(&label)
                .map(|handle| !handle.has_exited() && handle.flush_due(now))
                .unwrap_or(false);
            if flush_due {
                match self
                    .agents
                    .send_command(&label, &OrchestratorCommand::flush())
                    .await
                {
                    Ok(sent) => {
                        if sent {
                            report.flushes_sent += 1;
                        }
                        if let Some(handle) = self.agents.get_mut(&label) {
                            handle.mark_flushed(now);
                        }
                    }
                    Err(source) => {
                        warn!(event = "agent_command_failed", label = %label, error = %source);
                        report.fault(RuntimeFault::Agent {
                            label: label.clone(),
                            source,
                        });
                    }
                }
            }

            for message in self.agents.drain_messages(&label) {
                self.dispatch_agent_message(&label, message, now, report).await;
            }
        }
    }

    async fn dispatch_agent_message(
        &mut self,
        label: &str,
        message: AgentMessage,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        match &message.body {
            MessageBody::Handshake {
                min_app_version,
                capabilities,
            } => {
                let verdict = negotiate(message.protocol_version, min_app_version);
                let agent_id = if message.agent_id.trim().is_empty() {
                    message.agent_label.clone()
                } else {
                    message.agent_id.clone()
                };
                let (command, health) = match &verdict {
                    Ok(()) => {
                        info!(
                            event = "agent_handshake",
                            label = %label,
                            agent_id = %agent_id,
                            agent_version = %message.agent_version,
                            capabilities = ?capabilities
                        );
                        self.rejected_agents.remove(label);
                        (OrchestratorCommand::ack(&agent_id), AgentHealth::Ok)
                    }
                    Err(reason) => {
                        warn!(event = "agent_rejected", label = %label, reason = %reason);
                        self.rejected_agents.insert(label.to_string());
                        (OrchestratorCommand::reject(reason.clone()), AgentHealth::Failed)
                    }
                };
                if let Some(handle) = self.agents.get_mut(label) {
                    handle.set_agent_id(agent_id);
                    handle.set_health(health);
                }
                if let Err(source) = self.agents.send_command(label, &command).await {
                    warn!(event = "agent_command_failed", label = %label, error = %source);
                    report.fault(RuntimeFault::Agent {
                        label: label.to_string(),
                        source,
                    });
                }
            }
            MessageBody::Heartbeat { metrics } => {
                report.heartbeats += 1;
                self.stale_agents.remove(label);
                self.heartbeats_received.insert(label.to_string(), now);
                let rejected = self.rejected_agents.contains(label);
                if let Some(handle) = self.agents.get_mut(label) {
                    if !rejected && !handle.has_exited() {
                        handle.set_health(message.health.unwrap_or(AgentHealth::Ok));
                    }
                }
                debug!(event = "agent_heartbeat", label = %label, metrics = ?metrics);
            }
            MessageBody::Summary => {
                if self.rejected_agents.contains(label) {
                    debug!(event = "summary_dropped", label = %label, reason = "rejected");
                    return;
                }
                if route_summary(&mut self.sinks, label, &message, &mut report.faults) {
                    report.summaries_written += 1;
                }
            }
            MessageBody::Status => {
                let rejected = self.rejected_agents.contains(label);
                if let (Some(health), Some(handle)) = (message.health, self.agents.get_mut(label)) {
                    if !rejected && !handle.has_exited() {
                        handle.set_health(health);
                    }
                }
                info!(
                    event = "agent_status",
                    label = %label,
                    health = message.health.map(AgentHealth::as_str).unwrap_or("unknown"),
                    message = message.message.as_deref().unwrap_or("")
                );
            }
            MessageBody::Error => {
                warn!(
                    event = "agent_error",
                    label = %label,
                    message = message.message.as_deref().unwrap_or("")
                );
            }
        }
    }

    fn route_final_message(
        &mut self,
        label: &str,
        message: AgentMessage,
        faults: &mut Vec<RuntimeFault>,
    ) -> bool {
        match message.body {
            MessageBody::Summary if !self.rejected_agents.contains(label) => {
                route_summary(&mut self.sinks, label, &message, faults)
            }
            MessageBody::Error => {
                warn!(
                    event = "agent_error",
                    label = %label,
                    message = message.message.as_deref().unwrap_or("")
                );
                false
            }
            _ => {
                debug!(event = "final_message_ignored", label = %label, kind = message.kind());
                false
            }
        }
    }

    fn check_heartbeats(&mut self, now: DateTime<Utc>) {
        let Some(timeout) = self.heartbeat_timeout else {
            return;
        };
        for label in self.agents.labels() {
            if self.rejected_agents.contains(&label) || self.stale_agents.contains(&label) {
                continue;
            }
            let Some(handle) = self.agents.get_mut(&label) else {
                continue;
            };
            if handle.has_exited() {
                continue;
            }
            // Judged on the runtime clock; the agent's own timestamps may drift.
            let reference = self
                .heartbeats_received
                .get(&label)
                .copied()
                .unwrap_or_else(|| handle.spawned_at());
            if now - reference > timeout {
                handle.set_health(AgentHealth::Degraded);
                warn!(
                    event = "agent_heartbeat_missed",
                    label = %label,
                    last_heartbeat = %reference
                );
                self.stale_agents.insert(label);
            }
        }
    }
}

fn negotiate(protocol_version: ProtocolVersion, min_app_version: &str) -> Result<(), String> {
    if !protocol_version.is_compatible() {
        return Err(format!(
            "protocol version {protocol_version} is not supported (expected {})",
            ProtocolVersion::CURRENT
        ));
    }
    if !version_satisfies(APP_VERSION, min_app_version) {
        return Err(format!(
            "orchestrator {APP_VERSION} is older than required {min_app_version}"
        ));
    }
    Ok(())
}

fn route_summary(
    sinks: &mut [Box<dyn Sink>],
    label: &str,
    message: &AgentMessage,
    faults: &mut Vec<RuntimeFault>,
) -> bool {
    let attributed = if message.agent_label == label {
        message.to_event()
    } else {
        warn!(
            event = "summary_label_mismatch",
            label = %label,
            claimed = %message.agent_label
        );
        let mut owned = message.clone();
        owned.agent_label = label.to_string();
        owned.to_event()
    };
    match attributed {
        Ok(event) => {
            write_event(sinks, &event.with_computed_id(), faults);
            true
        }
        Err(source) => {
            warn!(event = "summary_invalid", label = %label, error = %source);
            faults.push(RuntimeFault::Protocol {
                label: label.to_string(),
                source,
            });
            false
        }
    }
}

fn write_segment(sinks: &mut [Box<dyn Sink>], segment: &Segment, faults: &mut Vec<RuntimeFault>) {
    for sink in sinks.iter_mut() {
        let written = sink.write_segment(segment);
        persist(&mut **sink, written, faults);
    }
}

fn write_event(sinks: &mut [Box<dyn Sink>], event: &Event, faults: &mut Vec<RuntimeFault>) {
    for sink in sinks.iter_mut() {
        let written = sink.write_event(event);
        persist(&mut **sink, written, faults);
    }
}

/// Every successful write is flushed before the next sink is visited.
fn persist(sink: &mut dyn Sink, written: Result<(), SinkError>, faults: &mut Vec<RuntimeFault>) {
    let result = written.and_then(|()| sink.flush());
    if let Err(source) = result {
        warn!(event = "sink_write_failed", sink = %sink.name(), error = %source);
        faults.push(RuntimeFault::Sink {
            sink: sink.name().to_string(),
            source,
        });
    }
}
