pub mod trust;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workpulse_core::protocol::{
    encode_frame, AgentMessage, DecodeReport, FrameError, NdjsonFrameDecoder,
    OrchestratorCommand, DEFAULT_MAX_FRAME_BYTES,
};
use workpulse_core::{validate_label, AgentHealth, EventError};

pub use trust::resolve_trusted_script;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FLUSH_INTERVAL_SECS: i64 = 60;
pub const AGENT_LABEL_ENV: &str = "WORKPULSE_AGENT_LABEL";

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent label: {0}")]
    InvalidLabel(#[from] EventError),
    #[error("agent already registered: {0}")]
    DuplicateLabel(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("agent script is outside the trusted directories: {}", .0.display())]
    UntrustedPath(PathBuf),
    #[error("agent script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("failed to spawn agent {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode command: {0}")]
    Encode(#[from] FrameError),
    #[error("agent io failed: {0}")]
    Io(#[from] io::Error),
}

/// How to launch one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub label: String,
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub flush_interval: ChronoDuration,
}

impl AgentSpec {
    pub fn new(label: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            script: script.into(),
            interpreter: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            flush_interval: ChronoDuration::seconds(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn flush_every(mut self, interval: ChronoDuration) -> Self {
        self.flush_interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub label: String,
    pub agent_id: Option<String>,
    pub pid: Option<u32>,
    pub health: AgentHealth,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub exited: bool,
    pub exit_code: Option<i32>,
}

/// Runtime state for one spawned agent. The inbound queue is fed only by the
/// agent's reader task and drained only through the manager.
pub struct AgentHandle {
    spec: AgentSpec,
    script: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    inbox: mpsc::UnboundedReceiver<AgentMessage>,
    reader: Option<JoinHandle<()>>,
    stderr_drain: Option<JoinHandle<()>>,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    agent_id: Option<String>,
    health: AgentHealth,
    last_heartbeat: Option<DateTime<Utc>>,
    last_flush: DateTime<Utc>,
    exit_status: Option<ExitStatus>,
    exit_reported: bool,
}

impl AgentHandle {
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn script(&self) -> &PathBuf {
        &self.script
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn set_agent_id(&mut self, agent_id: impl Into<String>) {
        self.agent_id = Some(agent_id.into());
    }

    pub fn health(&self) -> AgentHealth {
        self.health
    }

    pub fn set_health(&mut self, health: AgentHealth) {
        self.health = health;
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    pub fn last_flush(&self) -> DateTime<Utc> {
        self.last_flush
    }

    pub fn flush_due(&self, now: DateTime<Utc>) -> bool {
        now - self.last_flush >= self.spec.flush_interval
    }

    pub fn mark_flushed(&mut self, now: DateTime<Utc>) {
        self.last_flush = now;
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status.is_some()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            label: self.spec.label.clone(),
            agent_id: self.agent_id.clone(),
            pid: self.pid,
            health: self.health,
            spawned_at: self.spawned_at,
            last_heartbeat: self.last_heartbeat,
            exited: self.exit_status.is_some(),
            exit_code: self.exit_status.and_then(|status| status.code()),
        }
    }

    fn observe(&mut self, message: &AgentMessage) {
        if message.is_heartbeat() {
            let newer = self
                .last_heartbeat
                .map(|last| message.timestamp > last)
                .unwrap_or(true);
            if newer {
                self.last_heartbeat = Some(message.timestamp);
            }
        }
    }

    fn refresh_exit(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    self.health = AgentHealth::Failed;
                    self.stdin = None;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(event = "agent_wait_error", label = %self.spec.label, error = %err);
                }
            }
        }
        self.exit_status
    }

    /// A write that cannot finish within `write_timeout` means the agent has
    /// stopped reading; its stdin is dropped and later commands are no-ops.
    async fn write_command(
        &mut self,
        command: &OrchestratorCommand,
        write_timeout: Duration,
    ) -> Result<bool, AgentError> {
        if self.refresh_exit().is_some() {
            return Ok(false);
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(false);
        };
        let frame = encode_frame(command, DEFAULT_MAX_FRAME_BYTES)?;
        let outcome = tokio::time::timeout(write_timeout, write_frame(stdin, &frame)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event = "agent_stdin_stalled",
                    label = %self.spec.label,
                    cmd = command.cmd.as_str(),
                    timeout_ms = write_timeout.as_millis() as u64
                );
                self.stdin = None;
                return Ok(false);
            }
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!(event = "agent_stdin_closed", label = %self.spec.label);
                self.stdin = None;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Spawns and supervises agent subprocesses in registration order.
pub struct AgentManager {
    trusted_dirs: Vec<PathBuf>,
    shutdown_grace: Duration,
    write_timeout: Duration,
    max_frame_bytes: usize,
    agents: Vec<AgentHandle>,
}

impl AgentManager {
    pub fn new(trusted_dirs: Vec<PathBuf>) -> Self {
        Self {
            trusted_dirs,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            agents: Vec::new(),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn trusted_dirs(&self) -> &[PathBuf] {
        &self.trusted_dirs
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.agents
            .iter()
            .map(|handle| handle.spec.label.clone())
            .collect()
    }

    pub fn get(&self, label: &str) -> Option<&AgentHandle> {
        self.agents.iter().find(|handle| handle.spec.label == label)
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut AgentHandle> {
        self.agents
            .iter_mut()
            .find(|handle| handle.spec.label == label)
    }

    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.agents.iter().map(AgentHandle::status).collect()
    }

    /// Resolves the script inside the trusted directories, launches it with
    /// piped stdio and starts its reader and stderr tasks. Must be called
    /// from within a tokio runtime.
    pub fn spawn_agent(&mut self, spec: AgentSpec, now: DateTime<Utc>) -> Result<(), AgentError> {
        validate_label(&spec.label)?;
        if self.get(&spec.label).is_some() {
            return Err(AgentError::DuplicateLabel(spec.label));
        }
        let script = resolve_trusted_script(&spec.script, &self.trusted_dirs)?;

        let mut command = match &spec.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script);
                command
            }
            None => Command::new(&script),
        };
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env(AGENT_LABEL_ENV, &spec.label)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(parent) = script.parent() {
            command.current_dir(parent);
        }

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            label: spec.label.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let (tx, inbox) = mpsc::unbounded_channel();
        let reader = child.stdout.take().map(|stdout| {
            tokio::spawn(read_agent_stdout(
                spec.label.clone(),
                stdout,
                tx,
                self.max_frame_bytes,
            ))
        });
        let stderr_drain = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_agent_stderr(spec.label.clone(), stderr)));

        info!(
            event = "agent_spawned",
            label = %spec.label,
            pid = pid.unwrap_or_default(),
            script = %script.display()
        );
        self.agents.push(AgentHandle {
            spec,
            script,
            child,
            stdin,
            inbox,
            reader,
            stderr_drain,
            pid,
            spawned_at: now,
            agent_id: None,
            health: AgentHealth::Starting,
            last_heartbeat: None,
            last_flush: now,
            exit_status: None,
            exit_reported: false,
        });
        Ok(())
    }

    /// Writes one command line. Returns `Ok(false)` when the agent has already
    /// exited or closed its stdin; that is not an error.
    pub async fn send_command(
        &mut self,
        label: &str,
        command: &OrchestratorCommand,
    ) -> Result<bool, AgentError> {
        let write_timeout = self.write_timeout;
        let handle = self
            .get_mut(label)
            .ok_or_else(|| AgentError::UnknownAgent(label.to_string()))?;
        let sent = handle.write_command(command, write_timeout).await?;
        if sent {
            debug!(event = "agent_command_sent", label = %label, cmd = command.cmd.as_str());
        }
        Ok(sent)
    }

    /// Non-blocking pop from the agent's inbound queue.
    pub fn read_message(&mut self, label: &str) -> Option<AgentMessage> {
        let handle = self.get_mut(label)?;
        let message = handle.inbox.try_recv().ok()?;
        handle.observe(&message);
        Some(message)
    }

    /// Everything currently queued for the agent, in emission order.
    pub fn drain_messages(&mut self, label: &str) -> Vec<AgentMessage> {
        let mut drained = Vec::new();
        while let Some(message) = self.read_message(label) {
            drained.push(message);
        }
        drained
    }

    pub async fn wait_message(&mut self, label: &str, timeout: Duration) -> Option<AgentMessage> {
        let handle = self.get_mut(label)?;
        let message = tokio::time::timeout(timeout, handle.inbox.recv())
            .await
            .ok()
            .flatten()?;
        handle.observe(&message);
        Some(message)
    }

    /// Agents whose exit has not been reported yet. Each exit is returned once.
    pub fn poll_exits(&mut self) -> Vec<(String, ExitStatus)> {
        let mut exited = Vec::new();
        for handle in &mut self.agents {
            if let Some(status) = handle.refresh_exit() {
                if !handle.exit_reported {
                    handle.exit_reported = true;
                    exited.push((handle.spec.label.clone(), status));
                }
            }
        }
        exited
    }

    /// Stops one agent and returns the messages it queued before exiting.
    pub async fn shutdown(&mut self, label: &str) -> Result<Vec<AgentMessage>, AgentError> {
        let index = self
            .agents
            .iter()
            .position(|handle| handle.spec.label == label)
            .ok_or_else(|| AgentError::UnknownAgent(label.to_string()))?;
        let handle = self.agents.remove(index);
        Ok(stop_agent(handle, self.shutdown_grace, self.write_timeout).await)
    }

    pub async fn shutdown_all(&mut self) -> Vec<(String, Vec<AgentMessage>)> {
        let agents = std::mem::take(&mut self.agents);
        let mut remaining = Vec::with_capacity(agents.len());
        for handle in agents {
            let label = handle.spec.label.clone();
            let messages = stop_agent(handle, self.shutdown_grace, self.write_timeout).await;
            remaining.push((label, messages));
        }
        remaining
    }
}

async fn stop_agent(
    mut handle: AgentHandle,
    grace: Duration,
    write_timeout: Duration,
) -> Vec<AgentMessage> {
    let label = handle.spec.label.clone();
    let shutdown = OrchestratorCommand::shutdown();
    if let Err(err) = handle.write_command(&shutdown, write_timeout).await {
        warn!(event = "agent_shutdown_command_failed", label = %label, error = %err);
    }
    handle.stdin = None;

    let status = match tokio::time::timeout(grace, handle.child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(event = "agent_wait_error", label = %label, error = %err);
            None
        }
        Err(_) => None,
    };
    let status = match status {
        Some(status) => Some(status),
        None => {
            warn!(event = "agent_killed", label = %label, grace_ms = grace.as_millis() as u64);
            if let Err(err) = handle.child.kill().await {
                debug!(event = "agent_kill_error", label = %label, error = %err);
            }
            handle.child.try_wait().ok().flatten()
        }
    };

    for task in [handle.reader.take(), handle.stderr_drain.take()]
        .into_iter()
        .flatten()
    {
        let mut task = task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }

    let mut remaining = Vec::new();
    while let Ok(message) = handle.inbox.try_recv() {
        handle.observe(&message);
        remaining.push(message);
    }
    info!(
        event = "agent_stopped",
        label = %label,
        exit_code = status.and_then(|status| status.code()).unwrap_or(-1),
        queued = remaining.len()
    );
    remaining
}

async fn write_frame(stdin: &mut ChildStdin, frame: &[u8]) -> io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.flush().await
}

async fn read_agent_stdout<R>(
    label: String,
    mut stdout: R,
    tx: mpsc::UnboundedSender<AgentMessage>,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = NdjsonFrameDecoder::<AgentMessage>::new(max_frame_bytes);
    let mut buf = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(event = "agent_stdout_error", label = %label, error = %err);
                break;
            }
        };
        if !forward_frames(&label, decoder.push_chunk(&buf[..read]), &tx) {
            return;
        }
    }
    forward_frames(&label, decoder.finish(), &tx);
    debug!(event = "agent_reader_stopped", label = %label);
}

fn forward_frames(
    label: &str,
    report: DecodeReport<AgentMessage>,
    tx: &mpsc::UnboundedSender<AgentMessage>,
) -> bool {
    for error in report.errors {
        warn!(event = "malformed_line", label = %label, error = %error);
    }
    for message in report.frames {
        if let Err(err) = message.validate() {
            warn!(event = "malformed_line", label = %label, error = %err);
            continue;
        }
        if tx.send(message).is_err() {
            return false;
        }
    }
    true
}

async fn drain_agent_stderr<R>(label: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    debug!(event = "agent_stderr", label = %label, line = %text);
                }
            }
            Err(err) => {
                debug!(event = "agent_stderr_error", label = %label, error = %err);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use workpulse_core::protocol::MessageBody;

    const WAIT: Duration = Duration::from_secs(5);

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).expect("write script");
    }

    fn sh_agent(label: &str, script: &str) -> AgentSpec {
        AgentSpec::new(label, script).with_interpreter("/bin/sh")
    }

    fn manager_for(dir: &TempDir) -> AgentManager {
        AgentManager::new(vec![dir.path().to_path_buf()])
            .with_shutdown_grace(Duration::from_millis(500))
    }

    const ECHO_AGENT: &str = r#"echo '{"type":"handshake","timestamp":"2026-02-07T21:00:00Z","agent_id":"sampler-1","agent_label":"sampler","min_app_version":"0.1.0","capabilities":["flush"]}'
echo '{"type":"heartbeat","timestamp":"2026-02-07T21:00:01Z","agent_label":"sampler","metrics":{"samples":0}}'
while read -r line; do
  case "$line" in
    *shutdown*) exit 0 ;;
    *flush*) echo '{"type":"summary","timestamp":"2026-02-07T21:00:02Z","agent_label":"sampler","data":{"samples":3}}' ;;
  esac
done
"#;

    #[tokio::test]
    async fn agent_round_trip_and_clean_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "sampler.sh", ECHO_AGENT);
        let mut manager = manager_for(&dir);
        manager
            .spawn_agent(sh_agent("sampler", "sampler.sh"), ts(0))
            .expect("spawn");
        assert_eq!(
            manager.get("sampler").map(AgentHandle::health),
            Some(AgentHealth::Starting)
        );

        let handshake = manager.wait_message("sampler", WAIT).await.expect("handshake");
        assert_eq!(handshake.kind(), "handshake");
        let heartbeat = manager.wait_message("sampler", WAIT).await.expect("heartbeat");
        assert!(heartbeat.is_heartbeat());
        assert_eq!(
            manager.get("sampler").and_then(AgentHandle::last_heartbeat),
            Some(heartbeat.timestamp)
        );

        let sent = manager
            .send_command("sampler", &OrchestratorCommand::flush())
            .await
            .expect("send");
        assert!(sent);
        let summary = manager.wait_message("sampler", WAIT).await.expect("summary");
        assert!(matches!(summary.body, MessageBody::Summary));
        assert_eq!(summary.data.get("samples"), Some(&serde_json::json!(3)));

        let remaining = tokio::time::timeout(WAIT, manager.shutdown("sampler"))
            .await
            .expect("shutdown finished")
            .expect("known agent");
        assert!(remaining.is_empty());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn reader_survives_malformed_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(
            dir.path(),
            "noisy.sh",
            r#"echo 'not json at all'
echo ''
echo '{"type":"handshake","timestamp":"2026-02-07T21:00:00Z","agent_label":"noisy","min_app_version":"","capabilities":[]}'
echo '{"type":"summary","timestamp":"2026-02-07T21:00:00Z","agent_label":"noisy"}'
echo 'diagnostics' >&2
"#,
        );
        let mut manager = manager_for(&dir);
        manager
            .spawn_agent(sh_agent("noisy", "noisy.sh"), ts(0))
            .expect("spawn");

        let message = manager.wait_message("noisy", WAIT).await.expect("summary");
        assert_eq!(message.kind(), "summary");
        assert!(manager
            .wait_message("noisy", Duration::from_millis(500))
            .await
            .is_none());
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn exited_agent_drops_commands_and_shuts_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(
            dir.path(),
            "crash.sh",
            r#"echo '{"type":"heartbeat","timestamp":"2026-02-07T21:00:00Z","agent_label":"crash","metrics":{}}'
exit 3
"#,
        );
        let mut manager = manager_for(&dir);
        manager
            .spawn_agent(sh_agent("crash", "crash.sh"), ts(0))
            .expect("spawn");

        let mut exits = Vec::new();
        for _ in 0..250 {
            exits = manager.poll_exits();
            if !exits.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].0, "crash");
        assert_eq!(exits[0].1.code(), Some(3));
        assert!(manager.poll_exits().is_empty());
        assert_eq!(
            manager.get("crash").map(AgentHandle::health),
            Some(AgentHealth::Failed)
        );

        let sent = manager
            .send_command("crash", &OrchestratorCommand::status())
            .await
            .expect("send to exited agent");
        assert!(!sent);

        let remaining = tokio::time::timeout(WAIT, manager.shutdown_all())
            .await
            .expect("shutdown_all finished");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.len(), 1);
        assert!(remaining[0].1[0].is_heartbeat());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn unresponsive_agent_is_killed_after_grace() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "stuck.sh", "exec sleep 30\n");
        let mut manager = AgentManager::new(vec![dir.path().to_path_buf()])
            .with_shutdown_grace(Duration::from_millis(200));
        manager
            .spawn_agent(sh_agent("stuck", "stuck.sh"), ts(0))
            .expect("spawn");

        let remaining = tokio::time::timeout(WAIT, manager.shutdown("stuck"))
            .await
            .expect("shutdown finished")
            .expect("known agent");
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn agent_that_stops_reading_cannot_stall_commands_or_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "deaf.sh", "exec sleep 30\n");
        let mut manager = AgentManager::new(vec![dir.path().to_path_buf()])
            .with_shutdown_grace(Duration::from_millis(200))
            .with_write_timeout(Duration::from_millis(200));
        manager
            .spawn_agent(sh_agent("deaf", "deaf.sh"), ts(0))
            .expect("spawn");

        // Larger than the pipe buffer, so the write can never complete.
        let oversized = OrchestratorCommand::status()
            .with_arg("padding", serde_json::json!("x".repeat(200 * 1024)));
        let sent = tokio::time::timeout(WAIT, manager.send_command("deaf", &oversized))
            .await
            .expect("send_command finished")
            .expect("stall is not an error");
        assert!(!sent);

        let flush = OrchestratorCommand::flush();
        let sent = tokio::time::timeout(WAIT, manager.send_command("deaf", &flush))
            .await
            .expect("send_command finished")
            .expect("send");
        assert!(!sent);

        let remaining = tokio::time::timeout(WAIT, manager.shutdown_all())
            .await
            .expect("shutdown_all finished");
        assert_eq!(remaining.len(), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn registration_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let elsewhere = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "sampler.sh", ECHO_AGENT);
        write_script(elsewhere.path(), "rogue.sh", "exit 0\n");
        let mut manager = manager_for(&dir);

        assert!(matches!(
            manager.spawn_agent(sh_agent("bad label", "sampler.sh"), ts(0)),
            Err(AgentError::InvalidLabel(_))
        ));
        assert!(matches!(
            manager.spawn_agent(
                sh_agent("rogue", elsewhere.path().join("rogue.sh").to_str().expect("utf8")),
                ts(0)
            ),
            Err(AgentError::UntrustedPath(_))
        ));
        assert!(manager.is_empty());

        manager
            .spawn_agent(sh_agent("sampler", "sampler.sh"), ts(0))
            .expect("spawn");
        assert!(matches!(
            manager.spawn_agent(sh_agent("sampler", "sampler.sh"), ts(0)),
            Err(AgentError::DuplicateLabel(_))
        ));
        assert!(matches!(
            manager
                .send_command("missing", &OrchestratorCommand::flush())
                .await,
            Err(AgentError::UnknownAgent(_))
        ));
        assert_eq!(manager.labels(), vec!["sampler".to_string()]);
        manager.shutdown_all().await;
    }

    #[test]
    fn agent_spec_flush_interval_defaults_and_overrides() {
        let spec = AgentSpec::new("sampler", "sampler.sh").flush_every(ChronoDuration::seconds(10));
        assert_eq!(spec.flush_interval, ChronoDuration::seconds(10));
        assert_eq!(
            AgentSpec::new("sampler", "sampler.sh").flush_interval,
            ChronoDuration::seconds(DEFAULT_FLUSH_INTERVAL_SECS)
        );
    }
}
