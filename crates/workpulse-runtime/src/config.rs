use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use workpulse_agents::AgentSpec;
use workpulse_core::{duration_from_secs_f64, is_identifier_safe, BackoffPolicy, SourceSpec};

pub const CONFIG_PATH_ENV: &str = "WORKPULSE_CONFIG";
pub const DATA_ROOT_ENV: &str = "WORKPULSE_DATA_ROOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: String, value: f64 },
    #[error("backoff max_secs ({max}) must be >= base_secs ({base})")]
    BackoffRange { base: f64, max: f64 },
    #[error("label is not identifier-safe: {0:?}")]
    InvalidLabel(String),
    #[error("agent label configured twice: {0}")]
    DuplicateAgent(String),
    #[error("agent {0} has an empty script path")]
    MissingScript(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_secs: f64,
    pub max_secs: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_secs: 5.0,
            max_secs: 300.0,
        }
    }
}

/// Per-source overrides applied on top of the source's own registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub enabled: bool,
    pub poll_interval_secs: Option<f64>,
    pub resets_cooldown: Option<bool>,
    pub infrequent: Option<bool>,
    pub paths: Vec<PathBuf>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: None,
            resets_cooldown: None,
            infrequent: None,
            paths: Vec::new(),
        }
    }
}

impl SourceSettings {
    pub fn apply(&self, mut spec: SourceSpec) -> SourceSpec {
        if let Some(interval) = self.poll_interval_secs.and_then(duration_from_secs_f64) {
            spec.poll_interval = interval;
        }
        if let Some(resets) = self.resets_cooldown {
            spec.resets_cooldown = resets;
        }
        if let Some(infrequent) = self.infrequent {
            spec.infrequent = infrequent;
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub label: String,
    pub script: PathBuf,
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_flush_interval_secs() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

impl AgentSettings {
    pub fn to_spec(&self) -> AgentSpec {
        let mut spec = AgentSpec::new(self.label.clone(), self.script.clone())
            .with_args(self.args.iter().cloned());
        if let Some(interpreter) = &self.interpreter {
            spec = spec.with_interpreter(interpreter.clone());
        }
        for (key, value) in &self.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        if let Some(interval) = duration_from_secs_f64(self.flush_interval_secs) {
            spec = spec.flush_every(interval);
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub cooldown_secs: f64,
    pub tick_interval_ms: u64,
    pub data_root: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub shutdown_grace_secs: f64,
    pub heartbeat_timeout_secs: Option<f64>,
    pub backoff: BackoffSettings,
    pub trusted_agent_dirs: Vec<PathBuf>,
    pub sources: BTreeMap<String, SourceSettings>,
    pub agents: Vec<AgentSettings>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 300.0,
            tick_interval_ms: 1_000,
            data_root: default_data_root(),
            log_dir: None,
            shutdown_grace_secs: 3.0,
            heartbeat_timeout_secs: None,
            backoff: BackoffSettings::default(),
            trusted_agent_dirs: Vec::new(),
            sources: BTreeMap::new(),
            agents: Vec::new(),
        }
    }
}

pub fn default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("workpulse"))
        .unwrap_or_else(|| PathBuf::from(".workpulse"))
}

impl RuntimeSettings {
    pub fn with_data_root(mut self, data_root: impl Into<PathBuf>) -> Self {
        self.data_root = data_root.into();
        self
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("logs"))
    }

    pub fn trusted_dirs(&self) -> Vec<PathBuf> {
        if self.trusted_agent_dirs.is_empty() {
            return vec![self.data_root.join("agents")];
        }
        self.trusted_agent_dirs.clone()
    }

    pub fn cooldown(&self) -> Duration {
        duration_from_secs_f64(self.cooldown_secs).unwrap_or_else(|| Duration::seconds(300))
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.shutdown_grace_secs.max(0.0))
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_secs.and_then(duration_from_secs_f64)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            base: duration_from_secs_f64(self.backoff.base_secs).unwrap_or(defaults.base),
            max: duration_from_secs_f64(self.backoff.max_secs).unwrap_or(defaults.max),
        }
    }

    pub fn source(&self, label: &str) -> Option<&SourceSettings> {
        self.sources.get(label)
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentSettings> {
        self.agents.iter().filter(|agent| agent.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("cooldown_secs", self.cooldown_secs)?;
        require_positive("tick_interval_ms", self.tick_interval_ms as f64)?;
        if !self.shutdown_grace_secs.is_finite() || self.shutdown_grace_secs < 0.0 {
            return Err(ConfigError::NonPositive {
                field: "shutdown_grace_secs".to_string(),
                value: self.shutdown_grace_secs,
            });
        }
        if let Some(timeout) = self.heartbeat_timeout_secs {
            require_positive("heartbeat_timeout_secs", timeout)?;
        }
        require_positive("backoff.base_secs", self.backoff.base_secs)?;
        require_positive("backoff.max_secs", self.backoff.max_secs)?;
        if self.backoff.max_secs < self.backoff.base_secs {
            return Err(ConfigError::BackoffRange {
                base: self.backoff.base_secs,
                max: self.backoff.max_secs,
            });
        }

        for (label, source) in &self.sources {
            if !is_identifier_safe(label) {
                return Err(ConfigError::InvalidLabel(label.clone()));
            }
            if let Some(interval) = source.poll_interval_secs {
                require_positive(&format!("sources.{label}.poll_interval_secs"), interval)?;
            }
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !is_identifier_safe(&agent.label) {
                return Err(ConfigError::InvalidLabel(agent.label.clone()));
            }
            if !seen.insert(agent.label.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.label.clone()));
            }
            if agent.script.as_os_str().is_empty() {
                return Err(ConfigError::MissingScript(agent.label.clone()));
            }
            require_positive(
                &format!("agents.{}.flush_interval_secs", agent.label),
                agent.flush_interval_secs,
            )?;
        }
        Ok(())
    }
}

fn require_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        return Ok(());
    }
    Err(ConfigError::NonPositive {
        field: field.to_string(),
        value,
    })
}

pub fn parse_settings(contents: &str, path: &Path) -> Result<RuntimeSettings, ConfigError> {
    let settings: RuntimeSettings =
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    settings.validate()?;
    Ok(settings)
}

/// Reads and validates settings. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<RuntimeSettings, ConfigError> {
    if !path.exists() {
        return Ok(RuntimeSettings::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_settings(&contents, path)
}

pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("workpulse").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("workpulse.toml"))
}
