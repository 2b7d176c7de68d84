mod logging;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use workpulse_agents::AgentSpec;
use workpulse_runtime::config::{default_config_path, DATA_ROOT_ENV};
use workpulse_runtime::sources::file_changes::FILE_CHANGES_LABEL;
use workpulse_runtime::{
    load_settings, FileChangeSource, JsonlSink, Runtime, RuntimeBuilder, RuntimeSettings,
    APP_VERSION,
};

#[derive(Parser)]
#[command(name = "workpulse")]
#[command(about = "Local activity monitor and agent orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Run {
        #[command(flatten)]
        settings: SettingsArgs,
        #[arg(long, default_value_t = false)]
        debug: bool,
        #[arg(long)]
        session: Option<String>,
    },
    /// Validate the settings file and print the resolved settings
    CheckConfig {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_root: Option<PathBuf>,
}

impl SettingsArgs {
    fn load(&self) -> Result<(PathBuf, RuntimeSettings)> {
        let path = self.config.clone().unwrap_or_else(default_config_path);
        let mut settings = load_settings(&path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?;
        if let Some(root) = self.data_root.clone().or_else(data_root_from_env) {
            settings = settings.with_data_root(root);
        }
        Ok((path, settings))
    }
}

fn data_root_from_env() -> Option<PathBuf> {
    match std::env::var(DATA_ROOT_ENV) {
        Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            settings,
            debug,
            session,
        } => run(settings, debug, session).await,
        Commands::CheckConfig { settings } => check_config(settings),
    }
}

fn check_config(args: SettingsArgs) -> Result<()> {
    let (_, settings) = args.load()?;
    let rendered = serde_json::to_string_pretty(&settings).context("failed to render settings")?;
    println!("{rendered}");
    Ok(())
}

async fn run(args: SettingsArgs, debug: bool, session: Option<String>) -> Result<()> {
    let (config_path, settings) = args.load()?;
    let session_id = logging::resolve_session_id(session.as_deref());
    let _log_guard = logging::init_logging(debug, &settings.log_dir(), &session_id);
    info!(
        event = "workpulse_start",
        version = APP_VERSION,
        session_id = %session_id,
        config = %config_path.display(),
        data_root = %settings.data_root.display()
    );

    let mut runtime = build_runtime(&settings)?;
    let specs: Vec<AgentSpec> = settings.enabled_agents().map(|agent| agent.to_spec()).collect();
    let requested = specs.len();
    let spawned = runtime.spawn_agents(specs, Utc::now());
    if spawned < requested {
        warn!(event = "agents_skipped", requested, spawned);
    }

    let stop = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(event = "signal_error", error = %err);
        }
    };
    let report = runtime.run_until(settings.tick_interval(), stop).await;
    info!(
        event = "workpulse_stop",
        flushes_sent = report.flushes_sent,
        segment_closed = report.segment_closed,
        agents_stopped = report.agents_stopped,
        summaries_written = report.summaries_written,
        faults = report.faults.len()
    );
    Ok(())
}

fn build_runtime(settings: &RuntimeSettings) -> Result<Runtime> {
    let sink = JsonlSink::open(&settings.data_root)
        .with_context(|| format!("failed to open sink at {}", settings.data_root.display()))?;
    let mut builder = RuntimeBuilder::from_settings(settings).sink(Box::new(sink));

    if let Some(file_settings) = settings.source(FILE_CHANGES_LABEL) {
        if file_settings.enabled && !file_settings.paths.is_empty() {
            match FileChangeSource::watch(&file_settings.paths) {
                Ok(source) => builder = builder.source(Box::new(source)),
                Err(err) => warn!(event = "source_skipped", label = FILE_CHANGES_LABEL, error = %err),
            }
        }
    }

    builder.build().context("failed to build runtime")
}
