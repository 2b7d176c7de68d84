mod agent;

use agent::SampleAgent;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use workpulse_core::protocol::{
    decode_frame, encode_frame, AgentMessage, OrchestratorCommand, DEFAULT_MAX_FRAME_BYTES,
};

#[derive(Parser, Debug)]
#[command(name = "workpulse-sample-agent")]
struct Args {
    #[arg(long, env = "WORKPULSE_AGENT_LABEL", default_value = "sample")]
    label: String,
    #[arg(long, default_value_t = 5)]
    heartbeat_secs: u64,
}

fn init_logging() {
    let level = std::env::var("WORKPULSE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries the protocol
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

async fn send(stdout: &mut Stdout, message: &AgentMessage) -> Result<()> {
    let frame = encode_frame(message, DEFAULT_MAX_FRAME_BYTES).context("encode message")?;
    stdout.write_all(&frame).await.context("write stdout")?;
    stdout.flush().await.context("flush stdout")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let agent_id = format!("{}-{}", args.label, std::process::id());
    let mut agent = SampleAgent::new(args.label.clone(), agent_id, Utc::now());
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.heartbeat_secs.max(1)));

    send(&mut stdout, &agent.handshake(Utc::now())).await?;
    info!(event = "agent_start", label = %args.label);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let heartbeat = agent.sample_and_heartbeat(Utc::now());
                send(&mut stdout, &heartbeat).await?;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!(event = "stdin_closed", label = %args.label);
                        break;
                    }
                    Err(err) => {
                        warn!(event = "stdin_error", error = %err);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command: OrchestratorCommand =
                    match decode_frame(line.as_bytes(), DEFAULT_MAX_FRAME_BYTES) {
                        Ok(command) => command,
                        Err(err) => {
                            warn!(event = "malformed_command", error = %err);
                            continue;
                        }
                    };
                debug!(event = "command_received", cmd = command.cmd.as_str());
                let reply = agent.handle(&command, Utc::now());
                for message in &reply.messages {
                    send(&mut stdout, message).await?;
                }
                if reply.exit {
                    info!(event = "agent_shutdown", label = %args.label);
                    break;
                }
            }
        }
    }
    Ok(())
}
