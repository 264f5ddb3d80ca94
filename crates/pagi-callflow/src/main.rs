//! Callflow replay CLI: feeds recorded call events through the engine.
//!
//! Usage:
//!   cargo run -p pagi-callflow -- [--events calls.jsonl] [--client acme] [--print-config]
//!
//! Reads one JSON `CallEvent` per line (stdin when `--events` is absent) and prints one
//! JSON `TurnOutput` per processed event. Transfers go to the webhook in
//! PAGI_CALLFLOW_TRANSFER_WEBHOOK_URL, or are logged when it is unset.

use anyhow::Context;
use pagi_callflow::{
    CallEvent, CallflowConfig, CallflowEngine, LoggingTransferExecutor, TransferExecutor,
    WebhookTransferExecutor,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut events_path: Option<PathBuf> = None;
    let mut client_id: Option<String> = None;
    let mut print_config = false;

    while let Some(a) = args.next() {
        match a.as_str() {
            "--events" => events_path = args.next().map(PathBuf::from),
            "--client" => client_id = args.next(),
            "--print-config" => print_config = true,
            "--help" | "-h" => {
                eprintln!("Callflow — call phase & handoff replay");
                eprintln!("  --events FILE     JSONL call events (default: stdin)");
                eprintln!("  --client ID       Layer config/callflow/<ID>.toml over the base config");
                eprintln!("  --print-config    Print the effective config as TOML and exit");
                return Ok(());
            }
            other => warn!("Ignoring unknown argument {}", other),
        }
    }

    let config = match client_id.as_deref() {
        Some(id) => CallflowConfig::load_for_client(id),
        None => CallflowConfig::load(),
    }
    .context("loading callflow config")?;

    if print_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let executor: Arc<dyn TransferExecutor> = match WebhookTransferExecutor::from_env() {
        Some(webhook) => {
            let webhook = webhook?;
            info!(url = %webhook.url, "Transfers via webhook");
            Arc::new(webhook)
        }
        None => Arc::new(LoggingTransferExecutor),
    };
    let engine = CallflowEngine::new(&config, executor);

    let reader: Box<dyn BufRead> = match &events_path {
        Some(path) => Box::new(std::io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };

    let mut processed = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: CallEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "Skipping malformed event");
                continue;
            }
        };
        match engine.dispatch(event).await {
            Ok(Some(mut output)) => {
                // Replay is sequential: let the transfer settle before the next event.
                if let Some(status) = output.transfer_result().await {
                    info!(call_id = %output.call_id, ?status, "Transfer settled");
                }
                println!("{}", serde_json::to_string(&output)?);
                processed += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(line = lineno + 1, error = %e, "Event rejected"),
        }
    }

    info!(processed, swept = engine.sweep_ended(), "Replay finished");
    Ok(())
}
