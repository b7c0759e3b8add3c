//! Chronicle engine binary.
//!
//! Drives an [`Orchestrator`] from a line-oriented JSON protocol on
//! stdin/stdout. See [`command`] for the protocol.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (first argument, default `chronicle-config.yaml`)
//! 2. Initialize structured logging (tracing)
//! 3. Build the orchestrator from configuration
//! 4. Rehydrate from the JSON-lines event log, if configured
//! 5. Attach write-behind persistence to the same log
//! 6. Serve commands until stdin closes, then drain persistence

mod command;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chronicle_core::{ChronicleConfig, Orchestrator};
use chronicle_events::{EventPersistence, JsonLinesPersistence, WriteBehind};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Default configuration path, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "chronicle-config.yaml";

/// Application entry point for the Chronicle engine.
///
/// # Errors
///
/// Returns an error if configuration, rehydration, or stdio fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let (config, config_found) = load_config(&config_path)?;

    // 2. Initialize structured logging. Logs go to stderr; stdout carries
    //    responses.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("chronicle-engine starting");
    if !config_found {
        info!(path = %config_path.display(), "Config file not found, using defaults");
    }
    info!(
        checkpoint_interval = config.store.checkpoint_interval,
        max_cascade_depth = config.invalidation.max_cascade_depth,
        rules = config.rules.len(),
        "Configuration loaded"
    );

    // 3. Build the orchestrator.
    let mut chronicle = Orchestrator::from_config(&config);
    for warning in chronicle.configuration_warnings() {
        tracing::warn!(?warning, "Rule skipped");
    }

    // 4-5. Rehydrate and attach persistence.
    let writer = match &config.persistence.event_log_path {
        Some(path) => {
            let persistence = Arc::new(JsonLinesPersistence::new(path));
            let events = persistence
                .load_events_since(None)
                .with_context(|| format!("failed to load event log {}", path.display()))?;
            let loaded = chronicle
                .rehydrate(events)
                .context("failed to rehydrate from event log")?;
            info!(path = %path.display(), events = loaded, "Event log attached");

            let writer = WriteBehind::spawn(persistence, config.persistence.batch_size);
            chronicle.attach_write_behind(writer.handle());
            Some(writer)
        }
        None => {
            info!("No event log configured, running in memory");
            None
        }
    };

    // 6. Serve commands.
    let served = serve(&chronicle).await?;
    info!(commands = served, events = chronicle.event_count(), "stdin closed");

    drop(chronicle);
    if let Some(writer) = writer {
        let persisted = writer.finish().await;
        info!(persisted, "Event log drained");
    }
    Ok(())
}

/// Answer one JSON command per stdin line until EOF.
async fn serve(chronicle: &Orchestrator) -> anyhow::Result<u64> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut served: u64 = 0;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = command::respond(chronicle, &line);
        response.push('\n');
        stdout
            .write_all(response.as_bytes())
            .await
            .context("failed to write response")?;
        stdout.flush().await.context("failed to flush stdout")?;
        served = served.saturating_add(1);
    }
    Ok(served)
}

/// Load configuration from `path`, falling back to defaults if the file
/// does not exist.
fn load_config(path: &Path) -> anyhow::Result<(ChronicleConfig, bool)> {
    if path.exists() {
        let config = ChronicleConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        Ok((config, true))
    } else {
        let mut config = ChronicleConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok((config, false))
    }
}
