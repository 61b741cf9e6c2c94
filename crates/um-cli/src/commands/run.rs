//! The metering agent.
//!
//! Reads host focus and idle events from stdin, credits focused time on a
//! fixed tick, and reconciles with the collector on a slower cadence. The
//! collector settings are re-read before every reconciliation pass, so a
//! collector configured while the agent runs is picked up without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use um_collector::CollectorClient;
use um_core::Engine;
use um_db::Database;

use super::flush::connect;
use super::util::lock_writer;
use crate::{CollectorSettings, Config};
use crate::host::{HostEvent, parse_host_event};

type AgentEngine = Engine<Database, CollectorClient>;

pub fn run(db: Database, config: &Config, config_path: Option<&Path>) -> Result<()> {
    let _lock = lock_writer(&config.database_path)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    runtime.block_on(run_agent(
        db,
        config,
        config_path.map(Path::to_path_buf),
        tokio::io::stdin(),
        shutdown_signal(),
    ))
}

/// Runs the agent until `shutdown` resolves or `input` reaches end of file,
/// then credits the final interval and makes one last reconciliation pass.
pub async fn run_agent<R, F>(
    db: Database,
    config: &Config,
    config_path: Option<PathBuf>,
    input: R,
    shutdown: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: Future<Output = ()>,
{
    let settings = config.collector();
    let transport = connect(settings.as_ref(), config);
    let engine = Arc::new(Engine::new(db, transport, config.request_timeout()));
    tracing::info!(
        database = %config.database_path.display(),
        collector = settings.is_some(),
        "agent started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let flusher = tokio::spawn(flush_loop(
        Arc::clone(&engine),
        config.flush_interval(),
        config_path,
        settings,
        stop_rx,
    ));

    let mut ticker = interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut lines = BufReader::new(input).split(b'\n');
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                if let Err(err) = engine.tick().await {
                    tracing::warn!(error = %err, "failed to record elapsed time; retrying next tick");
                }
            }
            line = lines.next_segment() => match line {
                Ok(Some(raw)) => match std::str::from_utf8(&raw) {
                    Ok(line) => apply_host_line(&engine, line).await,
                    Err(err) => tracing::warn!(error = %err, "ignoring host input that is not UTF-8"),
                },
                Ok(None) => {
                    tracing::info!("host input closed, shutting down");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read host input, shutting down");
                    break;
                }
            },
        }
    }

    let _ = stop_tx.send(true);
    if let Err(err) = flusher.await {
        tracing::warn!(error = %err, "flush task ended abnormally");
    }

    engine
        .tick()
        .await
        .context("failed to record final interval")?;
    let outcome = engine.flush().await.context("failed to reconcile usage")?;
    tracing::info!(?outcome, "agent stopped");
    Ok(())
}

async fn apply_host_line(engine: &AgentEngine, line: &str) {
    let event = match parse_host_event(line) {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "ignoring host event");
            return;
        }
    };

    let result = match &event {
        HostEvent::Focus { url } => engine.focus_changed(url.as_deref()).await,
        HostEvent::Idle { state } => engine.idle_changed(*state).await,
    };
    if let Err(err) = result {
        tracing::warn!(?event, error = %err, "failed to record interval; it is lost");
    }
}

/// Reconciles every `period` until `stop` flips, re-reading the collector
/// settings before each pass.
async fn flush_loop(
    engine: Arc<AgentEngine>,
    period: Duration,
    config_path: Option<PathBuf>,
    mut active: Option<CollectorSettings>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => return,
        }

        match Config::load_from(config_path.as_deref()) {
            Ok(fresh) => {
                let settings = fresh.collector();
                if settings != active {
                    tracing::info!(configured = settings.is_some(), "collector settings changed");
                    engine
                        .set_transport(connect(settings.as_ref(), &fresh))
                        .await;
                    active = settings;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to reload configuration; keeping collector settings");
            }
        }

        match engine.flush().await {
            Ok(outcome) => tracing::debug!(?outcome, "flush finished"),
            Err(err) => tracing::warn!(error = %err, "flush failed to update the store"),
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = signal_or_pending(tokio::signal::ctrl_c()) => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "failed to register SIGTERM handler"),
        }
    }

    signal_or_pending(tokio::signal::ctrl_c()).await;
    tracing::info!("received ctrl-c, shutting down");
}

/// Waits for a signal listener; a listener that cannot be registered never
/// fires instead of resolving at once.
async fn signal_or_pending<F>(listener: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = listener.await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
