//! `FieldHub` Daemon
//!
//! The daemon maintains the live view of connected receivers, records
//! every observed message, schedules per-receiver syncs to the upstream
//! data service, and answers operator status queries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldhub_core::{Config, Metrics};

use fieldhub_daemon::bus::Bus;
use fieldhub_daemon::ingress::{spawn_dgram, spawn_trusted_stream};
use fieldhub_daemon::recorder::spawn_recorder;
use fieldhub_daemon::registry::{spawn_aggregator, SgRegistry};
use fieldhub_daemon::status::spawn_status_server;
use fieldhub_daemon::storage::Database;
use fieldhub_daemon::sync::{spawn_sync_manager, SyncSettings};
use fieldhub_daemon::watcher::spawn_watcher;

#[derive(Parser, Debug)]
#[command(name = "fieldhub-daemon")]
#[command(version, about = "FieldHub daemon - receiver fleet coordinator")]
struct Args {
    /// Path to a JSON settings file (defaults apply when absent)
    #[arg(long, env = "FIELDHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "FIELDHUB_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory holding per-receiver connection semaphores
    #[arg(long, env = "FIELDHUB_SEM_DIR")]
    sem_dir: Option<PathBuf>,

    /// Trusted stream ingress bind address
    #[arg(long, env = "FIELDHUB_STREAM_ADDR")]
    stream_addr: Option<String>,

    /// Status server bind address
    #[arg(long, env = "FIELDHUB_STATUS_ADDR")]
    status_addr: Option<String>,

    /// Per-subscription bus queue capacity
    #[arg(long, default_value_t = 256, env = "FIELDHUB_BUS_CAPACITY")]
    bus_capacity: usize,

    /// Log every bus message (debug aid)
    #[arg(long)]
    dump_messages: bool,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn")
    #[arg(long, env = "FIELDHUB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "FIELDHUB_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = fieldhub_core::config::load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    let log_filter = format!("fieldhub_daemon={}", config.log.level);
    fieldhub_core::tracing_init::init_tracing(&log_filter, config.log.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stream_addr = %config.server.stream_addr,
        status_addr = %config.server.status_addr,
        sem_dir = %config.watcher.sem_dir.display(),
        "Starting fieldhub-daemon"
    );

    let db_path = match &config.database.path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let sem_pattern = Regex::new(&config.watcher.sem_pattern)
        .map_err(|e| anyhow::anyhow!("invalid watcher.sem_pattern: {e}"))?;

    let metrics = Arc::new(Metrics::new());
    let bus = Bus::new(args.bus_capacity, Arc::clone(&metrics));
    let registry = Arc::new(SgRegistry::new());
    let root = CancellationToken::new();
    let idle_timeout = Duration::from_secs(config.server.idle_timeout_secs);

    // Consumers subscribe first so nothing the ingress sources publish
    // can be missed.
    let mut tasks = vec![
        spawn_recorder(&bus, db.clone(), Arc::clone(&metrics), root.child_token()),
        spawn_aggregator(&bus, Arc::clone(&registry), db.clone(), root.child_token()),
        spawn_sync_manager(
            &bus,
            Arc::clone(&registry),
            db.clone(),
            SyncSettings::from(&config),
            root.child_token(),
        ),
    ];
    if args.dump_messages {
        tasks.push(spawn_message_dump(&bus, root.child_token()));
    }

    tasks.push(spawn_watcher(
        bus.clone(),
        config.watcher.sem_dir.clone(),
        sem_pattern,
        root.child_token(),
    ));
    tasks.push(spawn_status_server(
        Arc::clone(&registry),
        config.server.status_addr.clone(),
        idle_timeout,
        root.child_token(),
    ));
    tasks.push(spawn_trusted_stream(
        bus.clone(),
        config.server.stream_addr.clone(),
        idle_timeout,
        root.child_token(),
    ));
    tasks.push(spawn_dgram(
        bus.clone(),
        config.server.dgram_trusted_addr.clone(),
        true,
        Arc::clone(&metrics),
        root.child_token(),
    ));
    tasks.push(spawn_dgram(
        bus.clone(),
        config.server.dgram_untrusted_addr.clone(),
        false,
        Arc::clone(&metrics),
        root.child_token(),
    ));

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Could not notify systemd");
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    root.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!(
        recorded = metrics.messages_recorded(),
        record_failures = metrics.record_failures(),
        dropped = metrics.messages_dropped(),
        datagrams_rejected = metrics.datagrams_rejected(),
        "Daemon stopped"
    );
    Ok(())
}

/// CLI and environment beat the settings file.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(path) = &args.db_path {
        config.database.path = Some(path.clone());
    }
    if let Some(dir) = &args.sem_dir {
        config.watcher.sem_dir.clone_from(dir);
    }
    if let Some(addr) = &args.stream_addr {
        config.server.stream_addr.clone_from(addr);
    }
    if let Some(addr) = &args.status_addr {
        config.server.status_addr.clone_from(addr);
    }
    if let Some(level) = &args.log_level {
        config.log.level.clone_from(level);
    }
    if args.log_json {
        config.log.json = true;
    }
}

/// Default database path: ~/.fieldhub/fieldhub.sqlite
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".fieldhub").join("fieldhub.sqlite"))
}

/// Debug aid: log every message crossing the bus.
fn spawn_message_dump(bus: &Bus, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut sub = bus.subscribe_all();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sub.recv() => match received {
                    Some(envelope) => info!(
                        topic = %envelope.topic,
                        ts = ?envelope.msg.ts,
                        sender = %envelope.msg.sender,
                        text = %envelope.msg.text,
                        "bus message"
                    ),
                    None => break,
                },
            }
        }
    })
}
