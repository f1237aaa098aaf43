//! Sync manager: one worker per connected receiver, driving periodic
//! data pulls by the upstream service.
//!
//! The manager subscribes to connect/disconnect events and keeps a
//! private map from serial to the worker's cancellation token. The map
//! is only touched from the manager task itself, so it needs no lock.
//! Duplicate connects (e.g. from the watcher's bootstrap enumeration)
//! collapse into the existing worker.

mod worker;

pub use worker::run_sync_worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fieldhub_core::Config;

use crate::bus::Bus;
use crate::message::{Serno, Topic};
use crate::registry::SgRegistry;
use crate::storage::Database;

/// Everything a sync worker needs to schedule and launch syncs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Minimum wait between syncs.
    pub wait_lo: Duration,
    /// Maximum wait between syncs.
    pub wait_hi: Duration,
    /// The ssh program to invoke.
    pub ssh_bin: PathBuf,
    /// Account on the upstream host.
    pub user: String,
    /// Identity file for the sync connection.
    pub identity: PathBuf,
    /// Control path multiplexing both invocations over one transport.
    pub control_path: PathBuf,
    /// Remote path template; `{port}` and `{serno}` substituted.
    pub sync_template: String,
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            wait_lo: Duration::from_secs_f64(config.sync.wait_lo_minutes * 60.0),
            wait_hi: Duration::from_secs_f64(config.sync.wait_hi_minutes * 60.0),
            ssh_bin: config.upstream.ssh_bin.clone(),
            user: config.upstream.user.clone(),
            identity: config.upstream.identity.clone(),
            control_path: config.upstream.control_path.clone(),
            sync_template: config.upstream.sync_template.clone(),
        }
    }
}

/// Spawn the sync manager task. The subscription is taken before the
/// task starts so no event published after this call can be missed.
pub fn spawn_sync_manager(
    bus: &Bus,
    registry: Arc<SgRegistry>,
    db: Database,
    settings: SyncSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut sub = bus.subscribe(&[Topic::CONNECT, Topic::DISCONNECT]);
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut workers: HashMap<Serno, CancellationToken> = HashMap::new();

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                received = sub.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let Some(serno) = envelope.msg.sender_serno() else {
                continue;
            };
            match envelope.topic {
                Topic::CONNECT => {
                    if workers.contains_key(&serno) {
                        debug!(%serno, "Sync worker already running");
                        continue;
                    }
                    let child = cancel.child_token();
                    workers.insert(serno.clone(), child.clone());
                    info!(%serno, "Starting sync worker");
                    tokio::spawn(run_sync_worker(
                        bus.clone(),
                        Arc::clone(&registry),
                        db.clone(),
                        settings.clone(),
                        serno,
                        child,
                    ));
                }
                Topic::DISCONNECT => {
                    if let Some(token) = workers.remove(&serno) {
                        info!(%serno, "Stopping sync worker");
                        token.cancel();
                    }
                }
                _ => {}
            }
        }

        // Shutting down: cascade to every worker.
        for (serno, token) in workers.drain() {
            debug!(%serno, "Cancelling sync worker on shutdown");
            token.cancel();
        }
        info!("Sync manager stopped");
    })
}
