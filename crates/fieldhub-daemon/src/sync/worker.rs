//! Per-receiver sync worker.
//!
//! Each cycle the worker announces the next sync time, sleeps until it,
//! and then triggers the upstream pull with two ssh invocations over a
//! shared control master: one refreshing the reverse tunnel (failure to
//! map an already-mapped port is expected and ignored), one touching the
//! remote marker file that starts the sync.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::message::{Msg, Serno, Topic};
use crate::registry::{ensure_record, SgRegistry};
use crate::storage::Database;
use crate::sync::SyncSettings;

/// Run the sync loop for one receiver until cancelled or disconnected.
pub async fn run_sync_worker(
    bus: Bus,
    registry: Arc<SgRegistry>,
    db: Database,
    settings: SyncSettings,
    serno: Serno,
    cancel: CancellationToken,
) {
    let record = ensure_record(&registry, &db, &serno, Utc::now()).await;
    let port = record.with_state(|state| state.tunnel_port);

    let control = format!("-oControlPath={}", settings.control_path.display());
    let forward = format!("-R{port}:localhost:{port}");
    let touch_path = settings
        .sync_template
        .replace("{port}", &port.to_string())
        .replace("{serno}", serno.as_str());

    loop {
        let delay = pick_delay(settings.wait_lo, settings.wait_hi);
        let fire_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        bus.publish(
            Topic::SYNC_PENDING,
            Msg {
                ts: Some(fire_at),
                sender: serno.to_string(),
                text: String::new(),
            },
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%serno, "Sync worker cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        let synctime = Utc::now();

        if !record.with_state(|state| state.connected) {
            info!(%serno, "Receiver no longer connected, ending sync worker");
            return;
        }

        // Refresh the reverse tunnel in the background. An already-mapped
        // port makes this fail; that is fine.
        let tunnel = ssh_command(&settings)
            .args(["-f", "-N", "-T"])
            .args([
                "-oStrictHostKeyChecking=no",
                "-oExitOnForwardFailure=yes",
                "-oServerAliveInterval=5",
                "-oServerAliveCountMax=3",
            ])
            .arg(&control)
            .arg(&forward)
            .arg(&settings.user)
            .status()
            .await;
        if let Err(e) = tunnel {
            debug!(%serno, error = %e, "Tunnel refresh did not run");
        }

        let launch = ssh_command(&settings)
            .arg(&control)
            .arg(&settings.user)
            .arg("touch")
            .arg(&touch_path)
            .status()
            .await;
        match launch {
            Ok(status) if status.success() => {
                bus.publish(
                    Topic::SYNC_LAUNCHED,
                    Msg {
                        ts: Some(synctime),
                        sender: serno.to_string(),
                        text: String::new(),
                    },
                );
            }
            Ok(status) => warn!(%serno, %status, "Sync launch command failed"),
            Err(e) => warn!(%serno, error = %e, "Sync launch command did not run"),
        }
    }
}

/// Common prefix of both ssh invocations: identity file and automatic
/// control master, with all output discarded.
fn ssh_command(settings: &SyncSettings) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&settings.ssh_bin);
    cmd.arg("-i")
        .arg(&settings.identity)
        .arg("-oControlMaster=auto")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Delay uniform in `[lo, hi)`, or exactly `lo` when the window is empty.
fn pick_delay(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let secs = rand::thread_rng().gen_range(lo.as_secs_f64()..hi.as_secs_f64());
    Duration::from_secs_f64(secs)
}
