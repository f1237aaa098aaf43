//! State aggregator: folds every bus message into the live-state
//! registry.
//!
//! Subscribes to all topics but only messages whose sender is an
//! admissible serial number touch the registry. The record is created on
//! first sight (with store-backed defaults) and then updated under its
//! own mutex according to the topic.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::Bus;
use crate::message::Topic;
use crate::registry::{ensure_record, SgRegistry};
use crate::storage::Database;

/// Spawn the aggregator task. The subscription is taken before the task
/// starts so no message published after this call can be missed.
pub fn spawn_aggregator(
    bus: &Bus,
    registry: Arc<SgRegistry>,
    db: Database,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut sub = bus.subscribe_all();
    tokio::spawn(async move {
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
            let ts = envelope.msg.ts.unwrap_or_else(Utc::now);

            let record = ensure_record(&registry, &db, &serno, ts).await;
            record.with_state(|state| match envelope.topic {
                Topic::CONNECT => {
                    state.ts_conn = ts;
                    state.connected = true;
                }
                Topic::DISCONNECT => state.connected = false,
                Topic::SYNC_LAUNCHED => state.ts_last_sync = Some(ts),
                Topic::SYNC_PENDING => state.ts_next_sync = Some(ts),
                other => debug!(topic = %other, %serno, "No state change for topic"),
            });
        }
        info!("State aggregator stopped");
    })
}
