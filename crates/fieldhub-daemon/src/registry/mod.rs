//! Live-state registry: the authoritative in-memory view of every
//! receiver seen during this process's lifetime.
//!
//! Records are held as `Arc<ActiveSg>` and never removed, so any task may
//! keep a reference for as long as it likes. The registry lock is only
//! taken to look up or insert; all field access goes through each
//! record's own mutex, which is never held across an await point.

mod aggregator;

pub use aggregator::spawn_aggregator;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::message::Serno;
use crate::storage::Database;

/// Mutable status of one receiver.
#[derive(Debug, Clone)]
pub struct SgState {
    /// Time at which the receiver connected.
    pub ts_conn: DateTime<Utc>,
    /// Time of the last launched sync, if any.
    pub ts_last_sync: Option<DateTime<Utc>>,
    /// Time the next sync is scheduled for, if any.
    pub ts_next_sync: Option<DateTime<Utc>>,
    /// Reverse-tunnel port; immutable once populated from the registry
    /// table, 0 when the receiver is unprovisioned.
    pub tunnel_port: u16,
    /// Whether the receiver is currently connected. The record itself
    /// outlives disconnection.
    pub connected: bool,
}

/// A receiver we have seen at least once.
#[derive(Debug)]
pub struct ActiveSg {
    serno: Serno,
    state: Mutex<SgState>,
}

/// Point-in-time copy of a record, as served by the status responder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SgSnapshot {
    pub serno: Serno,
    pub ts_conn: DateTime<Utc>,
    pub ts_last_sync: Option<DateTime<Utc>>,
    pub ts_next_sync: Option<DateTime<Utc>>,
    pub tunnel_port: u16,
    pub connected: bool,
}

impl ActiveSg {
    fn new(serno: Serno, state: SgState) -> Self {
        Self {
            serno,
            state: Mutex::new(state),
        }
    }

    pub fn serno(&self) -> &Serno {
        &self.serno
    }

    /// Run `f` with the record's state locked.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut SgState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy the current state out under the lock.
    pub fn snapshot(&self) -> SgSnapshot {
        self.with_state(|state| SgSnapshot {
            serno: self.serno.clone(),
            ts_conn: state.ts_conn,
            ts_last_sync: state.ts_last_sync,
            ts_next_sync: state.ts_next_sync,
            tunnel_port: state.tunnel_port,
            connected: state.connected,
        })
    }
}

/// Process-wide map from serial number to live-state record.
#[derive(Default)]
pub struct SgRegistry {
    records: RwLock<HashMap<Serno, Arc<ActiveSg>>>,
}

impl SgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing record.
    pub async fn get(&self, serno: &Serno) -> Option<Arc<ActiveSg>> {
        self.records.read().await.get(serno).cloned()
    }

    /// Return the record for `serno`, creating it from `init` if absent.
    ///
    /// The write guard is held across `init`, so concurrent callers for
    /// the same serial observe exactly one initialization.
    pub async fn load_or_create<F, Fut>(&self, serno: &Serno, init: F) -> Arc<ActiveSg>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SgState>,
    {
        if let Some(existing) = self.get(serno).await {
            return existing;
        }
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(serno) {
            return Arc::clone(existing);
        }
        let record = Arc::new(ActiveSg::new(serno.clone(), init().await));
        records.insert(serno.clone(), Arc::clone(&record));
        record
    }

    /// All records, in no particular order.
    pub async fn records(&self) -> Vec<Arc<ActiveSg>> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Record lookup-or-create with store-backed initialization: last sync
/// time from the message log, tunnel port from the receiver registry.
/// Store errors degrade to "unknown" rather than failing the caller.
pub async fn ensure_record(
    registry: &SgRegistry,
    db: &Database,
    serno: &Serno,
    ts: DateTime<Utc>,
) -> Arc<ActiveSg> {
    registry
        .load_or_create(serno, || async {
            let ts_last_sync = match db.last_sync_time(serno).await {
                Ok(last) => last,
                Err(e) => {
                    warn!(%serno, error = %e, "Could not read last sync time");
                    None
                }
            };
            let tunnel_port = match db.tunnel_port(serno).await {
                Ok(port) => port,
                Err(e) => {
                    warn!(%serno, error = %e, "Could not read tunnel port");
                    0
                }
            };
            SgState {
                ts_conn: ts,
                ts_last_sync,
                ts_next_sync: None,
                tunnel_port,
                connected: true,
            }
        })
        .await
}
