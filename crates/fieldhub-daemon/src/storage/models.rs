//! Database models for the FieldHub daemon.

use serde::{Deserialize, Serialize};

/// Receiver registry row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Receiver {
    pub serno: String,
    pub creationdate: f64,
    pub tunnelport: Option<i64>,
    pub pubkey: Option<String>,
    pub privkey: Option<String>,
    pub verified: i64,
}

/// Message log row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoggedMessage {
    pub ts: f64,
    pub sender: String,
    pub message: String,
}
