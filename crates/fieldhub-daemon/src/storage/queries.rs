//! Database queries for the FieldHub daemon.

use chrono::{DateTime, Utc};

use fieldhub_core::db::{from_epoch_secs, to_epoch_secs};

use super::db::{Database, DatabaseError};
use super::models::{LoggedMessage, Receiver};
use crate::message::{Serno, Topic};

impl Database {
    // =========================================================================
    // Message log
    // =========================================================================

    /// Append one row to the message log.
    pub async fn record_message(
        &self,
        ts: DateTime<Utc>,
        sender: &str,
        text: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO messages (ts, sender, message) VALUES (?, ?, ?)")
            .bind(to_epoch_secs(ts))
            .bind(sender)
            .bind(text)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// The latest time a sync was launched for `serno`, from the message
    /// log. `None` if no sync has been recorded.
    pub async fn last_sync_time(
        &self,
        serno: &Serno,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let max_ts: Option<f64> = sqlx::query_scalar(
            "SELECT max(ts) FROM messages WHERE sender = ? AND substr(message, 1, 1) = ?",
        )
        .bind(serno.as_str())
        .bind(Topic::SYNC_LAUNCHED.0.to_string())
        .fetch_one(self.pool())
        .await?;

        Ok(max_ts.and_then(from_epoch_secs))
    }

    /// Messages recorded for a sender, oldest first.
    pub async fn messages_for_sender(
        &self,
        sender: &str,
    ) -> Result<Vec<LoggedMessage>, DatabaseError> {
        let rows = sqlx::query_as::<_, LoggedMessage>(
            "SELECT ts, sender, message FROM messages WHERE sender = ? ORDER BY ts ASC",
        )
        .bind(sender)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    // =========================================================================
    // Receiver registry
    // =========================================================================

    /// The reverse-tunnel port registered for `serno`; 0 if the receiver
    /// is unknown or has no port assigned.
    pub async fn tunnel_port(&self, serno: &Serno) -> Result<u16, DatabaseError> {
        let port: Option<Option<i64>> =
            sqlx::query_scalar("SELECT tunnelport FROM receivers WHERE serno = ?")
                .bind(serno.as_str())
                .fetch_optional(self.pool())
                .await?;

        Ok(port
            .flatten()
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0))
    }

    /// Look up a registered receiver.
    pub async fn get_receiver(&self, serno: &Serno) -> Result<Receiver, DatabaseError> {
        sqlx::query_as::<_, Receiver>("SELECT * FROM receivers WHERE serno = ?")
            .bind(serno.as_str())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("receiver {serno}")))
    }

    /// All registered receivers, ordered by serial.
    pub async fn list_receivers(&self) -> Result<Vec<Receiver>, DatabaseError> {
        let rows = sqlx::query_as::<_, Receiver>("SELECT * FROM receivers ORDER BY serno")
            .fetch_all(self.pool())
            .await?;

        Ok(rows)
    }

    /// Register a receiver with its tunnel port and login key pair.
    pub async fn register_receiver(
        &self,
        serno: &Serno,
        tunnel_port: u16,
        pubkey: &str,
        privkey: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO receivers (serno, creationdate, tunnelport, pubkey, privkey, verified)
            VALUES (?, ?, ?, ?, ?, 0)
            ",
        )
        .bind(serno.as_str())
        .bind(to_epoch_secs(Utc::now()))
        .bind(i64::from(tunnel_port))
        .bind(pubkey)
        .bind(privkey)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Deprovision a receiver, moving its registry row to the history
    /// table so the serial and port assignment stay auditable.
    pub async fn delete_receiver(&self, serno: &Serno) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let moved = sqlx::query(
            r"
            INSERT INTO deleted_receivers
                (ts, serno, creationdate, tunnelport, pubkey, privkey, verified)
            SELECT ?, serno, creationdate, tunnelport, pubkey, privkey, verified
            FROM receivers WHERE serno = ?
            ",
        )
        .bind(to_epoch_secs(Utc::now()))
        .bind(serno.as_str())
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("receiver {serno}")));
        }

        sqlx::query("DELETE FROM receivers WHERE serno = ?")
            .bind(serno.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
