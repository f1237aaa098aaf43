//! Shared database types and utilities.
//!
//! Provides `DatabaseError`, epoch-seconds timestamp conversion, and pool
//! creation helpers used by the daemon's storage layer. Timestamps are
//! stored as REAL seconds-since-epoch so sub-second precision survives.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// A very generous busy wait; receiver provisioning tools write to the
/// same file and can hold the lock for a while.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Database errors shared across FieldHub storage layers.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Open (or create) a `SQLite` connection pool at the given file path.
///
/// Creates the parent directory if it does not exist, enables WAL journal
/// mode, and sets a 60-second busy timeout.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(path = %path.display(), "Database opened");

    Ok(pool)
}

/// Open an in-memory `SQLite` connection pool (for testing).
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .busy_timeout(BUSY_TIMEOUT);

    // A single connection, or each pool checkout would see its own empty db.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    Ok(pool)
}

/// Convert an instant to REAL seconds-since-epoch for storage.
pub fn to_epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9
}

/// Convert stored REAL seconds back to an instant.
///
/// Zero (or anything unrepresentable) maps to `None`, matching the "no
/// such event recorded yet" convention.
pub fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if secs <= 0.0 || !secs.is_finite() {
        return None;
    }
    let mut whole = secs.trunc() as i64;
    let mut nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
    if nanos >= 1_000_000_000 {
        whole += 1;
        nanos = 0;
    }
    Utc.timestamp_opt(whole, nanos).single()
}

/// Macro to define a `Database`-like struct with `open`, `open_in_memory`,
/// `run_migrations`, and `pool` methods.
///
/// Usage:
/// ```ignore
/// fieldhub_core::define_database!(Database, "Database migrations complete");
/// ```
///
/// The generated struct has:
/// - `pub async fn open(path: &Path) -> Result<Self, DatabaseError>`
/// - `pub async fn open_in_memory() -> Result<Self, DatabaseError>`
/// - `async fn run_migrations(&self) -> Result<(), DatabaseError>`
/// - `pub const fn pool(&self) -> &Pool<Sqlite>`
#[macro_export]
macro_rules! define_database {
    ($name:ident, $migration_msg:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            /// Open or create a database at the given path.
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                let pool = $crate::db::open_pool(path).await?;
                let db = Self { pool };
                db.run_migrations().await?;
                Ok(db)
            }

            /// Open an in-memory database (for testing).
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                let pool = $crate::db::open_pool_in_memory().await?;
                let db = Self { pool };
                db.run_migrations().await?;
                Ok(db)
            }

            /// Run database migrations.
            async fn run_migrations(&self) -> ::std::result::Result<(), $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&self.pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;

                ::tracing::info!($migration_msg);
                Ok(())
            }

            /// Get a reference to the connection pool.
            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn epoch_secs_roundtrip_keeps_subsecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let secs = to_epoch_secs(ts);
        let back = from_epoch_secs(secs).unwrap();
        let delta = (back - ts).num_nanoseconds().unwrap().abs();
        // f64 seconds carry ~microsecond precision at current epoch values
        assert!(delta < 1_000, "roundtrip drifted by {delta} ns");
    }

    #[test]
    fn zero_epoch_means_never() {
        assert!(from_epoch_secs(0.0).is_none());
        assert!(from_epoch_secs(-1.5).is_none());
        assert!(from_epoch_secs(f64::NAN).is_none());
    }
}
