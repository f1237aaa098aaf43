//! Database connection and initialization.

pub use fieldhub_core::db::DatabaseError;

fieldhub_core::define_database!(Database, "Database migrations complete");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }
}
