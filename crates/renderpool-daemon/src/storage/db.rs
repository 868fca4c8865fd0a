//! Database connection and initialization.

pub use renderpool_core::db::DatabaseError;

renderpool_core::define_database!(Database, "Worker database migrations complete");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn reopening_file_database_keeps_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workers.db");

        let db = Database::open(&path).await.unwrap();
        db.insert_running("job-1", "/data/a", 11111, 4242).await.unwrap();
        drop(db);

        let db = Database::open(&path).await.unwrap();
        let record = db.get_by_job("job-1").await.unwrap().unwrap();
        assert_eq!(record.port, Some(11111));
    }
}
