use chrono::Utc;
use rusqlite::{params, Connection};
use std::fs;
use std::path::PathBuf;

use crate::sender_store::format_datetime;

/// Idempotency guard for webhook redelivery: processing inserts message and
/// goal rows, so the same delivery must not run twice. Keyed by the
/// provider-assigned delivery id (or an md5 of the raw body when absent).
#[derive(Debug, Clone)]
pub struct DeliveryStore {
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, DeliveryStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    /// Record a delivery id. Returns false when it was already seen.
    pub fn mark_processed(&self, delivery_id: &str) -> Result<bool, DeliveryStoreError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_deliveries (delivery_id, processed_at) VALUES (?1, ?2)",
            params![delivery_id, format_datetime(Utc::now())],
        )?;
        Ok(inserted > 0)
    }

    /// Release a delivery id after a failed run so the provider's
    /// redelivery is processed instead of answered as a duplicate.
    pub fn forget(&self, delivery_id: &str) -> Result<(), DeliveryStoreError> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM processed_deliveries WHERE delivery_id = ?1",
            params![delivery_id],
        )?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, DeliveryStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(DELIVERIES_SCHEMA)?;
        Ok(conn)
    }
}

const DELIVERIES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processed_deliveries (
    delivery_id TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL
);
"#;

/// Dedupe key for a delivery: the provider id when present, otherwise a
/// digest of the raw body.
pub fn dedupe_key(delivery_id: Option<&str>, raw_body: &[u8]) -> String {
    match delivery_id.map(str::trim).filter(|value| !value.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("{:x}", md5::compute(raw_body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_delivery_is_flagged_duplicate() {
        let temp = TempDir::new().expect("tempdir");
        let store = DeliveryStore::new(temp.path().join("deliveries.db")).expect("store");

        assert!(store.mark_processed("evt_1").expect("first"));
        assert!(!store.mark_processed("evt_1").expect("second"));
        assert!(store.mark_processed("evt_2").expect("other"));
    }

    #[test]
    fn forgetting_a_delivery_makes_it_retryable() {
        let temp = TempDir::new().expect("tempdir");
        let store = DeliveryStore::new(temp.path().join("deliveries.db")).expect("store");

        assert!(store.mark_processed("evt_1").expect("first"));
        store.forget("evt_1").expect("forget");
        assert!(store.mark_processed("evt_1").expect("retry"));
    }

    #[test]
    fn dedupe_key_falls_back_to_body_digest() {
        assert_eq!(dedupe_key(Some("evt_1"), b"x"), "evt_1");
        let a = dedupe_key(None, b"same");
        let b = dedupe_key(Some("  "), b"same");
        assert_eq!(a, b);
        assert_ne!(a, dedupe_key(None, b"different"));
    }
}
