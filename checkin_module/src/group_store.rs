use chrono::Utc;
use rusqlite::{params, Connection};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::sender_store::format_datetime;

/// Accountability groups created when a member confirms a group invitation.
#[derive(Debug, Clone)]
pub struct GroupStore {
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum GroupStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GroupStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, GroupStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    /// Create a group and enroll the given senders. Returns the group id.
    pub fn create_with_members(&self, sender_ids: &[String]) -> Result<String, GroupStoreError> {
        let conn = self.open()?;
        let group_id = Uuid::new_v4().to_string();
        let now = format_datetime(Utc::now());
        conn.execute(
            "INSERT INTO groups (id, created_at) VALUES (?1, ?2)",
            params![group_id, now],
        )?;
        for sender_id in sender_ids {
            conn.execute(
                "INSERT INTO group_members (group_id, sender_id, joined_at) VALUES (?1, ?2, ?3)",
                params![group_id, sender_id, now],
            )?;
        }
        Ok(group_id)
    }

    pub fn member_count(&self, group_id: &str) -> Result<u64, GroupStoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn groups_for_sender(&self, sender_id: &str) -> Result<Vec<String>, GroupStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT group_id FROM group_members WHERE sender_id = ?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![sender_id], |row| row.get::<_, String>(0))?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    fn open(&self) -> Result<Connection, GroupStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(GROUPS_SCHEMA)?;
        Ok(conn)
    }
}

const GROUPS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (group_id, sender_id)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_enrolls_members() {
        let temp = TempDir::new().expect("tempdir");
        let store = GroupStore::new(temp.path().join("groups.db")).expect("store");

        let group_id = store
            .create_with_members(&["s1".to_string(), "s2".to_string()])
            .expect("create");
        assert_eq!(store.member_count(&group_id).expect("count"), 2);
        assert_eq!(store.groups_for_sender("s1").expect("list"), vec![group_id]);
    }
}
