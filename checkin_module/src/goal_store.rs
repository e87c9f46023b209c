use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::sender_store::{format_datetime, parse_datetime};

#[derive(Debug, Clone)]
pub struct GoalStore {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GoalRecord {
    pub goal_id: String,
    pub sender_id: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum GoalStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("date parse error: {0}")]
    DateParse(String),
}

impl GoalStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, GoalStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn create(
        &self,
        sender_id: &str,
        description: &str,
        due_date: NaiveDate,
    ) -> Result<GoalRecord, GoalStoreError> {
        let conn = self.open()?;
        let now = Utc::now();
        let goal_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO goals (id, sender_id, description, due_date, completed, completed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
            params![
                goal_id,
                sender_id,
                description.trim(),
                due_date.to_string(),
                format_datetime(now)
            ],
        )?;
        Ok(GoalRecord {
            goal_id,
            sender_id: sender_id.to_string(),
            description: description.trim().to_string(),
            due_date,
            completed: false,
            completed_at: None,
            created_at: now,
        })
    }

    /// The sender's active goal: most recently created, not completed.
    /// Duplicate active goals (a tolerated race) resolve by recency here.
    pub fn active_goal(&self, sender_id: &str) -> Result<Option<GoalRecord>, GoalStoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, sender_id, description, due_date, completed, completed_at, created_at
                 FROM goals
                 WHERE sender_id = ?1 AND completed = 0
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![sender_id],
                row_to_goal,
            )
            .optional()?;
        row.map(into_goal).transpose()
    }

    /// Mark a goal complete. `completed_at` is written at most once: a goal
    /// that is already complete is left untouched and `false` is returned.
    pub fn mark_completed(&self, goal_id: &str) -> Result<bool, GoalStoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE goals SET completed = 1, completed_at = ?1
             WHERE id = ?2 AND completed = 0",
            params![format_datetime(Utc::now()), goal_id],
        )?;
        Ok(updated > 0)
    }

    pub fn count_completed(&self, sender_id: &str) -> Result<u64, GoalStoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM goals WHERE sender_id = ?1 AND completed = 1",
            params![sender_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get(&self, goal_id: &str) -> Result<Option<GoalRecord>, GoalStoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, sender_id, description, due_date, completed, completed_at, created_at
                 FROM goals WHERE id = ?1",
                params![goal_id],
                row_to_goal,
            )
            .optional()?;
        row.map(into_goal).transpose()
    }

    fn open(&self) -> Result<Connection, GoalStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(GOALS_SCHEMA)?;
        Ok(conn)
    }
}

type GoalRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    String,
);

fn row_to_goal(row: &rusqlite::Row<'_>) -> rusqlite::Result<GoalRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_goal(row: GoalRow) -> Result<GoalRecord, GoalStoreError> {
    let (goal_id, sender_id, description, due_date, completed, completed_at, created_at) = row;
    Ok(GoalRecord {
        goal_id,
        sender_id,
        description,
        due_date: due_date
            .parse::<NaiveDate>()
            .map_err(|err| GoalStoreError::DateParse(err.to_string()))?,
        completed: completed != 0,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        created_at: parse_datetime(&created_at)?,
    })
}

const GOALS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS goals (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    description TEXT NOT NULL,
    due_date TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_goals_sender ON goals (sender_id, completed, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn store() -> (TempDir, GoalStore) {
        let temp = TempDir::new().expect("tempdir");
        let store = GoalStore::new(temp.path().join("goals.db")).expect("store");
        (temp, store)
    }

    fn due() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, 6).unwrap()
    }

    #[test]
    fn active_goal_prefers_most_recent_open_goal() {
        let (_temp, store) = store();
        let first = store.create("s1", "run 3 times", due()).expect("create");
        let second = store.create("s1", "run 5k", due()).expect("create");

        let active = store.active_goal("s1").expect("query").expect("some");
        // Same-timestamp inserts tie-break on id; either way it is not a
        // completed goal and recency wins once the first is closed.
        assert!(!active.completed);

        store.mark_completed(&first.goal_id).expect("complete");
        let active = store.active_goal("s1").expect("query").expect("some");
        assert_eq!(active.goal_id, second.goal_id);
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let (_temp, store) = store();
        let goal = store.create("s1", "write 500 words", due()).expect("create");

        assert!(store.mark_completed(&goal.goal_id).expect("first"));
        let first = store.get(&goal.goal_id).expect("get").expect("some");
        let first_completed_at = first.completed_at.expect("timestamp");

        // Replay must not move completed_at.
        assert!(!store.mark_completed(&goal.goal_id).expect("second"));
        let second = store.get(&goal.goal_id).expect("get").expect("some");
        assert_eq!(second.completed_at, Some(first_completed_at));
    }

    #[test]
    fn no_goal_means_no_active_goal() {
        let (_temp, store) = store();
        assert!(store.active_goal("nobody").expect("query").is_none());
    }
}
