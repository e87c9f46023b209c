use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::sender_store::{format_datetime, parse_datetime};

#[derive(Debug, Clone)]
pub struct MessageStore {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    fn parse(value: &str) -> Direction {
        if value == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub sender_id: String,
    pub direction: Direction,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub progress_summary: Option<String>,
    pub mood: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inbound mail held for an address with no account yet. Keyed by the raw
/// email address and carrying its own thread-key scheme.
#[derive(Debug, Clone)]
pub struct ProvisionalRecord {
    pub provisional_id: String,
    pub email: String,
    pub direction: Direction,
    pub subject: String,
    pub body: String,
    pub thread_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

impl MessageStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, MessageStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn insert(
        &self,
        sender_id: &str,
        direction: Direction,
        subject: &str,
        body: &str,
        thread_id: Option<&str>,
    ) -> Result<MessageRecord, MessageStoreError> {
        let conn = self.open()?;
        let now = Utc::now();
        let message_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO messages (id, sender_id, direction, subject, body, thread_id, progress_summary, mood, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7)",
            params![
                message_id,
                sender_id,
                direction.as_str(),
                subject,
                body,
                thread_id,
                format_datetime(now)
            ],
        )?;
        Ok(MessageRecord {
            message_id,
            sender_id: sender_id.to_string(),
            direction,
            subject: subject.to_string(),
            body: body.to_string(),
            thread_id: thread_id.map(|value| value.to_string()),
            progress_summary: None,
            mood: None,
            created_at: now,
        })
    }

    /// A message that starts a thread carries its own id as its thread id.
    pub fn start_thread(&self, message_id: &str) -> Result<(), MessageStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE messages SET thread_id = ?1 WHERE id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    /// Write derived annotations after extraction. Non-critical: callers log
    /// and continue on failure.
    pub fn annotate(
        &self,
        message_id: &str,
        progress_summary: &str,
        mood: &str,
    ) -> Result<(), MessageStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE messages SET progress_summary = ?1, mood = ?2 WHERE id = ?3",
            params![progress_summary, mood, message_id],
        )?;
        Ok(())
    }

    /// Most recent message for the sender whose subject contains `needle`
    /// (case-insensitive) and which already belongs to a thread.
    pub fn latest_thread_with_subject(
        &self,
        sender_id: &str,
        needle: &str,
    ) -> Result<Option<String>, MessageStoreError> {
        let conn = self.open()?;
        let thread_id = conn
            .query_row(
                "SELECT thread_id FROM messages
                 WHERE sender_id = ?1
                   AND thread_id IS NOT NULL
                   AND instr(lower(subject), lower(?2)) > 0
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
                params![sender_id, needle],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(thread_id)
    }

    /// Ordered conversation history for a thread, oldest first. `limit` keeps
    /// only the most recent messages so prompt size stays bounded.
    pub fn thread_history(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, direction, subject, body, thread_id, progress_summary, mood, created_at
             FROM messages
             WHERE thread_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit as i64], row_to_message)?;
        collect_oldest_first(rows)
    }

    /// Ordered history across all of a sender's messages, oldest first,
    /// capped to the most recent `limit`.
    pub fn sender_history(
        &self,
        sender_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, direction, subject, body, thread_id, progress_summary, mood, created_at
             FROM messages
             WHERE sender_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sender_id, limit as i64], row_to_message)?;
        collect_oldest_first(rows)
    }

    /// The sender's most recent outbound messages, newest first.
    pub fn recent_outbound(
        &self,
        sender_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, direction, subject, body, thread_id, progress_summary, mood, created_at
             FROM messages
             WHERE sender_id = ?1 AND direction = 'outbound'
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sender_id, limit as i64], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(finish_message(row?)?);
        }
        Ok(messages)
    }

    pub fn insert_provisional(
        &self,
        email: &str,
        direction: Direction,
        subject: &str,
        body: &str,
        thread_key: &str,
    ) -> Result<ProvisionalRecord, MessageStoreError> {
        let conn = self.open()?;
        let now = Utc::now();
        let provisional_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO provisional_messages (id, email, direction, subject, body, thread_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                provisional_id,
                email,
                direction.as_str(),
                subject,
                body,
                thread_key,
                format_datetime(now)
            ],
        )?;
        Ok(ProvisionalRecord {
            provisional_id,
            email: email.to_string(),
            direction,
            subject: subject.to_string(),
            body: body.to_string(),
            thread_key: thread_key.to_string(),
            created_at: now,
        })
    }

    pub fn count_provisional(&self, email: &str) -> Result<u64, MessageStoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM provisional_messages WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn list_provisional(
        &self,
        email: &str,
    ) -> Result<Vec<ProvisionalRecord>, MessageStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, direction, subject, body, thread_key, created_at
             FROM provisional_messages
             WHERE email = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![email], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (provisional_id, email, direction, subject, body, thread_key, created_at) = row?;
            records.push(ProvisionalRecord {
                provisional_id,
                email,
                direction: Direction::parse(&direction),
                subject,
                body,
                thread_key,
                created_at: parse_datetime(&created_at)?,
            });
        }
        Ok(records)
    }

    /// Move an address's held messages into the account's message history,
    /// then retire the provisional rows. The first message migrated for each
    /// provisional thread key becomes that thread's root.
    pub fn migrate_provisional(
        &self,
        email: &str,
        sender_id: &str,
    ) -> Result<usize, MessageStoreError> {
        let held = self.list_provisional(email)?;
        let mut thread_roots: HashMap<String, String> = HashMap::new();
        let mut migrated = 0usize;

        for record in &held {
            let conn = self.open()?;
            let message_id = Uuid::new_v4().to_string();
            let thread_id = thread_roots
                .entry(record.thread_key.clone())
                .or_insert_with(|| message_id.clone())
                .clone();
            conn.execute(
                "INSERT INTO messages (id, sender_id, direction, subject, body, thread_id, progress_summary, mood, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7)",
                params![
                    message_id,
                    sender_id,
                    record.direction.as_str(),
                    record.subject,
                    record.body,
                    thread_id,
                    format_datetime(record.created_at)
                ],
            )?;
            migrated += 1;
        }

        let conn = self.open()?;
        conn.execute(
            "DELETE FROM provisional_messages WHERE email = ?1",
            params![email],
        )?;
        Ok(migrated)
    }

    fn open(&self) -> Result<Connection, MessageStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(MESSAGES_SCHEMA)?;
        Ok(conn)
    }
}

type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_message(row: MessageRow) -> Result<MessageRecord, MessageStoreError> {
    let (message_id, sender_id, direction, subject, body, thread_id, progress_summary, mood, created_at) =
        row;
    Ok(MessageRecord {
        message_id,
        sender_id,
        direction: Direction::parse(&direction),
        subject,
        body,
        thread_id,
        progress_summary,
        mood,
        created_at: parse_datetime(&created_at)?,
    })
}

fn collect_oldest_first(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<MessageRow>>,
) -> Result<Vec<MessageRecord>, MessageStoreError> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(finish_message(row?)?);
    }
    messages.reverse();
    Ok(messages)
}

const MESSAGES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    thread_id TEXT,
    progress_summary TEXT,
    mood TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages (sender_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages (thread_id, created_at);

CREATE TABLE IF NOT EXISTS provisional_messages (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    direction TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    thread_key TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_provisional_email ON provisional_messages (email, created_at);
"#;
