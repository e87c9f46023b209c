use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SenderStore {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SenderRecord {
    pub sender_id: String,
    pub email: String,
    pub name: Option<String>,
    pub onboarded: bool,
    pub journey_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SenderStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

impl SenderStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SenderStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<SenderRecord>, SenderStoreError> {
        let normalized = normalize_email(email)
            .ok_or_else(|| SenderStoreError::InvalidEmail(email.to_string()))?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, email, name, onboarded, journey_summary, created_at
                 FROM senders WHERE email = ?1",
                params![normalized],
                row_to_record,
            )
            .optional()?;
        row.map(into_record).transpose()
    }

    /// Create a pending (not yet onboarded) sender for an email address.
    /// Used by web signup and magic-link confirmation.
    pub fn create_pending(&self, email: &str) -> Result<SenderRecord, SenderStoreError> {
        let normalized = normalize_email(email)
            .ok_or_else(|| SenderStoreError::InvalidEmail(email.to_string()))?;
        if let Some(existing) = self.find_by_email(&normalized)? {
            return Ok(existing);
        }
        let conn = self.open()?;
        let now = Utc::now();
        let sender_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO senders (id, email, name, onboarded, journey_summary, created_at)
             VALUES (?1, ?2, NULL, 0, NULL, ?3)",
            params![sender_id, normalized, format_datetime(now)],
        )?;
        Ok(SenderRecord {
            sender_id,
            email: normalized,
            name: None,
            onboarded: false,
            journey_summary: None,
            created_at: now,
        })
    }

    /// Transition pending -> active once onboarding captured both name and goal.
    pub fn mark_onboarded(&self, sender_id: &str, name: &str) -> Result<(), SenderStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE senders SET name = ?1, onboarded = 1 WHERE id = ?2",
            params![name.trim(), sender_id],
        )?;
        Ok(())
    }

    pub fn update_journey_summary(
        &self,
        sender_id: &str,
        summary: &str,
    ) -> Result<(), SenderStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE senders SET journey_summary = ?1 WHERE id = ?2",
            params![summary, sender_id],
        )?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, SenderStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SENDERS_SCHEMA)?;
        Ok(conn)
    }
}

type SenderRow = (String, String, Option<String>, i64, Option<String>, String);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SenderRow> {
    Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Option<String>>(2)?,
        row.get::<_, i64>(3)?,
        row.get::<_, Option<String>>(4)?,
        row.get::<_, String>(5)?,
    ))
}

fn into_record(row: SenderRow) -> Result<SenderRecord, SenderStoreError> {
    let (sender_id, email, name, onboarded, journey_summary, created_at) = row;
    Ok(SenderRecord {
        sender_id,
        email,
        name,
        onboarded: onboarded != 0,
        journey_summary,
        created_at: parse_datetime(&created_at)?,
    })
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    if value.is_empty() {
        return None;
    }
    // A display-name mailbox ("Jane Doe <jane@x.com>") carries the address
    // inside the angle brackets; the display name is dropped.
    if let Some(start) = value.find('<') {
        if let Some(end) = value[start + 1..].find('>') {
            value = &value[start + 1..start + 1 + end];
        }
    }
    if let Some(stripped) = value.strip_prefix("mailto:") {
        value = stripped.trim();
    }
    value = value.trim_matches(|ch: char| matches!(ch, '<' | '>' | '"' | '\'' | ',' | ';'));
    // Addresses scanned out of prose keep the sentence's punctuation.
    value = value.trim_end_matches(|ch: char| matches!(ch, '?' | '!' | '.' | ',' | ':' | ';'));
    if !value.contains('@') {
        return None;
    }

    let mut parts = value.splitn(2, '@');
    let local = parts.next().unwrap_or("").trim();
    let domain = parts.next().unwrap_or("").trim();
    if local.is_empty() || domain.is_empty() {
        return None;
    }

    Some(format!(
        "{}@{}",
        local.to_ascii_lowercase(),
        domain.to_ascii_lowercase()
    ))
}

/// Pull every address out of a raw header value ("Jane <jane@x.com>, bob@y.com").
/// Angle-bracketed mailboxes first, then bare tokens; deduplicated in order.
pub fn extract_emails(raw: &str) -> Vec<String> {
    let mut emails = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut remainder = raw;
    while let Some(start) = remainder.find('<') {
        let after_start = &remainder[start + 1..];
        if let Some(end) = after_start.find('>') {
            let inside = &after_start[..end];
            if let Some(email) = normalize_email(inside) {
                if seen.insert(email.clone()) {
                    emails.push(email);
                }
            }
            remainder = &after_start[end + 1..];
        } else {
            break;
        }
    }

    for token in raw.split(|ch| matches!(ch, ',' | ';' | ' ' | '\t' | '\n' | '\r')) {
        if let Some(email) = normalize_email(token) {
            if seen.insert(email.clone()) {
                emails.push(email);
            }
        }
    }

    emails
}

const SENDERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS senders (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT,
    onboarded INTEGER NOT NULL DEFAULT 0,
    journey_summary TEXT,
    created_at TEXT NOT NULL
);
"#;

pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_is_idempotent_and_normalizes() {
        let temp = TempDir::new().expect("tempdir");
        let store = SenderStore::new(temp.path().join("senders.db")).expect("store");

        let first = store.create_pending("Jane <Jane@X.com>").expect("create");
        let second = store.create_pending("jane@x.com").expect("create again");
        assert_eq!(first.sender_id, second.sender_id);
        assert_eq!(first.email, "jane@x.com");
        assert!(!first.onboarded);
    }

    #[test]
    fn normalize_drops_display_names() {
        assert_eq!(
            normalize_email("Jane Doe <Jane@X.com>").as_deref(),
            Some("jane@x.com")
        );
        assert_eq!(
            normalize_email("\"Doe, Jane\" <jane@x.com>").as_deref(),
            Some("jane@x.com")
        );
        assert_eq!(normalize_email("<jane@x.com>").as_deref(), Some("jane@x.com"));
    }

    #[test]
    fn normalize_trims_sentence_punctuation() {
        assert_eq!(normalize_email("sam@x.com?").as_deref(), Some("sam@x.com"));
        assert_eq!(normalize_email("sam@x.com.").as_deref(), Some("sam@x.com"));
        assert_eq!(normalize_email("sam@x.com!").as_deref(), Some("sam@x.com"));
    }

    #[test]
    fn extraction_handles_addresses_embedded_in_prose() {
        assert_eq!(
            extract_emails("Would you like to form an accountability group with sam@x.com?"),
            vec!["sam@x.com"]
        );
        assert_eq!(
            extract_emails("Jane Doe <jane@x.com> wrote: loop in pat@y.org."),
            vec!["jane@x.com", "pat@y.org"]
        );
    }

    #[test]
    fn display_name_sender_resolves_to_the_same_row() {
        let temp = TempDir::new().expect("tempdir");
        let store = SenderStore::new(temp.path().join("senders.db")).expect("store");

        let created = store.create_pending("jane@x.com").expect("create");
        let found = store
            .find_by_email("Jane Doe <Jane@X.com>")
            .expect("find")
            .expect("some");
        assert_eq!(found.sender_id, created.sender_id);
    }

    #[test]
    fn mark_onboarded_transitions_to_active() {
        let temp = TempDir::new().expect("tempdir");
        let store = SenderStore::new(temp.path().join("senders.db")).expect("store");

        let sender = store.create_pending("sam@x.com").expect("create");
        store.mark_onboarded(&sender.sender_id, "Sam").expect("onboard");

        let reloaded = store.find_by_email("sam@x.com").expect("find").expect("some");
        assert!(reloaded.onboarded);
        assert_eq!(reloaded.name.as_deref(), Some("Sam"));
    }

    #[test]
    fn extract_emails_handles_display_names_and_lists() {
        let found = extract_emails("Jane Doe <jane@x.com>, bob@y.com; jane@x.com");
        assert_eq!(found, vec!["jane@x.com".to_string(), "bob@y.com".to_string()]);
    }

    #[test]
    fn normalize_email_rejects_garbage() {
        assert_eq!(normalize_email("not-an-address"), None);
        assert_eq!(normalize_email("  "), None);
        assert_eq!(normalize_email("<JANE@X.COM>").as_deref(), Some("jane@x.com"));
    }
}
