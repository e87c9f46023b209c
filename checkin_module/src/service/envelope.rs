use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::sender_store::extract_emails;

/// Event type for an inbound email delivery. Other event types on the same
/// endpoint are acknowledged and ignored.
pub const EMAIL_RECEIVED: &str = "email.received";

/// Webhook envelope: an event type plus the event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EmailPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailPayload {
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    /// CC line as raw text; addresses are pulled out with a simple
    /// address scan, not full list parsing.
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
}

impl EmailPayload {
    /// Plain-text body: the text part when present, otherwise the HTML
    /// part with tags stripped. Clients that send HTML-only mail still get
    /// their words through.
    pub fn body_text(&self) -> String {
        if let Some(text) = self.text.as_deref() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        match self.html.as_deref() {
            Some(html) => strip_tags(html),
            None => String::new(),
        }
    }

    pub fn cc_addresses(&self) -> Vec<String> {
        self.cc
            .as_deref()
            .map(extract_emails)
            .unwrap_or_default()
    }
}

fn strip_tags(html: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap());
    let stripped = tag.replace_all(html, " ");
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}
