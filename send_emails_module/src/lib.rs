//! Outbound email transport via the Postmark HTTP API.
//!
//! Configuration:
//! - `POSTMARK_SERVER_TOKEN`: server token for the send endpoint (required)
//! - `POSTMARK_API_BASE_URL`: override for tests (default `https://api.postmarkapp.com`)
//! - `MESSAGE_STREAM`: Postmark message stream (default `outbound`)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

const DEFAULT_API_BASE_URL: &str = "https://api.postmarkapp.com";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SendEmailParams {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendEmailResponse {
    pub message_id: String,
    pub submitted_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendEmailError {
    #[error("POSTMARK_SERVER_TOKEN not set")]
    MissingToken,
    #[error("no recipients")]
    NoRecipients,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("postmark returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Serialize)]
struct PostmarkSendRequest {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "Cc", skip_serializing_if = "Option::is_none")]
    cc: Option<String>,
    #[serde(rename = "Subject")]
    subject: String,
    #[serde(rename = "HtmlBody", skip_serializing_if = "Option::is_none")]
    html_body: Option<String>,
    #[serde(rename = "TextBody", skip_serializing_if = "Option::is_none")]
    text_body: Option<String>,
    #[serde(rename = "MessageStream")]
    message_stream: String,
    #[serde(rename = "Headers", skip_serializing_if = "Vec::is_empty")]
    headers: Vec<PostmarkCustomHeader>,
}

#[derive(Debug, Serialize)]
struct PostmarkCustomHeader {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PostmarkSendResponse {
    #[serde(rename = "MessageID", alias = "MessageId")]
    message_id: String,
    #[serde(rename = "SubmittedAt")]
    submitted_at: String,
}

/// Send one email through Postmark. Blocking; callers on an async runtime
/// should wrap this in `spawn_blocking`.
pub fn send_email(params: &SendEmailParams) -> Result<SendEmailResponse, SendEmailError> {
    dotenvy::dotenv().ok();
    let token = std::env::var("POSTMARK_SERVER_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(SendEmailError::MissingToken)?;
    if params.to.is_empty() {
        return Err(SendEmailError::NoRecipients);
    }

    let api_base = std::env::var("POSTMARK_API_BASE_URL")
        .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());
    let url = format!("{}/email", api_base.trim_end_matches('/'));
    let message_stream =
        std::env::var("MESSAGE_STREAM").unwrap_or_else(|_| "outbound".to_string());

    let mut headers = Vec::new();
    if let Some(in_reply_to) = params.in_reply_to.as_deref().filter(|v| !v.is_empty()) {
        headers.push(PostmarkCustomHeader {
            name: "In-Reply-To".to_string(),
            value: in_reply_to.to_string(),
        });
    }
    if let Some(references) = params.references.as_deref().filter(|v| !v.is_empty()) {
        headers.push(PostmarkCustomHeader {
            name: "References".to_string(),
            value: references.to_string(),
        });
    }

    let request = PostmarkSendRequest {
        from: params.from.clone(),
        to: params.to.join(", "),
        cc: if params.cc.is_empty() {
            None
        } else {
            Some(params.cc.join(", "))
        },
        subject: params.subject.clone(),
        html_body: non_empty(&params.html_body),
        text_body: non_empty(&params.text_body),
        message_stream,
        headers,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(SEND_TIMEOUT)
        .build()?;
    let response = client
        .post(&url)
        .header("X-Postmark-Server-Token", token)
        .header("Accept", "application/json")
        .json(&request)
        .send()?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        return Err(SendEmailError::Api { status, body });
    }

    let parsed: PostmarkSendResponse = response.json()?;
    info!(
        "sent email to {:?}, message_id={}",
        params.to, parsed.message_id
    );
    Ok(SendEmailResponse {
        message_id: parsed.message_id,
        submitted_at: parsed.submitted_at,
    })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn params() -> SendEmailParams {
        SendEmailParams {
            from: "coach@example.com".to_string(),
            to: vec!["jane@x.com".to_string()],
            cc: vec![],
            subject: "Re: weekly check-in".to_string(),
            html_body: "<p>Nice work!</p>".to_string(),
            text_body: "Nice work!".to_string(),
            in_reply_to: Some("<abc@x.com>".to_string()),
            references: None,
        }
    }

    #[test]
    #[serial]
    fn send_email_posts_to_postmark() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/email")
            .match_header("x-postmark-server-token", "test-token")
            .with_status(200)
            .with_body(
                r#"{"MessageID":"pm-1","SubmittedAt":"2026-08-29T10:00:00Z","To":"jane@x.com"}"#,
            )
            .create();

        std::env::set_var("POSTMARK_SERVER_TOKEN", "test-token");
        std::env::set_var("POSTMARK_API_BASE_URL", server.url());

        let response = send_email(&params()).expect("send");
        assert_eq!(response.message_id, "pm-1");
        mock.assert();
    }

    #[test]
    #[serial]
    fn send_email_surfaces_api_errors() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/email")
            .with_status(422)
            .with_body(r#"{"ErrorCode":300,"Message":"Invalid 'To' address."}"#)
            .create();

        std::env::set_var("POSTMARK_SERVER_TOKEN", "test-token");
        std::env::set_var("POSTMARK_API_BASE_URL", server.url());

        match send_email(&params()) {
            Err(SendEmailError::Api { status, .. }) => assert_eq!(status, 422),
            other => panic!("expected api error, got {:?}", other.map(|_| ())),
        }
    }
}
