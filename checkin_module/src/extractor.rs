//! Fact extraction and reply composition against the model provider.
//!
//! Every extraction operation sends a fixed instruction template and expects
//! a single JSON object back. Non-conforming output is a parse failure, never
//! a best-effort partial result.
//!
//! Configuration:
//! - `OPENAI_API_KEY`: API key (required for the real client)
//! - `OPENAI_API_URL`: endpoint base (default `https://api.openai.com/v1`)
//! - `EXTRACTOR_MODEL`: model name (default `gpt-4o-mini`)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message_store::{Direction, MessageRecord};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const MODEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Callers cap conversation history to this many messages before prompting,
/// bounding cost and latency.
pub const HISTORY_LIMIT: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("OPENAI_API_KEY not set")]
    MissingApiKey,
    #[error("model authorization rejected ({status})")]
    Unauthorized { status: u16 },
    #[error("http error: {0}")]
    Http(String),
    #[error("model provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model returned non-conforming output: {0}")]
    Parse(String),
}

impl ModelError {
    /// Authorization failures are terminal; everything else is worth a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelError::Unauthorized { .. } | ModelError::MissingApiKey)
    }
}

/// The generative-model capability. Constructed once at process start and
/// injected, so tests can substitute a scripted fake.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()),
            api_url: env::var("OPENAI_API_URL").unwrap_or_else(|_| DEFAULT_OPENAI_URL.to_string()),
            model: env::var("EXTRACTOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self::with_config(OpenAiConfig::default())
    }

    pub fn with_config(config: OpenAiConfig) -> Self {
        let client = Client::builder()
            .timeout(MODEL_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let api_key = self.config.api_key.as_ref().ok_or(ModelError::MissingApiKey)?;
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_completion_tokens: 1024,
        };

        debug!("calling model {} at {}", self.config.model, url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|err| ModelError::Http(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ModelError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ModelError::Parse(err.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ModelError::Parse("empty completion".to_string()));
        }
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

// ============================================================================
// Extraction shapes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Positive,
    Neutral,
    Negative,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Positive => "positive",
            Mood::Neutral => "neutral",
            Mood::Negative => "negative",
        }
    }
}

/// Structured facts pulled from a weekly check-in reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckinExtraction {
    pub progress: String,
    pub completed: bool,
    /// Explicit null when the reply named no next goal.
    pub next_goal: Option<String>,
    pub mood: Mood,
}

/// Single-shot onboarding parse, used outside conversational onboarding.
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingExtraction {
    pub name: String,
    pub goal: String,
    pub parsed: bool,
    #[serde(default)]
    pub clarification: Option<String>,
}

/// Multi-turn onboarding: completeness is computed over the entire
/// accumulated history each turn, so a name given two messages ago is
/// still honored.
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingTurn {
    pub complete: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    pub reply: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckinComposition {
    pub message: String,
    pub ask_for_next_goal: bool,
}

// ============================================================================
// Prompts
// ============================================================================

const CHECKIN_EXTRACT_PROMPT: &str = r#"You are the extraction step of an email accountability partner.
Given the member's weekly goal and their latest reply (with conversation history for context), extract:
- progress: one-sentence summary of what they reported
- completed: true only if they clearly state the goal was accomplished
- next_goal: the next goal they named, or null if none was named
- mood: exactly one of "positive", "neutral", "negative"

Respond with ONLY a JSON object: {"progress": "...", "completed": bool, "next_goal": "..." | null, "mood": "..."}"#;

const ONBOARDING_EXTRACT_PROMPT: &str = r#"You are the onboarding step of an email accountability partner.
From the member's message, extract their first name and their first weekly goal.
Respond with ONLY a JSON object:
{"name": "...", "goal": "...", "parsed": bool, "clarification": "..."}
Set parsed=false and fill clarification with a short friendly question when either field is missing."#;

const ONBOARDING_TURN_PROMPT: &str = r#"You are onboarding a new member of an email accountability partner over several emails.
You will receive the full onboarding conversation so far plus the latest message.
Re-read the ENTIRE history: a name or goal given in an earlier message still counts.
Respond with ONLY a JSON object:
{"complete": bool, "name": "...", "goal": "...", "reply": "..."}
complete is true only when both name and goal are known. reply is the next email to send:
a warm confirmation when complete, otherwise a short question for whichever detail is missing."#;

const CHECKIN_COMPOSE_PROMPT: &str = r#"You are an email accountability partner writing the reply to a member's weekly check-in.
You receive their first name, their goal, the extracted facts, and the conversation history.
Be warm and specific. Congratulate completion; encourage otherwise.
Respond with ONLY a JSON object: {"message": "...", "ask_for_next_goal": bool}
ask_for_next_goal must be false when the member already named a next goal."#;

const OPEN_CONVERSATION_PROMPT: &str = r#"You are an email accountability partner chatting with a member who has no active goal right now.
Reply warmly in plain text (no JSON). Keep it short. If it fits naturally, nudge them toward picking a goal for next week."#;

const JOURNEY_SUMMARY_PROMPT: &str = r#"You are an email accountability partner summarizing a member's journey so far.
You receive their first name, conversation history, goals completed, current goal, and weeks active.
Write a short encouraging plain-text summary (no JSON) of their progress story."#;

// ============================================================================
// Extractor
// ============================================================================

/// Wraps the injected model capability with the fixed extraction prompts.
#[derive(Clone)]
pub struct FactExtractor {
    model: Arc<dyn ModelClient>,
}

impl FactExtractor {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    pub async fn extract_checkin_reply(
        &self,
        message: &str,
        goal_description: &str,
        history: &[MessageRecord],
    ) -> Result<CheckinExtraction, ModelError> {
        let user = format!(
            "Goal: {}\n\nConversation history:\n{}\n\nLatest reply:\n{}",
            goal_description,
            render_history(history),
            message
        );
        let raw = self.model.complete(CHECKIN_EXTRACT_PROMPT, &user).await?;
        parse_json(&raw)
    }

    pub async fn extract_onboarding_reply(
        &self,
        message: &str,
    ) -> Result<OnboardingExtraction, ModelError> {
        let raw = self.model.complete(ONBOARDING_EXTRACT_PROMPT, message).await?;
        parse_json(&raw)
    }

    pub async fn extract_onboarding_turn(
        &self,
        latest_message: &str,
        history: &[MessageRecord],
    ) -> Result<OnboardingTurn, ModelError> {
        let user = format!(
            "Onboarding conversation so far:\n{}\n\nLatest message:\n{}",
            render_history(history),
            latest_message
        );
        let raw = self.model.complete(ONBOARDING_TURN_PROMPT, &user).await?;
        parse_json(&raw)
    }

    pub async fn compose_checkin_reply(
        &self,
        first_name: &str,
        goal_description: &str,
        extraction: &CheckinExtraction,
        history: &[MessageRecord],
    ) -> Result<CheckinComposition, ModelError> {
        let user = format!(
            "Member: {}\nGoal: {}\nExtracted: progress={:?} completed={} next_goal={:?} mood={}\n\nConversation history:\n{}",
            first_name,
            goal_description,
            extraction.progress,
            extraction.completed,
            extraction.next_goal,
            extraction.mood.as_str(),
            render_history(history)
        );
        let raw = self.model.complete(CHECKIN_COMPOSE_PROMPT, &user).await?;
        parse_json(&raw)
    }

    pub async fn compose_open_conversation_reply(
        &self,
        first_name: &str,
        message: &str,
        history: &[MessageRecord],
        goal_description: Option<&str>,
    ) -> Result<String, ModelError> {
        let user = format!(
            "Member: {}\nCurrent goal: {}\n\nConversation history:\n{}\n\nLatest message:\n{}",
            first_name,
            goal_description.unwrap_or("(none)"),
            render_history(history),
            message
        );
        let raw = self.model.complete(OPEN_CONVERSATION_PROMPT, &user).await?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::Parse("empty reply".to_string()));
        }
        Ok(trimmed.to_string())
    }

    pub async fn compose_journey_summary(
        &self,
        first_name: &str,
        history: &[MessageRecord],
        goals_completed: u64,
        current_goal: Option<&str>,
        weeks_active: i64,
    ) -> Result<String, ModelError> {
        let user = format!(
            "Member: {}\nGoals completed: {}\nCurrent goal: {}\nWeeks active: {}\n\nConversation history:\n{}",
            first_name,
            goals_completed,
            current_goal.unwrap_or("(none)"),
            weeks_active,
            render_history(history)
        );
        let raw = self.model.complete(JOURNEY_SUMMARY_PROMPT, &user).await?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::Parse("empty summary".to_string()));
        }
        Ok(trimmed.to_string())
    }
}

fn render_history(history: &[MessageRecord]) -> String {
    if history.is_empty() {
        return "(none)".to_string();
    }
    let mut lines = Vec::with_capacity(history.len());
    for message in history {
        let speaker = match message.direction {
            Direction::Inbound => "member",
            Direction::Outbound => "partner",
        };
        lines.push(format!("{}: {}", speaker, message.body.trim()));
    }
    lines.join("\n")
}

/// Parse the single JSON object an extraction prompt demands. Models
/// sometimes wrap output in markdown fences; strip those, but nothing else.
fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, ModelError> {
    let trimmed = strip_fences(raw);
    serde_json::from_str(trimmed).map_err(|err| ModelError::Parse(err.to_string()))
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkin_extraction() {
        let raw = r#"{"progress": "ran twice", "completed": false, "next_goal": null, "mood": "neutral"}"#;
        let parsed: CheckinExtraction = parse_json(raw).expect("parse");
        assert!(!parsed.completed);
        assert_eq!(parsed.next_goal, None);
        assert_eq!(parsed.mood, Mood::Neutral);
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "```json\n{\"progress\": \"did it\", \"completed\": true, \"next_goal\": \"run 5k\", \"mood\": \"positive\"}\n```";
        let parsed: CheckinExtraction = parse_json(raw).expect("parse");
        assert!(parsed.completed);
        assert_eq!(parsed.next_goal.as_deref(), Some("run 5k"));
    }

    #[test]
    fn mood_is_a_closed_set() {
        let raw = r#"{"progress": "x", "completed": true, "next_goal": null, "mood": "ecstatic"}"#;
        let result: Result<CheckinExtraction, _> = parse_json(raw);
        assert!(matches!(result, Err(ModelError::Parse(_))));
    }

    #[test]
    fn prose_instead_of_json_is_a_parse_failure() {
        let result: Result<CheckinExtraction, _> =
            parse_json("Sure! The member completed their goal.");
        assert!(matches!(result, Err(ModelError::Parse(_))));
    }

    #[test]
    fn parses_single_shot_onboarding() {
        let raw = r#"{"name": "Jane", "goal": "run a 5k", "parsed": true}"#;
        let parsed: OnboardingExtraction = parse_json(raw).expect("parse");
        assert!(parsed.parsed);
        assert_eq!(parsed.clarification, None);
    }

    #[test]
    fn onboarding_turn_tolerates_missing_optionals() {
        let raw = r#"{"complete": false, "reply": "What should I call you?"}"#;
        let parsed: OnboardingTurn = parse_json(raw).expect("parse");
        assert!(!parsed.complete);
        assert_eq!(parsed.name, None);
        assert_eq!(parsed.goal, None);
    }

    #[tokio::test]
    async fn single_shot_onboarding_runs_through_the_model() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::Regex("onboarding step".to_string()))
            .with_status(200)
            .with_body(
                r#"{"choices": [{"message": {"role": "assistant", "content": "{\"name\": \"Jane\", \"goal\": \"run a 5k\", \"parsed\": true}"}}]}"#,
            )
            .create_async()
            .await;

        let client = OpenAiClient::with_config(OpenAiConfig {
            api_key: Some("key".to_string()),
            api_url: server.url(),
            model: "test-model".to_string(),
        });
        let extractor = FactExtractor::new(Arc::new(client));

        let extraction = extractor
            .extract_onboarding_reply("I'm Jane and I'll run a 5k this week")
            .await
            .expect("extract");
        assert!(extraction.parsed);
        assert_eq!(extraction.name, "Jane");
        assert_eq!(extraction.goal, "run a 5k");
    }

    #[tokio::test]
    async fn openai_client_maps_auth_failures_to_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error": {"message": "bad key"}}"#)
            .create_async()
            .await;

        let client = OpenAiClient::with_config(OpenAiConfig {
            api_key: Some("bad-key".to_string()),
            api_url: server.url(),
            model: "test-model".to_string(),
        });

        let err = client.complete("system", "user").await.expect_err("401");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn openai_client_returns_completion_content() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices": [{"message": {"role": "assistant", "content": "{\"ok\": true}"}}]}"#,
            )
            .create_async()
            .await;

        let client = OpenAiClient::with_config(OpenAiConfig {
            api_key: Some("key".to_string()),
            api_url: server.url(),
            model: "test-model".to_string(),
        });

        let content = client.complete("system", "user").await.expect("complete");
        assert_eq!(content, r#"{"ok": true}"#);
    }

    #[tokio::test]
    async fn openai_client_server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("oops")
            .create_async()
            .await;

        let client = OpenAiClient::with_config(OpenAiConfig {
            api_key: Some("key".to_string()),
            api_url: server.url(),
            model: "test-model".to_string(),
        });

        let err = client.complete("system", "user").await.expect_err("500");
        assert!(!err.is_terminal());
        assert!(matches!(err, ModelError::Api { status: 500, .. }));
    }
}
