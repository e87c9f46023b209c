//! End-to-end flow tests over real HTTP clients: the model provider and the
//! mail provider are both mockito servers, everything else is the real code
//! path from inbound email to outbound reply.

use std::sync::Arc;

use chrono::Utc;
use mockito::Matcher;
use serial_test::serial;
use tempfile::TempDir;

use checkin_module::conversation::{Action, Conversation, InboundEmail};
use checkin_module::extractor::{FactExtractor, OpenAiClient};
use checkin_module::goal_store::GoalStore;
use checkin_module::group_store::GroupStore;
use checkin_module::mailer::PostmarkMailer;
use checkin_module::message_store::MessageStore;
use checkin_module::retry::RetryPolicy;
use checkin_module::sender_store::SenderStore;
use checkin_module::week::next_week_boundary;

fn chat_completion(content: &str) -> String {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
    .to_string()
}

const POSTMARK_OK: &str = r#"{
    "To": "jane@x.com",
    "SubmittedAt": "2026-08-29T10:00:00Z",
    "MessageID": "pm-1",
    "ErrorCode": 0,
    "Message": "OK"
}"#;

fn conversation(temp: &TempDir) -> Conversation {
    Conversation {
        senders: SenderStore::new(temp.path().join("senders.db")).expect("senders"),
        goals: GoalStore::new(temp.path().join("goals.db")).expect("goals"),
        messages: MessageStore::new(temp.path().join("messages.db")).expect("messages"),
        groups: GroupStore::new(temp.path().join("groups.db")).expect("groups"),
        extractor: FactExtractor::new(Arc::new(OpenAiClient::new())),
        mailer: Arc::new(PostmarkMailer::new("partner@service.com")),
        retry: RetryPolicy::immediate(2),
        signup_base_url: "https://example.com".to_string(),
    }
}

fn seed_active_sender(conv: &Conversation) {
    let sender = conv.senders.create_pending("jane@x.com").expect("pending");
    conv.senders
        .mark_onboarded(&sender.sender_id, "Jane")
        .expect("onboard");
    conv.goals
        .create(&sender.sender_id, "run a 5k", next_week_boundary(Utc::now()))
        .expect("goal");
}

#[tokio::test]
#[serial]
async fn checkin_reply_round_trips_through_both_providers() {
    let mut model_server = mockito::Server::new_async().await;
    let mut mail_server = mockito::Server::new_async().await;
    std::env::set_var("OPENAI_API_KEY", "test-key");
    std::env::set_var("OPENAI_API_URL", model_server.url());
    std::env::set_var("POSTMARK_SERVER_TOKEN", "test-token");
    std::env::set_var("POSTMARK_API_BASE_URL", mail_server.url());

    let extraction = model_server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("extraction step".to_string()))
        .with_status(200)
        .with_body(chat_completion(
            r#"{"progress": "ran it", "completed": true, "next_goal": null, "mood": "positive"}"#,
        ))
        .create_async()
        .await;
    let composition = model_server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("writing the reply".to_string()))
        .with_status(200)
        .with_body(chat_completion(
            r#"{"message": "Congrats on the 5k!", "ask_for_next_goal": true}"#,
        ))
        .create_async()
        .await;
    // The journey summary runs in the background; it may or may not land
    // before the test ends.
    let _summary = model_server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("summarizing".to_string()))
        .with_status(200)
        .with_body(chat_completion("Jane is doing great."))
        .create_async()
        .await;
    let delivery = mail_server
        .mock("POST", "/email")
        .match_header("X-Postmark-Server-Token", "test-token")
        .match_body(Matcher::Regex("Congrats on the 5k".to_string()))
        .with_status(200)
        .with_body(POSTMARK_OK)
        .create_async()
        .await;

    let temp = TempDir::new().expect("tempdir");
    let conv = conversation(&temp);
    seed_active_sender(&conv);

    let outcome = conv
        .handle_inbound(InboundEmail {
            from: "jane@x.com".to_string(),
            subject: "Re: Weekly check-in".to_string(),
            body: "Ran the 5k this morning!".to_string(),
            cc: vec![],
        })
        .await
        .expect("handle");

    assert_eq!(outcome.action, Action::CheckinRecorded);
    extraction.assert_async().await;
    composition.assert_async().await;
    delivery.assert_async().await;
}

#[tokio::test]
#[serial]
async fn model_outage_still_delivers_the_fallback_reply() {
    let mut model_server = mockito::Server::new_async().await;
    let mut mail_server = mockito::Server::new_async().await;
    std::env::set_var("OPENAI_API_KEY", "test-key");
    std::env::set_var("OPENAI_API_URL", model_server.url());
    std::env::set_var("POSTMARK_SERVER_TOKEN", "test-token");
    std::env::set_var("POSTMARK_API_BASE_URL", mail_server.url());

    let outage = model_server
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body("upstream error")
        .expect(2)
        .create_async()
        .await;
    let delivery = mail_server
        .mock("POST", "/email")
        .match_body(Matcher::Regex("having trouble reading messages".to_string()))
        .with_status(200)
        .with_body(POSTMARK_OK)
        .create_async()
        .await;

    let temp = TempDir::new().expect("tempdir");
    let conv = conversation(&temp);
    seed_active_sender(&conv);

    let outcome = conv
        .handle_inbound(InboundEmail {
            from: "jane@x.com".to_string(),
            subject: "Re: Weekly check-in".to_string(),
            body: "went okay".to_string(),
            cc: vec![],
        })
        .await
        .expect("handle");

    assert_eq!(outcome.action, Action::FallbackSent);
    outage.assert_async().await;
    delivery.assert_async().await;
}
