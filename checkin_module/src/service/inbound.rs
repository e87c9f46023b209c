use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::conversation::InboundEmail;
use crate::delivery_store::dedupe_key;

use super::envelope::{InboundEnvelope, EMAIL_RECEIVED};
use super::state::AppState;
use super::verify::verify_signature;

/// POST /webhooks/inbound
///
/// Verification and dedupe happen before any state changes. Internal
/// failures surface as a generic 500; error detail stays in the logs.
pub(super) async fn ingest_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(reason) = verify_signature(state.config.webhook_secret.as_deref(), &headers, &body) {
        warn!("rejected webhook delivery: {}", reason);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "action": "rejected"})),
        );
    }

    let envelope: InboundEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("unparseable webhook payload: {}", err);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "action": "bad_payload"})),
            );
        }
    };

    if envelope.event_type != EMAIL_RECEIVED {
        info!("ignoring webhook event type {}", envelope.event_type);
        return (
            StatusCode::OK,
            Json(json!({"success": true, "action": "ignored"})),
        );
    }

    let delivery_id = headers
        .get("webhook-id")
        .and_then(|value| value.to_str().ok())
        .or(envelope.data.message_id.as_deref());
    let key = dedupe_key(delivery_id, &body);
    match state.deliveries.mark_processed(&key) {
        Ok(true) => {}
        Ok(false) => {
            info!("duplicate delivery {} skipped", key);
            return (
                StatusCode::OK,
                Json(json!({"success": true, "action": "duplicate"})),
            );
        }
        Err(err) => {
            error!("delivery dedupe failed: {}", err);
            return internal_error();
        }
    }

    let inbound = InboundEmail {
        from: envelope.data.from.clone(),
        subject: envelope.data.subject.clone(),
        body: envelope.data.body_text(),
        cc: envelope.data.cc_addresses(),
    };

    match state.conversation.handle_inbound(inbound).await {
        Ok(outcome) => {
            let mut response = json!({
                "success": true,
                "action": outcome.action.as_str(),
            });
            if let (Value::Object(map), Some(first)) = (&mut response, outcome.is_first_email) {
                map.insert("isFirstEmail".to_string(), Value::Bool(first));
            }
            (StatusCode::OK, Json(response))
        }
        Err(err) => {
            error!("inbound email processing failed: {}", err);
            // A failed delivery must stay retryable by the provider.
            if let Err(err) = state.deliveries.forget(&key) {
                error!("failed to release delivery {}: {}", key, err);
            }
            internal_error()
        }
    }
}

fn internal_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "action": "error"})),
    )
}
