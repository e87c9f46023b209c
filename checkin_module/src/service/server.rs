use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use crate::conversation::Conversation;
use crate::delivery_store::DeliveryStore;
use crate::extractor::{FactExtractor, OpenAiClient};
use crate::goal_store::GoalStore;
use crate::group_store::GroupStore;
use crate::mailer::PostmarkMailer;
use crate::message_store::MessageStore;
use crate::retry::RetryPolicy;
use crate::sender_store::SenderStore;

use super::config::ServiceConfig;
use super::inbound::ingest_email;
use super::state::AppState;
use super::BoxError;

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);

    let conversation = Conversation {
        senders: SenderStore::new(&config.senders_db_path)?,
        goals: GoalStore::new(&config.goals_db_path)?,
        messages: MessageStore::new(&config.messages_db_path)?,
        groups: GroupStore::new(&config.groups_db_path)?,
        extractor: FactExtractor::new(Arc::new(OpenAiClient::new())),
        mailer: Arc::new(PostmarkMailer::new(config.from_address.clone())),
        retry: RetryPolicy::default(),
        signup_base_url: config.signup_base_url.clone(),
    };
    let deliveries = DeliveryStore::new(&config.deliveries_db_path)?;

    let state = AppState {
        config: config.clone(),
        conversation,
        deliveries,
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("check-in service listening on {}", addr);

    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/webhooks/inbound", post(ingest_email))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.inbound_body_max_bytes));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
