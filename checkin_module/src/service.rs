mod config;
mod envelope;
mod inbound;
mod server;
mod state;
mod verify;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ServiceConfig, DEFAULT_INBOUND_BODY_MAX_BYTES};
pub use envelope::{EmailPayload, InboundEnvelope, EMAIL_RECEIVED};
pub use server::run_server;
