use std::env;
use std::path::PathBuf;

use super::BoxError;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub data_root: PathBuf,
    pub senders_db_path: PathBuf,
    pub goals_db_path: PathBuf,
    pub messages_db_path: PathBuf,
    pub groups_db_path: PathBuf,
    pub deliveries_db_path: PathBuf,
    /// From address on every outbound email.
    pub from_address: String,
    /// Base URL for signup links sent to unknown senders.
    pub signup_base_url: String,
    /// Webhook signing secret. Verification is skipped when unset, which is
    /// only acceptable in local development.
    pub webhook_secret: Option<String>,
    pub inbound_body_max_bytes: usize,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("RUST_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("RUST_SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9001);

        let data_root = PathBuf::from(
            env::var("CHECKIN_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
        );

        let from_address = env::var("CHECKIN_FROM_ADDRESS")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "CHECKIN_FROM_ADDRESS not set".to_string())?;
        let signup_base_url = env::var("SIGNUP_BASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "SIGNUP_BASE_URL not set".to_string())?;
        let webhook_secret = env::var("CHECKIN_WEBHOOK_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let inbound_body_max_bytes = env::var("INBOUND_BODY_MAX_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES);

        Ok(Self {
            host,
            port,
            senders_db_path: data_root.join("senders.db"),
            goals_db_path: data_root.join("goals.db"),
            messages_db_path: data_root.join("messages.db"),
            groups_db_path: data_root.join("groups.db"),
            deliveries_db_path: data_root.join("deliveries.db"),
            data_root,
            from_address,
            signup_base_url,
            webhook_secret,
            inbound_body_max_bytes,
        })
    }
}
