use std::sync::Arc;

use crate::conversation::Conversation;
use crate::delivery_store::DeliveryStore;

use super::config::ServiceConfig;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) config: Arc<ServiceConfig>,
    pub(super) conversation: Conversation,
    pub(super) deliveries: DeliveryStore,
}
