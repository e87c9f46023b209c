pub mod compose;
pub mod conversation;
pub mod extractor;
pub mod patterns;
pub mod retry;
pub mod service;
pub mod threads;
pub mod week;

pub mod delivery_store;
pub mod goal_store;
pub mod group_store;
pub mod message_store;
pub mod sender_store;

pub mod mailer;
