//! Subscriptions service library: lifecycle operations that announce
//! `billing.subscription.*` events through the transactional outbox.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repository;
pub mod service;

pub use error::SubscriptionError;
pub use repository::{InMemorySubscriptionRepository, PgSubscriptionRepository, SubscriptionRepository};
pub use service::SubscriptionService;
