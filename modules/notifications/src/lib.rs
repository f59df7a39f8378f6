//! Notifications service library: turns `billing.subscription.*` events into
//! queued notifications, at most one per event and template.

pub mod config;
pub mod consumer_tasks;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repository;

pub use consumer_tasks::{build_runtime, SubscriptionEvents};
pub use error::RepositoryError;
pub use repository::{InMemoryNotificationRepository, NotificationRepository, PgNotificationRepository};
