//! # Event Consumer
//!
//! Consumer-side delivery contract for platform events.
//!
//! Every delivery goes through the same sequence:
//!
//! 1. parse the envelope (malformed ones are dead-lettered)
//! 2. look up `(eventID, consumer)` in the [`ProcessedEventLedger`]; a hit is acked
//!    without calling the handler
//! 3. run the handler through its [`Middleware`] chain, retrying transient
//!    failures with backoff up to the attempt budget
//! 4. write the ledger entry, then ack
//!
//! Poison failures and exhausted retries go to a [`DeadLetterSink`] and the
//! message is terminated, so the broker stops redelivering it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BrokerClient, InMemoryBus};
//! use event_consumer::{
//!     handler_fn, ConsumerConfig, ConsumerRuntime, HandlerError, InMemoryDeadLetterStore,
//!     InMemoryLedger, TracingMiddleware,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = BrokerClient::from_bus(Arc::new(InMemoryBus::new()));
//!
//! let handle = ConsumerRuntime::new(
//!     ConsumerConfig::new("notifications"),
//!     broker,
//!     Arc::new(InMemoryLedger::new()),
//!     Arc::new(InMemoryDeadLetterStore::new()),
//! )
//! .layer(TracingMiddleware)
//! .subscribe(
//!     "events.billing.subscription.created",
//!     handler_fn(|envelope| async move {
//!         println!("{}", envelope.event_id);
//!         Ok::<_, HandlerError>(())
//!     }),
//! )
//! .start()
//! .await?;
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod dlq;
mod error;
mod handler;
pub mod ledger;
pub mod metrics;
mod middleware;
pub mod runtime;

pub use dlq::{
    BusDeadLetterSink, DeadLetter, DeadLetterKind, DeadLetterReplayer, DeadLetterSink,
    DeadLetterStore, FanoutDeadLetterSink, InMemoryDeadLetterStore, PgDeadLetterStore,
};
pub use error::{ConsumerError, DeadLetterError, HandlerError, LedgerError};
pub use handler::{handler_fn, EventHandler, FnHandler, Typed, TypedEventHandler};
pub use ledger::{InMemoryLedger, LedgerOutcome, PgLedger, ProcessedEventLedger};
pub use metrics::ConsumerMetrics;
pub use middleware::{Middleware, Next, OnSuccess, Pipeline, TimeoutMiddleware, TracingMiddleware};
pub use runtime::{ConsumerConfig, ConsumerHandle, ConsumerRuntime, Dispatcher, Outcome};
