//! Middleware composed around handler invocation
//!
//! Layers run outermost first. Each receives the envelope and a [`Next`]
//! continuation and decides whether, and how, to call it.

use crate::error::HandlerError;
use crate::handler::EventHandler;
use async_trait::async_trait;
use event_bus::RawEnvelope;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, envelope: &RawEnvelope, next: Next<'_>) -> Result<(), HandlerError>;
}

/// Remainder of the chain: the inner layers followed by the handler
pub struct Next<'a> {
    handler: &'a dyn EventHandler,
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        match self.rest.split_first() {
            Some((layer, rest)) => {
                layer
                    .handle(
                        envelope,
                        Next {
                            handler: self.handler,
                            rest,
                        },
                    )
                    .await
            }
            None => self.handler.handle(envelope).await,
        }
    }
}

/// A handler with its middleware stack
#[derive(Clone)]
pub struct Pipeline {
    handler: Arc<dyn EventHandler>,
    layers: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn EventHandler>, layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            handler,
            layers: layers.into(),
        }
    }

    pub async fn run(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        Next {
            handler: self.handler.as_ref(),
            rest: &self.layers,
        }
        .run(envelope)
        .await
    }
}

/// Wraps the call in a span carrying the event metadata and logs the outcome
#[derive(Debug, Default, Clone)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(&self, envelope: &RawEnvelope, next: Next<'_>) -> Result<(), HandlerError> {
        let span = tracing::info_span!(
            "handle_event",
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            schema_version = envelope.schema_version,
            producer = %envelope.producer,
            aggregate_id = envelope.aggregate_id.as_deref().unwrap_or(""),
            correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
        );

        async move {
            let started = Instant::now();
            let result = next.run(envelope).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(()) => tracing::debug!(elapsed_ms, "Handler succeeded"),
                Err(e) => tracing::warn!(elapsed_ms, error = %e, "Handler failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Fails the attempt as retryable if the inner chain runs too long
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, envelope: &RawEnvelope, next: Next<'_>) -> Result<(), HandlerError> {
        match tokio::time::timeout(self.timeout, next.run(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Retryable(format!(
                "handler timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// Runs an effect after, and only after, the inner chain succeeded
///
/// Typical use is invalidating a cache entry once the write it depends on
/// has been applied.
pub struct OnSuccess<F> {
    effect: F,
}

impl<F, Fut> OnSuccess<F>
where
    F: Fn(RawEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    pub fn new(effect: F) -> Self {
        Self { effect }
    }
}

#[async_trait]
impl<F, Fut> Middleware for OnSuccess<F>
where
    F: Fn(RawEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, envelope: &RawEnvelope, next: Next<'_>) -> Result<(), HandlerError> {
        next.run(envelope).await?;
        (self.effect)(envelope.clone()).await;
        Ok(())
    }
}
