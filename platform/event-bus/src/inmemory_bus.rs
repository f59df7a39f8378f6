//! In-memory implementation of the EventBus trait for testing and development

use crate::{Acker, BusError, BusMessage, BusResult, EventBus, HEADER_MSG_ID};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Settlement of a message delivered through [`InMemoryBus::consume`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Acked {
        durable: String,
        msg_id: Option<String>,
    },
    Naked {
        durable: String,
        msg_id: Option<String>,
        delivery_attempt: u32,
    },
    Terminated {
        durable: String,
        msg_id: Option<String>,
    },
}

#[derive(Default)]
struct BusState {
    offline: bool,
    closed: bool,
    fail_next: u32,
    history: Vec<BusMessage>,
    acks: Vec<AckEvent>,
}

/// EventBus implementation using in-memory channels
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated message buses
///
/// Messages are broadcast to all subscribers via Tokio broadcast channels.
/// Durable consumers get explicit ack/nak/term semantics: a nak schedules a
/// redelivery with an incremented delivery attempt. Outages and publish
/// failures can be injected to exercise retry paths.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus.subscribe("test.events.>").await?;
///
/// // Publish a message
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// // Receive it
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "test.events.created");
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    // Large buffer so slow test subscribers do not lag
    sender: Arc<broadcast::Sender<BusMessage>>,
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    ///
    /// The bus uses a broadcast channel with a buffer of 1000 messages.
    /// If this buffer is exceeded, the oldest messages will be dropped.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom buffer size
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a broker outage (`true`) or recovery (`false`)
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Every message the bus accepted, in publish order
    pub fn published(&self) -> Vec<BusMessage> {
        self.state().history.clone()
    }

    /// How many times a message with this `Nats-Msg-Id` was accepted
    pub fn publish_count(&self, msg_id: &str) -> usize {
        self.state()
            .history
            .iter()
            .filter(|m| m.header(HEADER_MSG_ID) == Some(msg_id))
            .count()
    }

    /// Settlements recorded by durable consumers, in order
    pub fn ack_events(&self) -> Vec<AckEvent> {
        self.state().acks.clone()
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    ///
    /// # Examples
    /// - `auth.events.>` matches `auth.events.user.created`
    /// - `auth.*.created` matches `auth.user.created`
    /// - `auth.events.*` does NOT match `auth.events.user.created` (too many tokens)
    pub fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        // Both must be exhausted for a full match (unless pattern ended with `>`)
        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    fn accept(&self, msg: &BusMessage) -> BusResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(BusError::Closed);
        }
        if state.offline {
            return Err(BusError::ConnectionError(
                "in-memory broker is offline".to_string(),
            ));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BusError::PublishError(
                "injected publish failure".to_string(),
            ));
        }
        state.history.push(msg.clone());
        Ok(())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a raw message with an acker bound to a durable consumer's queue
fn attach_acker(
    durable: &str,
    msg: BusMessage,
    redeliver: mpsc::UnboundedSender<BusMessage>,
    state: Arc<Mutex<BusState>>,
) -> BusMessage {
    let acker = InMemoryAcker {
        durable: durable.to_string(),
        message: msg.clone(),
        redeliver,
        state,
        settled: AtomicBool::new(false),
    };
    msg.with_acker(Arc::new(acker))
}

struct InMemoryAcker {
    durable: String,
    // Copy without an acker, so redeliveries can be re-wrapped
    message: BusMessage,
    redeliver: mpsc::UnboundedSender<BusMessage>,
    state: Arc<Mutex<BusState>>,
    settled: AtomicBool,
}

impl InMemoryAcker {
    fn msg_id(&self) -> Option<String> {
        self.message.header(HEADER_MSG_ID).map(str::to_string)
    }

    fn record(&self, event: AckEvent) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acks
            .push(event);
    }

    /// Returns false if the message was already settled
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        if self.settle() {
            self.record(AckEvent::Acked {
                durable: self.durable.clone(),
                msg_id: self.msg_id(),
            });
        }
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        if !self.settle() {
            return Ok(());
        }
        self.record(AckEvent::Naked {
            durable: self.durable.clone(),
            msg_id: self.msg_id(),
            delivery_attempt: self.message.delivery_attempt,
        });

        let next_attempt = self.message.delivery_attempt + 1;
        let redelivery = self.message.clone().with_delivery_attempt(next_attempt);
        let redelivery = attach_acker(
            &self.durable,
            redelivery,
            self.redeliver.clone(),
            self.state.clone(),
        );
        let queue = self.redeliver.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            // Receiver gone means the consumer stopped; nothing left to redeliver to
            let _ = queue.send(redelivery);
        });
        Ok(())
    }

    async fn term(&self) -> BusResult<()> {
        if self.settle() {
            self.record(AckEvent::Terminated {
                durable: self.durable.clone(),
                msg_id: self.msg_id(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_message(BusMessage::new(subject.to_string(), payload))
            .await
    }

    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        self.accept(&msg)?;

        // No receivers is fine
        let _ = self.sender.send(msg);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "InMemoryBus: subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn consume(
        &self,
        durable_name: &str,
        pattern: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<BusMessage>();
        let pattern = pattern.to_string();
        let durable = durable_name.to_string();
        let state = self.state.clone();

        let forward_tx = queue_tx.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if !Self::matches_pattern(&msg.subject, &pattern) {
                            continue;
                        }
                        let msg = attach_acker(&durable, msg, forward_tx.clone(), state.clone());
                        if forward_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            durable = %durable,
                            skipped = skipped,
                            "InMemoryBus: durable consumer lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        drop(queue_tx);

        let stream = async_stream::stream! {
            while let Some(msg) = queue_rx.recv().await {
                yield msg;
            }
        };

        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        let state = self.state();
        !state.offline && !state.closed
    }

    async fn close(&self) -> BusResult<()> {
        self.state().closed = true;
        Ok(())
    }
}
