//! In-process message broker with topic exchanges, named queues, routing-key
//! bindings and per-message ack/nack. The broker is an owned resource handed
//! to publishers and consumers at construction time; there is no module-level
//! channel singleton.
//!
//! Delivery is at-least-once: a consumer must either `ack` a message or
//! `nack_requeue` it. A nacked message is re-delivered to the same queue after
//! the given delay without blocking the consumer loop, with its attempt
//! counter incremented.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::error::AppError;

/// Name of the implicit default exchange: publishing to it routes the message
/// directly to the queue named by the routing key, as AMQP does.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct Binding {
    pattern: String,
    queue: String,
}

#[derive(Debug)]
struct Envelope {
    payload: Vec<u8>,
    routing_key: String,
    persistent: bool,
    attempt: u32,
}

#[derive(Debug)]
struct QueueCore {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
    depth: AtomicUsize,
}

impl QueueCore {
    fn enqueue(&self, envelope: Envelope) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(envelope).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            error!(queue = %self.name, "queue channel closed; message lost");
        }
    }
}

struct QueueEntry {
    core: Arc<QueueCore>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    durable: bool,
}

pub struct Broker {
    exchanges: DashMap<String, Vec<Binding>>,
    queues: DashMap<String, QueueEntry>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
        }
    }

    /// Idempotent, like a broker-side re-declare.
    pub fn declare_exchange(&self, name: &str) {
        self.exchanges.entry(name.to_string()).or_default();
    }

    /// Idempotent. The durable flag is part of the topology contract: queues
    /// carrying persistent messages must be declared durable before the first
    /// publish.
    pub fn declare_queue(&self, name: &str, durable: bool) {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueEntry {
                core: Arc::new(QueueCore {
                    name: name.to_string(),
                    tx,
                    depth: AtomicUsize::new(0),
                }),
                rx: Mutex::new(Some(rx)),
                durable,
            }
        });
    }

    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), AppError> {
        if !self.queues.contains_key(queue) {
            return Err(AppError::Broker(format!("queue {queue} not declared")));
        }

        let mut bindings = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| AppError::Broker(format!("exchange {exchange} not declared")))?;

        bindings.push(Binding {
            pattern: pattern.to_string(),
            queue: queue.to_string(),
        });

        Ok(())
    }

    /// Fire-and-forget publish. Messages matching no binding are dropped, as
    /// an unroutable publish is on a real broker.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), AppError> {
        if exchange == DEFAULT_EXCHANGE {
            let entry = self.queues.get(routing_key).ok_or_else(|| {
                AppError::Broker(format!("queue {routing_key} not declared"))
            })?;
            entry.core.enqueue(Envelope {
                payload: payload.to_vec(),
                routing_key: routing_key.to_string(),
                persistent,
                attempt: 1,
            });
            return Ok(());
        }

        let bindings = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AppError::Broker(format!("exchange {exchange} not declared")))?;

        let mut routed = false;
        for binding in bindings.iter() {
            if !topic_matches(&binding.pattern, routing_key) {
                continue;
            }
            if let Some(entry) = self.queues.get(&binding.queue) {
                entry.core.enqueue(Envelope {
                    payload: payload.to_vec(),
                    routing_key: routing_key.to_string(),
                    persistent,
                    attempt: 1,
                });
                routed = true;
            }
        }

        if !routed {
            debug!(exchange, routing_key, "unroutable message dropped");
        }

        Ok(())
    }

    /// Takes the single consumer side of a queue. A queue can be consumed at
    /// most once for the lifetime of the broker.
    pub fn consume(&self, queue: &str) -> Result<QueueConsumer, AppError> {
        let entry = self
            .queues
            .get(queue)
            .ok_or_else(|| AppError::Broker(format!("queue {queue} not declared")))?;

        let rx = entry
            .rx
            .lock()
            .map_err(|_| AppError::Broker(format!("queue {queue} consumer lock poisoned")))?
            .take()
            .ok_or_else(|| AppError::Broker(format!("queue {queue} already consumed")))?;

        Ok(QueueConsumer {
            rx,
            core: entry.core.clone(),
        })
    }

    /// Messages currently waiting in the queue (excluding unacked in-flight
    /// deliveries and pending redeliveries).
    pub fn depth(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|entry| entry.core.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.queues
            .get(queue)
            .map(|entry| entry.durable)
            .unwrap_or(false)
    }
}

pub struct QueueConsumer {
    rx: mpsc::UnboundedReceiver<Envelope>,
    core: Arc<QueueCore>,
}

impl QueueConsumer {
    pub async fn recv(&mut self) -> Option<QueueMessage> {
        let envelope = self.rx.recv().await?;
        self.core.depth.fetch_sub(1, Ordering::SeqCst);
        Some(QueueMessage {
            envelope,
            core: self.core.clone(),
        })
    }
}

/// One delivery of a queued message. Dropping it without `ack` or
/// `nack_requeue` discards the message.
pub struct QueueMessage {
    envelope: Envelope,
    core: Arc<QueueCore>,
}

impl QueueMessage {
    pub fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.envelope.routing_key
    }

    pub fn persistent(&self) -> bool {
        self.envelope.persistent
    }

    /// 1 on first delivery, incremented by each requeue.
    pub fn attempt(&self) -> u32 {
        self.envelope.attempt
    }

    /// Removes the message from the queue for good.
    pub fn ack(self) {}

    /// Schedules re-delivery after `delay`. Returns immediately; the delay
    /// runs off the consumer loop so a deferred message only delays itself.
    pub fn nack_requeue(self, delay: Duration) {
        let core = self.core;
        let envelope = Envelope {
            attempt: self.envelope.attempt + 1,
            ..self.envelope
        };
        tokio::spawn(async move {
            sleep(delay).await;
            core.enqueue(envelope);
        });
    }
}

/// AMQP-style topic match: `*` matches exactly one dot-separated segment,
/// `#` matches zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&segment), Some(&key_segment)) if segment == key_segment => {
                matches(&pattern[1..], &key[1..])
            }
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{topic_matches, Broker};

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.ready_for_delivery", "order.ready_for_delivery"));
        assert!(topic_matches("order.*", "order.ready_for_delivery"));
        assert!(topic_matches("#", "delivery.assigned"));
        assert!(topic_matches("delivery.#", "delivery.assigned"));
        assert!(topic_matches("delivery.#", "delivery"));
        assert!(!topic_matches("order.*", "delivery.assigned"));
        assert!(!topic_matches("order.*", "order.a.b"));
        assert!(!topic_matches("order.ready_for_delivery", "order.placed"));
    }

    fn topology() -> Broker {
        let broker = Broker::new();
        broker.declare_exchange("orders");
        broker.declare_queue("assignment", true);
        broker.bind("assignment", "orders", "order.*").unwrap();
        broker
    }

    #[tokio::test]
    async fn publish_routes_to_bound_queue() {
        let broker = topology();
        broker
            .publish("orders", "order.ready_for_delivery", b"payload", true)
            .unwrap();

        assert_eq!(broker.depth("assignment"), 1);

        let mut consumer = broker.consume("assignment").unwrap();
        let message = consumer.recv().await.unwrap();

        assert_eq!(message.payload(), b"payload");
        assert_eq!(message.routing_key(), "order.ready_for_delivery");
        assert!(message.persistent());
        assert_eq!(message.attempt(), 1);
        assert_eq!(broker.depth("assignment"), 0);

        message.ack();
        assert_eq!(broker.depth("assignment"), 0);
    }

    #[tokio::test]
    async fn unroutable_message_is_dropped() {
        let broker = topology();
        broker
            .publish("orders", "delivery.assigned", b"x", true)
            .unwrap();
        assert_eq!(broker.depth("assignment"), 0);
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = topology();
        assert!(broker.publish("ghost", "order.placed", b"x", true).is_err());
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = topology();
        broker.publish("", "assignment", b"direct", false).unwrap();

        let mut consumer = broker.consume("assignment").unwrap();
        let message = consumer.recv().await.unwrap();
        assert_eq!(message.payload(), b"direct");
        assert!(!message.persistent());
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let broker = topology();
        broker.publish("orders", "order.ready_for_delivery", b"retry", true).unwrap();

        let mut consumer = broker.consume("assignment").unwrap();
        let first = consumer.recv().await.unwrap();
        assert_eq!(first.attempt(), 1);
        first.nack_requeue(Duration::from_millis(10));

        let second = consumer.recv().await.unwrap();
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.payload(), b"retry");
    }

    #[tokio::test]
    async fn queue_has_a_single_consumer() {
        let broker = topology();
        let _consumer = broker.consume("assignment").unwrap();
        assert!(broker.consume("assignment").is_err());
    }

    #[test]
    fn durability_flag_is_recorded() {
        let broker = topology();
        broker.declare_queue("scratch", false);
        assert!(broker.is_durable("assignment"));
        assert!(!broker.is_durable("scratch"));
    }
}
