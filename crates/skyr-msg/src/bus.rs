//! ---
//! skyr_section: "02-messaging-ipc-data-model"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Topic based publish/subscribe bus abstraction."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{MessagingError, QoS, Result};

/// A message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Delivery guarantee requested by the publisher.
    pub qos: QoS,
}

/// Receiving side of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Filter this subscription was created with.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next message. `None` once the bus drops the subscription.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Return a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Publish/subscribe transport used by bus-backed devices.
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a concrete topic.
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()>;
    /// Subscribe to a topic filter (`+` matches one level, `#` the rest).
    fn subscribe(&self, filter: &str) -> Result<Subscription>;
    /// Whether the bus can currently carry traffic.
    fn is_connected(&self) -> bool;
    /// Human-readable bus name for logging.
    fn name(&self) -> &'static str;
}

/// MQTT style topic filter matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_filter(filter: &str) -> Result<()> {
    let levels: Vec<&str> = filter.split('/').collect();
    let hash_misplaced = levels
        .iter()
        .enumerate()
        .any(|(idx, level)| level.contains('#') && (*level != "#" || idx + 1 != levels.len()));
    let plus_misplaced = levels
        .iter()
        .any(|level| level.contains('+') && *level != "+");
    if filter.is_empty() || hash_misplaced || plus_misplaced {
        return Err(MessagingError::InvalidTopic(filter.to_owned()));
    }
    Ok(())
}

type Subscribers = Vec<(String, mpsc::UnboundedSender<BusMessage>)>;

/// Process-local bus fanning messages out to matching subscribers.
#[derive(Clone)]
pub struct InMemoryBus {
    subscribers: Arc<RwLock<Subscribers>>,
    connected: Arc<AtomicBool>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryBus {
    /// Create a connected bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker link going up or down.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(MessagingError::Disconnected);
        }
        if topic.is_empty() || topic.contains('+') || topic.contains('#') {
            return Err(MessagingError::InvalidTopic(topic.to_owned()));
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|(_, sender)| !sender.is_closed());
        let mut delivered = 0usize;
        for (filter, sender) in subscribers.iter() {
            if topic_matches(filter, topic) {
                let message = BusMessage {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                    qos,
                };
                if sender.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!(topic, delivered, "in-memory publish");
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<Subscription> {
        validate_filter(filter)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.write().push((filter.to_owned(), sender));
        debug!(filter, "in-memory subscription added");
        Ok(Subscription {
            filter: filter.to_owned(),
            receiver,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Placeholder for a broker-backed MQTT link.
#[derive(Debug, Clone)]
pub struct MqttBrokerBus {
    broker: String,
}

impl MqttBrokerBus {
    /// Record the broker URL the link would connect to.
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
        }
    }

    /// Broker URL this link targets.
    pub fn broker(&self) -> &str {
        &self.broker
    }
}

impl MessageBus for MqttBrokerBus {
    fn publish(&self, _topic: &str, _payload: Vec<u8>, _qos: QoS) -> Result<()> {
        Err(MessagingError::Unimplemented("mqtt broker transport"))
    }

    fn subscribe(&self, _filter: &str) -> Result<Subscription> {
        Err(MessagingError::Unimplemented("mqtt broker transport"))
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "mqtt_broker"
    }
}
