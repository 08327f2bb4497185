//! Mock transport for tests
use crate::match_topic::match_topic;
use crate::port::QoS;
use crate::transport::{ActionCallback, MessageHandler, Transport};
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

impl PublishRecord {
    /// Payload parsed as JSON, `Null` if it isn't
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_default()
    }
}

struct SubscriptionRecord {
    filter: String,
    qos: QoS,
    handler: Arc<MessageHandler>,
}

/// Records every action and loops publishes back to matching subscriptions
///
/// Actions complete synchronously. Messages are handed to handlers on the
/// thread that published or called [`MockTransport::deliver`].
#[derive(Default)]
pub struct MockTransport {
    publishes: Mutex<Vec<PublishRecord>>,
    subscriptions: Mutex<Vec<SubscriptionRecord>>,
    unsubscribes: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

// Test locks are never held across a panic that matters
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent subscribes fail (or succeed again)
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent unsubscribes fail (or succeed again)
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    /// All successful publishes so far
    pub fn publishes(&self) -> Vec<PublishRecord> {
        lock(&self.publishes).clone()
    }

    /// Successful publishes on one topic
    pub fn publishes_on(&self, topic: &str) -> Vec<PublishRecord> {
        lock(&self.publishes)
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Currently subscribed filters with their QoS
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions)
            .iter()
            .map(|sub| (sub.filter.clone(), sub.qos))
            .collect()
    }

    /// Filters unsubscribed so far, in order
    pub fn unsubscribes(&self) -> Vec<String> {
        lock(&self.unsubscribes).clone()
    }

    /// Inject a message as if it came from the broker
    ///
    /// Returns the number of handlers it was delivered to.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        // Copy relevant handlers before calling them, a handler may publish
        let handlers: Vec<Arc<MessageHandler>> = lock(&self.subscriptions)
            .iter()
            .filter(|sub| match_topic(&sub.filter, topic))
            .map(|sub| sub.handler.clone())
            .collect();

        for handler in handlers.iter() {
            handler(topic, payload);
        }
        handlers.len()
    }
}

impl Transport for MockTransport {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>, done: ActionCallback) {
        debug!("Mock publish on {topic}");
        if self.fail_publish.load(Ordering::SeqCst) {
            done(Err(anyhow!("Mock publish refused on {topic}")));
            return;
        }

        lock(&self.publishes).push(PublishRecord {
            topic: topic.to_string(),
            qos,
            payload: payload.clone(),
        });

        done(Ok(()));
        self.deliver(topic, &payload);
    }

    fn subscribe(&self, filter: &str, qos: QoS, handler: Arc<MessageHandler>, done: ActionCallback) {
        debug!("Mock subscribe on {filter}");
        if self.fail_subscribe.load(Ordering::SeqCst) {
            done(Err(anyhow!("Mock subscribe refused on {filter}")));
            return;
        }

        {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.retain(|sub| sub.filter != filter);
            subscriptions.push(SubscriptionRecord {
                filter: filter.to_string(),
                qos,
                handler,
            });
        }
        done(Ok(()));
    }

    fn unsubscribe(&self, filter: &str, done: ActionCallback) {
        debug!("Mock unsubscribe on {filter}");
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            done(Err(anyhow!("Mock unsubscribe refused on {filter}")));
            return;
        }

        lock(&self.subscriptions).retain(|sub| sub.filter != filter);
        lock(&self.unsubscribes).push(filter.to_string());
        done(Ok(()));
    }
}
