// In-memory loopback transport with its own delivery task
use anyhow::anyhow;
use config::Config;
use std::sync::{Arc, RwLock};
use thing_sdk::match_topic::match_topic;
use thing_sdk::{ActionCallback, MessageHandler, QoS, Transport};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

const DEFAULT_QUEUE: i64 = 100;

// Handlers by filter
type Subscriptions = Arc<RwLock<Vec<(String, Arc<MessageHandler>)>>>;

/// Loopback broker: everything published is delivered to matching subscribers
///
/// Publishes are queued in the order they are made and a single delivery task -
/// the transport's thread - invokes the handlers, so publishers never run
/// handlers themselves. A publish onto a full queue fails.
pub struct InMemoryTransport {
    subscriptions: Subscriptions,

    // Sender for published messages
    sender: mpsc::Sender<(String, Vec<u8>)>,
}

impl InMemoryTransport {
    /// Create on the current tokio runtime
    pub fn new(config: &Config) -> Self {
        let queue = config.get_int("queue")
            .ok()
            .and_then(|queue| usize::try_from(queue).ok())
            .filter(|queue| *queue > 0)
            .unwrap_or(DEFAULT_QUEUE as usize);

        info!("Creating in-memory transport with queue of {}", queue);

        let (sender, mut receiver) = mpsc::channel::<(String, Vec<u8>)>(queue);
        let subscriptions: Subscriptions = Arc::new(RwLock::new(Vec::new()));

        // Single receiver task to deliver published messages
        let subs = subscriptions.clone();
        tokio::spawn(async move {
            while let Some((topic, payload)) = receiver.recv().await {
                let handlers: Vec<Arc<MessageHandler>> = match subs.read() {
                    Ok(subs) => subs.iter()
                        .filter(|(filter, _)| match_topic(filter, &topic))
                        .map(|(_, handler)| handler.clone())
                        .collect(),
                    Err(e) => {
                        error!("Subscriptions unavailable: {e}");
                        continue;
                    }
                };

                if handlers.is_empty() {
                    debug!("No subscribers for {topic}");
                }
                for handler in handlers {
                    handler(&topic, &payload);
                }
            }
        });

        Self {
            subscriptions,
            sender,
        }
    }

    /// Drop all subscriptions
    pub fn shutdown(&self) {
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            subscriptions.clear();
        }
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>, done: ActionCallback) {
        match self.sender.try_send((topic.to_string(), payload)) {
            Ok(()) => done(Ok(())),
            Err(TrySendError::Full(_)) => {
                warn!("In-memory queue full, publish on {topic} refused");
                done(Err(anyhow!("In-memory transport queue full")));
            }
            Err(TrySendError::Closed(_)) => done(Err(anyhow!("In-memory transport closed"))),
        }
    }

    fn subscribe(&self, filter: &str, _qos: QoS, handler: Arc<MessageHandler>, done: ActionCallback) {
        match self.subscriptions.write() {
            Ok(mut subscriptions) => {
                subscriptions.retain(|(existing, _)| existing != filter);
                subscriptions.push((filter.to_string(), handler));
                done(Ok(()));
            }
            Err(e) => done(Err(anyhow!("Subscriptions unavailable: {e}"))),
        }
    }

    fn unsubscribe(&self, filter: &str, done: ActionCallback) {
        match self.subscriptions.write() {
            Ok(mut subscriptions) => {
                subscriptions.retain(|(existing, _)| existing != filter);
                done(Ok(()));
            }
            Err(e) => done(Err(anyhow!("Subscriptions unavailable: {e}"))),
        }
    }
}
