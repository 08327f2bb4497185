//! Generic Transport trait for any callback-style pub-sub client
use crate::port::QoS;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Message handler - takes topic and raw payload
///
/// Called on the transport's own delivery thread(s), so it must return quickly.
pub type MessageHandler = dyn Fn(&str, &[u8]) + Send + Sync + 'static;

/// Single-shot completion of a transport action
pub type ActionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Pub-sub client the operation core is plugged into
///
/// Every action reports its outcome exactly once through `done`, possibly
/// from another thread. One handler per filter: subscribing the same filter
/// again replaces its handler.
pub trait Transport: Send + Sync {
    /// Publish a payload on a topic
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>, done: ActionCallback);

    /// Subscribe a handler to a topic filter
    fn subscribe(&self, filter: &str, qos: QoS, handler: Arc<MessageHandler>, done: ActionCallback);

    /// Drop the subscription for a topic filter
    fn unsubscribe(&self, filter: &str, done: ActionCallback);
}

/// Turn a callback-style action into a future
///
/// `start` runs immediately, so the action is issued before the returned
/// future is first polled. If the transport drops the callback without
/// calling it the future fails.
pub fn action_future<F>(start: F) -> BoxFuture<'static, Result<()>>
where
    F: FnOnce(ActionCallback),
{
    let (sender, receiver) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = sender.send(result);
    }));

    Box::pin(async move {
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("Transport dropped the action without completing it")),
        }
    })
}

/// Extension trait giving awaitable versions of the transport actions
pub trait TransportExt {
    fn publish_async(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> BoxFuture<'static, Result<()>>;

    fn subscribe_async(&self, filter: &str, qos: QoS, handler: Arc<MessageHandler>)
                       -> BoxFuture<'static, Result<()>>;

    fn unsubscribe_async(&self, filter: &str) -> BoxFuture<'static, Result<()>>;
}

impl<T: Transport + ?Sized> TransportExt for T {
    fn publish_async(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        action_future(|done| self.publish(topic, qos, payload, done))
    }

    fn subscribe_async(&self, filter: &str, qos: QoS, handler: Arc<MessageHandler>)
                       -> BoxFuture<'static, Result<()>> {
        action_future(|done| self.subscribe(filter, qos, handler, done))
    }

    fn unsubscribe_async(&self, filter: &str) -> BoxFuture<'static, Result<()>> {
        action_future(|done| self.unsubscribe(filter, done))
    }
}
