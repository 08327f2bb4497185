//! Operation core - post, consume, serve and call over a pub-sub transport
use crate::bind::ThingBind;
use crate::call::{CallOption, PendingCalls, ThingCall};
use crate::error::{OpError, OpResult};
use crate::op_data::{OpData, OpEnvelope};
use crate::path::ThingPath;
use crate::port::{PubPort, QoS, SubPort};
use crate::token::TokenSequencer;
use crate::transport::{MessageHandler, Transport, TransportExt};
use crate::worker_pool::WorkerPool;
use dashmap::DashMap;
use futures::future::{ready, BoxFuture, Future};
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Consumer function type - takes topic and decoded value
pub(crate) type Consumer<V> = dyn Fn(&str, V) + Send + Sync + 'static;

struct Inner {
    path: ThingPath,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    sequencer: TokenSequencer,
    call_option: CallOption,
}

/// Operations of one thing - cheap to clone, clones share state
#[derive(Clone)]
pub struct ThingOp {
    inner: Arc<Inner>,
}

impl ThingOp {
    pub fn new(path: ThingPath, transport: Arc<dyn Transport>, pool: Arc<WorkerPool>,
               call_option: CallOption) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                transport,
                pool,
                sequencer: TokenSequencer::new(),
                call_option,
            }),
        }
    }

    pub fn path(&self) -> &ThingPath {
        &self.inner.path
    }

    /// Call option used when the caller has no preference
    pub fn call_option(&self) -> CallOption {
        self.inner.call_option
    }

    /// Fresh correlation token
    pub fn gen_token(&self) -> String {
        self.inner.sequencer.next()
    }

    /// Publish a value through a port, completing on transport acknowledgement
    pub async fn post<V, P>(&self, pub_port: &P, value: V) -> OpResult<()>
    where
        P: PubPort<V> + ?Sized,
    {
        let path = self.path();
        let topic = pub_port.topic(&value);
        let qos = pub_port.qos();
        let token = self.gen_token();
        let envelope = pub_port.encode(&token, value)
            .map_err(|source| OpError::Encode { token: token.clone(), source })?;

        match self.mqtt_post(&topic, qos, &envelope).await {
            Ok(()) => {
                debug!("{path}/op/post success; topic={topic};token={token};");
                Ok(())
            }
            Err(e) => {
                warn!("{path}/op/post failure; topic={topic};token={token}; {e}");
                Err(e)
            }
        }
    }

    /// Encode and hand an envelope to the transport
    ///
    /// The publish is issued before this returns; the future only waits for
    /// the acknowledgement.
    pub(crate) fn mqtt_post(&self, topic: &str, qos: QoS, envelope: &OpEnvelope)
                            -> BoxFuture<'static, OpResult<()>> {
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(source) => {
                let token = envelope.token().to_string();
                return Box::pin(ready(Err(OpError::Encode { token, source })));
            }
        };

        let publish = self.inner.transport.publish_async(topic, qos, payload);
        let topic = topic.to_string();
        Box::pin(async move {
            publish.await.map_err(|e| OpError::transport("publish", &topic, e))
        })
    }

    /// Subscribe a consumer to every value a port decodes
    pub async fn bind_consumer<V, S, F>(&self, sub: S, consume_fn: F) -> OpResult<ThingBind>
    where
        V: Send + 'static,
        S: SubPort<V>,
        F: Fn(&str, V) + Send + Sync + 'static,
    {
        self.mqtt_bind("consume", Arc::new(sub), Arc::new(consume_fn)).await
    }

    /// Serve requests, publishing each response with its request's token
    ///
    /// A service that fails, panics or never completes sends no reply.
    pub async fn bind_services<T, R, S, P, F, Fut>(&self, sub: S, pub_port: P, service_fn: F)
                                                 -> OpResult<ThingBind>
    where
        T: OpData,
        R: Send + 'static,
        S: SubPort<T>,
        P: PubPort<R>,
        F: Fn(&str, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let op = self.clone();
        let pub_port = Arc::new(pub_port);

        let service_consumer = move |topic: &str, request: T| {
            let path = op.path().clone();
            let token = request.token().to_string();

            // The synchronous part of the service may panic too
            let service = match catch_unwind(AssertUnwindSafe(|| service_fn(topic, request))) {
                Ok(service) => service,
                Err(_) => {
                    warn!("{path}/op/service/execute failure! token={token};request-topic={topic}; service panicked");
                    return;
                }
            };

            // Await the service on its own task so it doesn't hold a dispatch worker
            let op = op.clone();
            let pub_port = pub_port.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                let response = match AssertUnwindSafe(service).catch_unwind().await {
                    Ok(Ok(response)) => response,
                    Ok(Err(source)) => {
                        let e = OpError::ServiceHandler { token, source };
                        warn!("{path}/op/service/execute failure! request-topic={topic}; {}", e.report());
                        return;
                    }
                    Err(_) => {
                        warn!("{path}/op/service/execute failure! token={token};request-topic={topic}; service panicked");
                        return;
                    }
                };
                debug!("{path}/op/service/execute success! token={token};request-topic={topic};");

                op.reply(pub_port.as_ref(), &token, response).await;
            });
        };

        self.mqtt_bind("service", Arc::new(sub), Arc::new(service_consumer)).await
    }

    /// Publish a service response under the request's token
    async fn reply<R, P>(&self, pub_port: &P, token: &str, response: R)
    where
        P: PubPort<R> + ?Sized,
    {
        let path = self.path();
        let topic = pub_port.topic(&response);
        let qos = pub_port.qos();
        let envelope = match pub_port.encode(token, response) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{path}/op/service/response failure! token={token};response-topic={topic}; encode: {e:#}");
                return;
            }
        };

        match self.mqtt_post(&topic, qos, &envelope).await {
            Ok(()) => debug!("{path}/op/service/response success! token={token};response-topic={topic};"),
            Err(e) => warn!("{path}/op/service/response failure! token={token};response-topic={topic}; {e}"),
        }
    }

    /// Bind a request port and a reply port into a request/response caller
    pub async fn bind_caller<T, R, P, S>(&self, pub_port: P, sub: S) -> OpResult<ThingCall<T, R>>
    where
        T: 'static,
        R: OpData,
        P: PubPort<T>,
        S: SubPort<R>,
    {
        let pending: Arc<PendingCalls<R>> = Arc::new(DashMap::new());

        let path = self.path().clone();
        let replies = pending.clone();
        let reply_consumer = move |topic: &str, reply: R| {
            let token = reply.token().to_string();
            match replies.remove(&token) {
                None => {
                    let e = OpError::UnmatchedReply { token };
                    warn!("{path}/op/call/response received; but none token match, maybe timeout! topic={topic}; {e}");
                }
                Some((_, slot)) => {
                    if slot.send(reply).is_err() {
                        warn!("{path}/op/call/response received; but assign failure, maybe expired. topic={topic};token={token};");
                    } else {
                        debug!("{path}/op/call/response received; topic={topic};token={token};");
                    }
                }
            }
        };

        let bind = self.mqtt_bind("call", Arc::new(sub), Arc::new(reply_consumer)).await?;
        Ok(ThingCall::new(self.clone(), Arc::new(pub_port), pending, bind))
    }

    /// Subscribe with a dispatcher that decodes and consumes via the worker pool
    ///
    /// Each worker hands its message to the blocking thread pool and waits for
    /// it, so one worker handles one message at a time.
    async fn mqtt_bind<V: Send + 'static>(&self, action: &'static str, sub: Arc<dyn SubPort<V>>,
                                          consume_fn: Arc<Consumer<V>>) -> OpResult<ThingBind> {
        let path = self.path().clone();
        let express = sub.express().to_string();
        let active = Arc::new(AtomicBool::new(true));

        let handler: Arc<MessageHandler> = {
            let path = path.clone();
            let pool = self.inner.pool.clone();
            let active = active.clone();
            let sub = sub.clone();

            Arc::new(move |topic: &str, payload: &[u8]| {
                let path = path.clone();
                let active = active.clone();
                let sub = sub.clone();
                let consume_fn = consume_fn.clone();
                let topic = topic.to_string();
                let payload = payload.to_vec();

                pool.execute(Box::pin(async move {
                    // Consumers are plain functions that may block, keep them off the runtime threads
                    let log_path = path.clone();
                    let dispatched = tokio::task::spawn_blocking(move || {
                        dispatch(&path, action, &active, sub.as_ref(), consume_fn.as_ref(), &topic, &payload);
                    })
                    .await;

                    if let Err(e) = dispatched {
                        error!("{log_path}/op/{action} dispatch failure! {e}");
                    }
                }));
            })
        };

        match self.inner.transport.subscribe_async(&express, sub.qos(), handler).await {
            Ok(()) => {
                debug!("{path}/op/{action}/bind success; express={express};");
                Ok(ThingBind::new(path, action, &express, self.inner.transport.clone(), active))
            }
            Err(e) => {
                active.store(false, Ordering::Release);
                warn!("{path}/op/{action}/bind failure; express={express}; {e:#}");
                Err(OpError::transport("subscribe", &express, e))
            }
        }
    }
}

/// Decode one inbound message and hand it to its consumer
///
/// Nothing escapes from here: decode failures, discards and consumer panics
/// all end in a log line.
fn dispatch<V: 'static>(path: &ThingPath, action: &str, active: &AtomicBool, sub: &dyn SubPort<V>,
               consume_fn: &Consumer<V>, topic: &str, payload: &[u8]) {
    if !active.load(Ordering::Acquire) {
        debug!("{path}/op/{action} unbound, dropped! topic={topic};");
        return;
    }

    let data = match sub.decode(topic, payload) {
        Ok(Some(data)) => data,
        Ok(None) => {
            debug!("{path}/op/{action} decode none, discarded! topic={topic};");
            return;
        }
        Err(source) => {
            let e = OpError::Decode { topic: topic.to_string(), source };
            warn!("{path}/op/{action} decode failure! {}", e.report());
            return;
        }
    };

    if catch_unwind(AssertUnwindSafe(|| consume_fn(topic, data))).is_err() {
        warn!("{path}/op/{action} failure! topic={topic}; consumer panicked");
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallOption;
    use crate::mock_transport::{MockTransport, PublishRecord};
    use crate::op_data::{OpReply, OpRequest};
    use crate::port::{JsonPubPort, JsonSubPort, ReplyPubPort};
    use anyhow::{anyhow, Result};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::{sleep, timeout, Instant};
    use tracing::Level;

    // Operation core over a mock transport
    struct TestSetup {
        mock: Arc<MockTransport>,
        op: ThingOp,
    }

    impl TestSetup {
        fn new() -> Self {
            let _ = tracing_subscriber::fmt()
                .with_max_level(Level::DEBUG)
                .with_test_writer()
                .try_init();

            let mock = Arc::new(MockTransport::new());
            let op = ThingOp::new(ThingPath::new("prod", "dev-1"), mock.clone(),
                                  Arc::new(WorkerPool::new(2)), CallOption::default());
            Self { mock, op }
        }

        // Wait for the nth (from 0) publish on a topic
        async fn published(&self, topic: &str, n: usize) -> PublishRecord {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                if let Some(record) = self.mock.publishes_on(topic).get(n) {
                    return record.clone();
                }
                assert!(Instant::now() < deadline, "no publish #{n} on {topic}");
                sleep(Duration::from_millis(5)).await;
            }
        }

        async fn caller(&self) -> ThingCall<Value, OpReply> {
            self.op
                .bind_caller(JsonPubPort::<Value>::new("svc/request", QoS::AtLeastOnce),
                             JsonSubPort::<OpReply>::new("svc/reply", QoS::AtLeastOnce))
                .await
                .unwrap()
        }

        fn reply(&self, token: &str, data: Value) {
            let reply = OpReply::success(token, Some(data));
            self.mock.deliver("svc/reply", &serde_json::to_vec(&reply).unwrap());
        }
    }

    async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap()
    }

    // Drops anything arriving on an `ignore` topic
    struct DiscardingPort;

    impl SubPort<Value> for DiscardingPort {
        fn express(&self) -> &str {
            "device/+"
        }

        fn qos(&self) -> QoS {
            QoS::AtMostOnce
        }

        fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<Value>> {
            if topic.ends_with("/ignore") {
                return Ok(None);
            }
            Ok(Some(serde_json::from_slice(payload)?))
        }
    }

    #[tokio::test]
    async fn post_publishes_envelope_with_token() {
        let setup = TestSetup::new();
        let port = JsonPubPort::<Value>::new("device/event", QoS::AtLeastOnce);

        assert!(setup.op.post(&port, json!({"temp": 21})).await.is_ok());

        let publishes = setup.mock.publishes_on("device/event");
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].qos, QoS::AtLeastOnce);
        let envelope = publishes[0].json();
        assert_eq!(envelope["data"], json!({"temp": 21}));
        assert!(!envelope["token"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn posts_get_distinct_tokens() {
        let setup = TestSetup::new();
        let port = JsonPubPort::<Value>::new("device/event", QoS::AtMostOnce);
        setup.op.post(&port, json!(1)).await.unwrap();
        setup.op.post(&port, json!(2)).await.unwrap();

        let publishes = setup.mock.publishes();
        assert_ne!(publishes[0].json()["token"], publishes[1].json()["token"]);
    }

    #[tokio::test]
    async fn post_failure_is_returned() {
        let setup = TestSetup::new();
        setup.mock.fail_publish(true);
        let port = JsonPubPort::<Value>::new("device/event", QoS::AtLeastOnce);

        let err = setup.op.post(&port, json!({})).await.unwrap_err();
        assert!(matches!(err, OpError::Transport { action: "publish", .. }));
    }

    #[tokio::test]
    async fn consumer_receives_decoded_values() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel();
        let bind = setup.op
            .bind_consumer(JsonSubPort::<Value>::new("device/+", QoS::AtMostOnce),
                           move |topic: &str, value: Value| {
                               let _ = tx.send((topic.to_string(), value));
                           })
            .await
            .unwrap();

        assert_eq!(bind.express(), "device/+");
        assert_eq!(setup.mock.subscriptions(), vec![("device/+".to_string(), QoS::AtMostOnce)]);

        setup.mock.deliver("device/event", br#"{"temp":21}"#);
        assert_eq!(next(&mut rx).await, ("device/event".to_string(), json!({"temp": 21})));
    }

    #[tokio::test]
    async fn decode_failure_keeps_the_bind() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel();
        let _bind = setup.op
            .bind_consumer(JsonSubPort::<Value>::new("device/+", QoS::AtMostOnce),
                           move |_topic: &str, value: Value| {
                               let _ = tx.send(value);
                           })
            .await
            .unwrap();

        setup.mock.deliver("device/event", b"{not json");
        setup.mock.deliver("device/event", b"42");

        assert_eq!(next(&mut rx).await, json!(42));
        assert_eq!(setup.mock.subscriptions().len(), 1);
        assert!(setup.mock.unsubscribes().is_empty());
    }

    #[tokio::test]
    async fn discarded_messages_never_reach_the_consumer() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel();
        let _bind = setup.op
            .bind_consumer(DiscardingPort, move |topic: &str, _value: Value| {
                let _ = tx.send(topic.to_string());
            })
            .await
            .unwrap();

        setup.mock.deliver("device/ignore", b"1");
        setup.mock.deliver("device/event", b"2");

        assert_eq!(next(&mut rx).await, "device/event");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panicking_consumer_keeps_receiving() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel();
        let _bind = setup.op
            .bind_consumer(JsonSubPort::<i64>::new("device/+", QoS::AtMostOnce),
                           move |_topic: &str, value: i64| {
                               if value == 1 {
                                   panic!("consumer failed");
                               }
                               let _ = tx.send(value);
                           })
            .await
            .unwrap();

        setup.mock.deliver("device/event", b"1");
        setup.mock.deliver("device/event", b"2");

        assert_eq!(next(&mut rx).await, 2);
    }

    #[tokio::test]
    async fn unbind_stops_dispatch_and_is_idempotent() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel::<Value>();
        let bind = setup.op
            .bind_consumer(JsonSubPort::<Value>::new("device/+", QoS::AtMostOnce),
                           move |_topic: &str, value: Value| {
                               let _ = tx.send(value);
                           })
            .await
            .unwrap();

        assert!(bind.unbind().await.is_ok());
        assert!(!bind.is_active());
        assert!(bind.unbind().await.is_ok());
        assert_eq!(setup.mock.unsubscribes(), vec!["device/+".to_string()]);

        assert_eq!(setup.mock.deliver("device/event", b"1"), 0);
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_returned() {
        let setup = TestSetup::new();
        setup.mock.fail_subscribe(true);

        let result = setup.op
            .bind_consumer(JsonSubPort::<Value>::new("device/+", QoS::AtMostOnce),
                           |_topic: &str, _value: Value| {})
            .await;

        assert!(matches!(result, Err(OpError::Transport { action: "subscribe", .. })));
    }

    #[tokio::test]
    async fn unbind_failure_is_returned_once() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel::<Value>();
        let bind = setup.op
            .bind_consumer(JsonSubPort::<Value>::new("device/+", QoS::AtMostOnce),
                           move |_topic: &str, value: Value| {
                               let _ = tx.send(value);
                           })
            .await
            .unwrap();
        setup.mock.fail_unsubscribe(true);

        let err = bind.unbind().await.unwrap_err();
        assert!(matches!(err, OpError::Transport { action: "unsubscribe", .. }));
        assert!(!bind.is_active());
        assert!(bind.unbind().await.is_ok());

        // Still subscribed on the transport, but nothing is dispatched
        assert_eq!(setup.mock.deliver("device/event", b"1"), 1);
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_consumers_do_not_delay_call_timeout() {
        let setup = TestSetup::new();
        let _bind = setup.op
            .bind_consumer(JsonSubPort::<Value>::new("device/+", QoS::AtMostOnce),
                           |_topic: &str, _value: Value| {
                               std::thread::sleep(Duration::from_millis(1500));
                           })
            .await
            .unwrap();
        let caller = setup.caller().await;

        // More slow messages than workers or runtime threads
        for _ in 0..4 {
            setup.mock.deliver("device/event", b"1");
        }

        let start = Instant::now();
        let err = caller.call(CallOption::timeout_ms(200), json!({})).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn service_reply_echoes_request_token() {
        let setup = TestSetup::new();
        let _bind = setup.op
            .bind_services(JsonSubPort::<OpRequest>::new("svc/request", QoS::AtLeastOnce),
                           ReplyPubPort::new("svc/reply", QoS::AtLeastOnce),
                           |_topic: &str, request: OpRequest| async move {
                               Ok::<_, anyhow::Error>(OpReply::success("", request.data))
                           })
            .await
            .unwrap();

        setup.mock.deliver("svc/request", br#"{"token":"t9","data":{"x":1}}"#);

        let reply = setup.published("svc/reply", 0).await.json();
        assert_eq!(reply["token"], "t9");
        assert_eq!(reply["code"], 200);
        assert_eq!(reply["data"], json!({"x": 1}));
    }

    #[tokio::test]
    async fn service_reply_without_data_sends_empty_object() {
        let setup = TestSetup::new();
        let _bind = setup.op
            .bind_services(JsonSubPort::<OpRequest>::new("svc/request", QoS::AtLeastOnce),
                           ReplyPubPort::new("svc/reply", QoS::AtLeastOnce),
                           |_topic: &str, _request: OpRequest| async move {
                               Ok::<_, anyhow::Error>(OpReply::success("", None))
                           })
            .await
            .unwrap();

        setup.mock.deliver("svc/request", br#"{"token":"t1"}"#);

        let reply = setup.published("svc/reply", 0).await.json();
        assert_eq!(reply["data"], json!({}));
    }

    #[tokio::test]
    async fn failing_service_sends_no_reply() {
        let setup = TestSetup::new();
        let (tx, mut rx) = unbounded_channel();
        let _bind = setup.op
            .bind_services(JsonSubPort::<OpRequest>::new("svc/request", QoS::AtLeastOnce),
                           ReplyPubPort::new("svc/reply", QoS::AtLeastOnce),
                           move |_topic: &str, request: OpRequest| {
                               let tx = tx.clone();
                               async move {
                                   let _ = tx.send(request.token.clone());
                                   if request.token == "bad" {
                                       return Err(anyhow!("service refused"));
                                   }
                                   Ok(OpReply::success("", None))
                               }
                           })
            .await
            .unwrap();

        setup.mock.deliver("svc/request", br#"{"token":"bad"}"#);
        assert_eq!(next(&mut rx).await, "bad");
        setup.mock.deliver("svc/request", br#"{"token":"good"}"#);
        assert_eq!(next(&mut rx).await, "good");

        // Only the good request is answered
        let reply = setup.published("svc/reply", 0).await.json();
        assert_eq!(reply["token"], "good");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(setup.mock.publishes_on("svc/reply").len(), 1);
    }

    #[tokio::test]
    async fn unbound_service_answers_no_more_requests() {
        let setup = TestSetup::new();
        let service = setup.op
            .bind_services(JsonSubPort::<OpRequest>::new("svc/request", QoS::AtLeastOnce),
                           ReplyPubPort::new("svc/reply", QoS::AtLeastOnce),
                           |_topic: &str, request: OpRequest| async move {
                               Ok::<_, anyhow::Error>(OpReply::success("", request.data))
                           })
            .await
            .unwrap();

        setup.mock.deliver("svc/request", br#"{"token":"t1"}"#);
        assert_eq!(setup.published("svc/reply", 0).await.json()["token"], "t1");

        assert!(service.unbind().await.is_ok());
        assert_eq!(setup.mock.unsubscribes(), vec!["svc/request".to_string()]);
        assert_eq!(setup.mock.deliver("svc/request", br#"{"token":"t2"}"#), 0);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(setup.mock.publishes_on("svc/reply").len(), 1);
    }

    #[tokio::test]
    async fn call_resolves_with_matching_reply() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let call = caller.call(CallOption::timeout_ms(2000), json!({"ask": "temp"}));
        let respond = async {
            let request = setup.published("svc/request", 0).await.json();
            assert_eq!(request["data"], json!({"ask": "temp"}));
            setup.reply(request["token"].as_str().unwrap(), json!({"temp": 21}));
        };

        let (result, ()) = tokio::join!(call, respond);
        let reply = result.unwrap();
        assert_eq!(reply.data, Some(json!({"temp": 21})));
        assert_eq!(caller.pending(), 0);
    }

    #[tokio::test]
    async fn call_against_service_on_same_transport() {
        let setup = TestSetup::new();
        let _service = setup.op
            .bind_services(JsonSubPort::<OpRequest>::new("svc/request", QoS::AtLeastOnce),
                           ReplyPubPort::new("svc/reply", QoS::AtLeastOnce),
                           |_topic: &str, request: OpRequest| async move {
                               Ok::<_, anyhow::Error>(OpReply::success("", request.data))
                           })
            .await
            .unwrap();
        let caller = setup.caller().await;

        let reply = caller.call(CallOption::timeout_ms(2000), json!("ping")).await.unwrap();
        assert_eq!(reply.data, Some(json!("ping")));
    }

    #[tokio::test]
    async fn call_with_builds_request_from_the_call_token() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let call = caller.call_with(CallOption::timeout_ms(2000), |token| json!({"echo": token}));
        let respond = async {
            let request = setup.published("svc/request", 0).await.json();
            assert_eq!(request["data"]["echo"], request["token"]);
            setup.reply(request["token"].as_str().unwrap(), json!(null));
        };

        let (result, ()) = tokio::join!(call, respond);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn call_without_reply_times_out() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let start = Instant::now();
        let err = caller.call(CallOption::timeout_ms(300), json!({})).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(caller.pending(), 0);
    }

    #[tokio::test]
    async fn late_reply_is_dropped() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let err = caller.call(CallOption::timeout_ms(50), json!({})).await.unwrap_err();
        assert!(err.is_timeout());

        let request = setup.published("svc/request", 0).await.json();
        setup.reply(request["token"].as_str().unwrap(), json!("late"));
        sleep(Duration::from_millis(50)).await;

        assert_eq!(caller.pending(), 0);
        assert_eq!(setup.mock.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_fails_call_at_once() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;
        setup.mock.fail_publish(true);

        let start = Instant::now();
        let err = caller.call(CallOption::timeout_ms(5000), json!({})).await.unwrap_err();

        assert!(matches!(err, OpError::Transport { action: "publish", .. }));
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(caller.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let first = caller.call(CallOption::timeout_ms(300), json!(1));
        let second = caller.call(CallOption::timeout_ms(2000), json!(2));
        let respond = async {
            // Answer only the second request
            let mut answered = false;
            while !answered {
                for record in setup.mock.publishes_on("svc/request") {
                    let request = record.json();
                    if request["data"] == json!(2) {
                        setup.reply(request["token"].as_str().unwrap(), json!("two"));
                        answered = true;
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        };

        let (first, second, ()) = tokio::join!(first, second, respond);
        assert!(first.unwrap_err().is_timeout());
        assert_eq!(second.unwrap().data, Some(json!("two")));
        assert_eq!(caller.pending(), 0);
    }

    #[tokio::test]
    async fn garbage_on_reply_filter_does_not_disturb_pending_call() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let call = caller.call(CallOption::timeout_ms(2000), json!({}));
        let respond = async {
            let request = setup.published("svc/request", 0).await.json();
            setup.mock.deliver("svc/reply", b"garbage");
            setup.reply("unknown-token", json!("stray"));
            setup.reply(request["token"].as_str().unwrap(), json!("right"));
        };

        let (result, ()) = tokio::join!(call, respond);
        assert_eq!(result.unwrap().data, Some(json!("right")));
    }

    #[tokio::test]
    async fn dropped_call_leaves_no_pending_slot() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let abandoned = timeout(Duration::from_millis(50),
                                caller.call(CallOption::timeout_ms(5000), json!({})))
            .await;

        assert!(abandoned.is_err());
        assert_eq!(caller.pending(), 0);
    }

    #[tokio::test]
    async fn caller_unbind_leaves_calls_to_time_out() {
        let setup = TestSetup::new();
        let caller = setup.caller().await;

        let call = caller.call(CallOption::timeout_ms(200), json!({}));
        let unbind = async {
            let request = setup.published("svc/request", 0).await.json();
            assert!(caller.unbind().await.is_ok());
            assert!(caller.unbind().await.is_ok());

            // Reply can no longer be delivered
            assert_eq!(setup.mock.deliver("svc/reply", &serde_json::to_vec(
                &OpReply::success(request["token"].as_str().unwrap(), None)).unwrap()), 0);
        };

        let (result, ()) = tokio::join!(call, unbind);
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(setup.mock.unsubscribes(), vec!["svc/reply".to_string()]);
    }
}
