//! Request/response caller - correlates replies to calls by token
use crate::bind::ThingBind;
use crate::error::{OpError, OpResult};
use crate::op_data::OpData;
use crate::port::PubPort;
use crate::thing_op::ThingOp;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outstanding calls of one caller bind, by token
pub(crate) type PendingCalls<R> = DashMap<String, oneshot::Sender<R>>;

/// Options for a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOption {
    /// How long to wait for the matching reply
    pub timeout: Duration,
}

impl CallOption {
    pub fn timeout_ms(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl Default for CallOption {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Removes a call's pending slot however the call ends, including being dropped
struct PendingGuard<'a, R> {
    pending: &'a PendingCalls<R>,
    token: &'a str,
}

impl<R> Drop for PendingGuard<'_, R> {
    fn drop(&mut self) {
        self.pending.remove(self.token);
    }
}

/// Caller side of a request/response pair
pub struct ThingCall<T, R> {
    op: ThingOp,
    pub_port: Arc<dyn PubPort<T>>,
    pending: Arc<PendingCalls<R>>,
    bind: ThingBind,
}

impl<T: 'static, R: OpData> ThingCall<T, R> {
    pub(crate) fn new(op: ThingOp, pub_port: Arc<dyn PubPort<T>>, pending: Arc<PendingCalls<R>>,
                      bind: ThingBind) -> Self {
        Self { op, pub_port, pending, bind }
    }

    /// Send a request and wait for the reply carrying its token
    pub async fn call(&self, option: CallOption, value: T) -> OpResult<R> {
        let token = self.op.gen_token();
        self.call_with_token(option, token, value).await
    }

    /// As [`ThingCall::call`], building the request from the call's token
    pub async fn call_with<F>(&self, option: CallOption, encoder: F) -> OpResult<R>
    where
        F: FnOnce(&str) -> T,
    {
        let token = self.op.gen_token();
        let value = encoder(&token);
        self.call_with_token(option, token, value).await
    }

    async fn call_with_token(&self, option: CallOption, token: String, value: T) -> OpResult<R> {
        let path = self.op.path();
        let topic = self.pub_port.topic(&value);
        let qos = self.pub_port.qos();
        let envelope = self.pub_port.encode(&token, value)
            .map_err(|source| OpError::Encode { token: token.clone(), source })?;

        // The slot must exist before the request goes out, replies can be quick
        let (slot, reply) = oneshot::channel();
        self.pending.insert(token.clone(), slot);
        let _guard = PendingGuard { pending: &self.pending, token: &token };

        let publish = self.op.mqtt_post(&topic, qos, &envelope);
        let exchange = async {
            match publish.await {
                Ok(()) => debug!("{path}/op/call/request success; topic={topic};token={token};"),
                Err(e) => {
                    warn!("{path}/op/call/request failure; topic={topic};token={token}; {e}");
                    return Err(e);
                }
            }

            reply.await.map_err(|_| OpError::Disconnected { token: token.clone() })
        };

        let outcome = match timeout(option.timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OpError::CallTimeout {
                token: token.clone(),
                timeout: option.timeout,
            }),
        };

        match &outcome {
            Ok(_) => debug!("{path}/op/call/response success; topic={topic};token={token};"),
            Err(e) => warn!("{path}/op/call/response failure; topic={topic};token={token}; {e}"),
        }
        outcome
    }

    /// Number of calls still waiting for a reply
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Topic filter replies are received on
    pub fn express(&self) -> &str {
        self.bind.express()
    }

    /// Release the reply subscription
    ///
    /// Calls still in flight are left to their own timeouts.
    pub async fn unbind(&self) -> OpResult<()> {
        self.bind.unbind().await
    }
}
