//! Publish and subscribe ports - how one message type is addressed and coded
use crate::op_data::{OpEnvelope, OpReply, OpRequest};
use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// MQTT quality of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(anyhow!("Invalid QoS {value}")),
        }
    }
}

/// Outbound side of one message type
pub trait PubPort<V>: Send + Sync + 'static {
    /// Topic to publish `value` on
    fn topic(&self, value: &V) -> String;

    fn qos(&self) -> QoS;

    /// Wrap `value` into an envelope carrying `token`
    fn encode(&self, token: &str, value: V) -> Result<OpEnvelope>;
}

/// Inbound side of one message type
pub trait SubPort<V>: Send + Sync + 'static {
    /// Topic filter to subscribe to
    fn express(&self) -> &str;

    fn qos(&self) -> QoS;

    /// Decode a payload received on `topic`
    ///
    /// `Ok(None)` means the message is not for this port and is dropped
    /// quietly; `Err` means the payload is malformed.
    fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<V>>;
}

/// Posts any serializable value as the `data` of a request on a fixed topic
pub struct JsonPubPort<V> {
    topic: String,
    qos: QoS,
    _value: PhantomData<fn(V)>,
}

impl<V> JsonPubPort<V> {
    pub fn new(topic: &str, qos: QoS) -> Self {
        Self {
            topic: topic.to_string(),
            qos,
            _value: PhantomData,
        }
    }
}

impl<V: Serialize + 'static> PubPort<V> for JsonPubPort<V> {
    fn topic(&self, _value: &V) -> String {
        self.topic.clone()
    }

    fn qos(&self) -> QoS {
        self.qos
    }

    fn encode(&self, token: &str, value: V) -> Result<OpEnvelope> {
        let data = serde_json::to_value(value)?;
        Ok(OpRequest::new(token, Some(data)).into())
    }
}

/// Publishes ready-made replies, keeping the token of the request being answered
pub struct ReplyPubPort {
    topic: String,
    qos: QoS,
}

impl ReplyPubPort {
    pub fn new(topic: &str, qos: QoS) -> Self {
        Self {
            topic: topic.to_string(),
            qos,
        }
    }
}

impl PubPort<OpReply> for ReplyPubPort {
    fn topic(&self, _reply: &OpReply) -> String {
        self.topic.clone()
    }

    fn qos(&self) -> QoS {
        self.qos
    }

    fn encode(&self, token: &str, reply: OpReply) -> Result<OpEnvelope> {
        Ok(OpReply {
            token: token.to_string(),
            ..reply
        }
        .into())
    }
}

/// Decodes every message under a filter as JSON
pub struct JsonSubPort<V> {
    express: String,
    qos: QoS,
    _value: PhantomData<fn() -> V>,
}

impl<V> JsonSubPort<V> {
    pub fn new(express: &str, qos: QoS) -> Self {
        Self {
            express: express.to_string(),
            qos,
            _value: PhantomData,
        }
    }
}

impl<V: DeserializeOwned + 'static> SubPort<V> for JsonSubPort<V> {
    fn express(&self) -> &str {
        &self.express
    }

    fn qos(&self) -> QoS {
        self.qos
    }

    fn decode(&self, _topic: &str, payload: &[u8]) -> Result<Option<V>> {
        Ok(Some(serde_json::from_slice(payload)?))
    }
}
