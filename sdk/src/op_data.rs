//! Operation envelopes - the correlation wrapper around every payload
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Anything carrying a correlation token
///
/// Implemented by the decoded requests a service receives and by the decoded
/// replies a caller waits for.
pub trait OpData: Send + Sync + 'static {
    fn token(&self) -> &str;
}

/// Outbound request, or any plain post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRequest {
    pub token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply to a request, echoing the request's token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpReply {
    pub token: String,
    pub code: i32,
    pub desc: String,

    #[serde(default)]
    pub data: Option<Value>,
}

pub const REPLY_OK: i32 = 200;

impl OpRequest {
    pub fn new(token: &str, data: Option<Value>) -> Self {
        Self { token: token.to_string(), data }
    }
}

impl OpReply {
    pub fn new(token: &str, code: i32, desc: &str, data: Option<Value>) -> Self {
        Self {
            token: token.to_string(),
            code,
            desc: desc.to_string(),
            data,
        }
    }

    /// Successful reply carrying `data`
    pub fn success(token: &str, data: Option<Value>) -> Self {
        Self::new(token, REPLY_OK, "success", data)
    }

    pub fn is_success(&self) -> bool {
        self.code == REPLY_OK
    }
}

impl OpData for OpRequest {
    fn token(&self) -> &str {
        &self.token
    }
}

impl OpData for OpReply {
    fn token(&self) -> &str {
        &self.token
    }
}

/// What a publish port hands over for the wire
#[derive(Debug, Clone, PartialEq)]
pub enum OpEnvelope {
    Request(OpRequest),
    Reply(OpReply),
}

impl OpEnvelope {
    pub fn token(&self) -> &str {
        match self {
            OpEnvelope::Request(request) => &request.token,
            OpEnvelope::Reply(reply) => &reply.token,
        }
    }

    /// Encode as UTF-8 JSON
    ///
    /// The platform rejects replies whose `data` is null or missing, so an
    /// absent reply payload always goes out as `{}`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            OpEnvelope::Request(request) => serde_json::to_vec(request)?,
            OpEnvelope::Reply(reply) => {
                let data = match &reply.data {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(data) => data.clone(),
                };
                serde_json::to_vec(&OpReply {
                    data: Some(data),
                    ..reply.clone()
                })?
            }
        };
        Ok(bytes)
    }
}

impl From<OpRequest> for OpEnvelope {
    fn from(request: OpRequest) -> Self {
        OpEnvelope::Request(request)
    }
}

impl From<OpReply> for OpEnvelope {
    fn from(reply: OpReply) -> Self {
        OpEnvelope::Reply(reply)
    }
}
