//! Errors raised by thing operations
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed operation
///
/// Transport failures are returned to whoever issued the operation.
/// Decode, service and unmatched-reply failures never reach a caller: they are
/// logged at the dispatch boundary and the message is dropped.
#[derive(Debug, Error)]
pub enum OpError {
    /// Publish, subscribe or unsubscribe rejected by the transport
    #[error("transport {action} failed on {target}")]
    Transport {
        action: &'static str,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// A publish port could not produce or serialize its envelope
    #[error("encode failed for token {token}")]
    Encode {
        token: String,
        #[source]
        source: anyhow::Error,
    },

    /// An inbound payload could not be decoded by its subscribe port
    #[error("decode failed on topic {topic}")]
    Decode {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    /// A service function failed, so no reply was sent
    #[error("service failed for token {token}")]
    ServiceHandler {
        token: String,
        #[source]
        source: anyhow::Error,
    },

    /// No reply matched the call's token before its deadline
    #[error("call {token} timed out after {timeout:?}")]
    CallTimeout { token: String, timeout: Duration },

    /// A reply arrived for a token nobody is waiting on
    #[error("no pending call for token {token}")]
    UnmatchedReply { token: String },

    /// The pending slot went away without a reply
    #[error("call {token} lost its pending slot")]
    Disconnected { token: String },

    /// Bad or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl OpError {
    pub(crate) fn transport(action: &'static str, target: &str, source: anyhow::Error) -> Self {
        OpError::Transport {
            action,
            target: target.to_string(),
            source,
        }
    }

    /// Message followed by its chain of causes, for log lines
    pub fn report(&self) -> String {
        let mut report = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(e) = cause {
            report.push_str(": ");
            report.push_str(&e.to_string());
            cause = e.source();
        }
        report
    }

    /// Is this the timeout outcome of a call?
    pub fn is_timeout(&self) -> bool {
        matches!(self, OpError::CallTimeout { .. })
    }
}

pub type OpResult<T> = Result<T, OpError>;
