// Thing operation SDK - main library exports
pub mod bind;
pub mod call;
pub mod config;
pub mod error;
pub mod match_topic;
pub mod mock_transport;
pub mod op_data;
pub mod path;
pub mod port;
pub mod thing_op;
pub mod token;
pub mod transport;
pub mod worker_pool;

// Flattened re-exports
pub use self::bind::ThingBind;
pub use self::call::{CallOption, ThingCall};
pub use self::config::ThingConfig;
pub use self::error::{OpError, OpResult};
pub use self::op_data::{OpData, OpEnvelope, OpReply, OpRequest};
pub use self::path::ThingPath;
pub use self::port::{JsonPubPort, JsonSubPort, PubPort, QoS, ReplyPubPort, SubPort};
pub use self::thing_op::ThingOp;
pub use self::transport::{ActionCallback, MessageHandler, Transport, TransportExt};
pub use self::worker_pool::WorkerPool;
