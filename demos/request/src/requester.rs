//! Requester role - reads properties from the responder
use anyhow::Result;
use serde_json::{json, Value};
use thing_process::Thing;
use thing_sdk::{JsonPubPort, JsonSubPort, OpReply, QoS, ThingPath};
use tracing::{error, info};

use crate::responder::{reply_topic, request_topic};

/// Call the responder for a few properties, then unbind
pub async fn run(thing: &Thing, responder: &ThingPath) -> Result<()> {
    let caller = thing.op()
        .bind_caller(JsonPubPort::<Value>::new(&request_topic(responder), QoS::AtLeastOnce),
                     JsonSubPort::<OpReply>::new(&reply_topic(responder), QoS::AtLeastOnce))
        .await?;

    let option = thing.op().call_option();
    for name in ["temperature", "humidity", "firmware", "colour", ""] {
        let request = if name.is_empty() { json!({}) } else { json!({ "name": name }) };
        info!("Sending {:?}", request);

        match caller.call(option, request).await {
            Ok(reply) if reply.is_success() => info!("Got result: {:?}", reply.data),
            Ok(reply) => info!("Refused: {} {}", reply.code, reply.desc),
            Err(e) => error!("Request failed: {e}"),
        }
    }

    caller.unbind().await?;
    Ok(())
}
