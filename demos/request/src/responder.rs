//! Responder role - answers property reads and logs device events
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use thing_process::Thing;
use thing_sdk::{JsonSubPort, OpReply, OpRequest, QoS, ReplyPubPort, ThingBind, ThingPath};
use tracing::info;

/// Property reads for a responder
pub fn request_topic(responder: &ThingPath) -> String {
    responder.topic("/sys", "thing/property/get")
}

pub fn reply_topic(responder: &ThingPath) -> String {
    responder.topic("/sys", "thing/property/get_reply")
}

async fn handler(topic: String, request: OpRequest) -> Result<OpReply> {
    info!("Handler received {:?} on {topic}", request);

    let name = request.data
        .as_ref()
        .and_then(|data| data["name"].as_str())
        .ok_or_else(|| anyhow!("Request has no property name"))?;

    let value: Value = match name {
        "temperature" => json!(21.5),
        "humidity" => json!(40),
        // Known to the platform but never set on this device
        "firmware" => Value::Null,
        _ => return Ok(OpReply::new(&request.token, 404, "no such property", None)),
    };

    Ok(OpReply::success(&request.token, Some(json!({ name: value }))))
}

/// Bind the property service
pub async fn bind(thing: &Thing) -> Result<ThingBind> {
    let express = request_topic(thing.path());
    info!("Creating responder on '{}'", express);

    let bind = thing.op()
        .bind_services(JsonSubPort::<OpRequest>::new(&express, QoS::AtLeastOnce),
                       ReplyPubPort::new(&reply_topic(thing.path()), QoS::AtLeastOnce),
                       |topic: &str, request: OpRequest| handler(topic.to_string(), request))
        .await?;

    Ok(bind)
}
