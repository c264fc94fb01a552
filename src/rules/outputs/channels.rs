//! Republication output: the script result becomes a message on another
//! channel, carrying the original domain, publisher and timestamp.

use super::{OutputContext, OutputError};
use crate::bus::MessageBusExt;
use crate::message::Message;

pub(super) async fn run(
    ctx: &OutputContext,
    message: &Message,
    result: &serde_json::Value,
    channel: &str,
    topic: &str,
) -> Result<(), OutputError> {
    let payload = serde_json::to_vec(result).map_err(|e| OutputError::BadResult {
        reason: e.to_string(),
    })?;
    let out = Message {
        domain: message.domain.clone(),
        channel: channel.to_string(),
        subtopic: topic.to_string(),
        publisher: message.publisher.clone(),
        protocol: message.protocol.clone(),
        created: message.created,
        payload,
    };
    ctx.bus.publish_message(&out).await?;
    Ok(())
}
