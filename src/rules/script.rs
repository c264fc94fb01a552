//! Shared plumbing for the two script engines.

use crate::message::Message;
use thiserror::Error;

/// Script evaluation failures.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script body could not be loaded or compiled; the rule is marked
    /// failed for this message without interrupting others.
    #[error("script load failed: {reason}")]
    Load {
        /// Compiler or loader diagnostic.
        reason: String,
    },

    /// The script raised an error while running.
    #[error("script failed: {reason}")]
    Failed {
        /// Runtime diagnostic.
        reason: String,
    },

    /// The script exceeded its wall-clock ceiling.
    #[error("script timed out")]
    Timeout,

    /// The script returned something that does not marshal to JSON.
    #[error("bad script result: {reason}")]
    BadResult {
        /// What failed to convert.
        reason: String,
    },
}

/// What an evaluation decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    /// The script returned boolean `false`; run no outputs.
    Skip,
    /// JSON-marshalled return value, handed to each output.
    Value(serde_json::Value),
}

/// The `message` binding visible to scripts: every envelope field, with the
/// payload as parsed JSON when it parses and as a byte array otherwise.
pub fn message_value(message: &Message) -> serde_json::Value {
    let payload = match serde_json::from_slice::<serde_json::Value>(&message.payload) {
        Ok(parsed) => parsed,
        Err(_) => serde_json::Value::Array(
            message
                .payload
                .iter()
                .map(|b| serde_json::Value::from(*b))
                .collect(),
        ),
    };
    serde_json::json!({
        "domain": message.domain,
        "channel": message.channel,
        "subtopic": message.subtopic,
        "publisher": message.publisher,
        "protocol": message.protocol,
        "created": message.created,
        "payload": payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payload_is_parsed() {
        let message = Message {
            channel: "ch1".into(),
            payload: br#"{"t":45}"#.to_vec(),
            ..Message::default()
        };
        let value = message_value(&message);
        assert_eq!(value["payload"]["t"], 45);
    }

    #[test]
    fn binary_payload_becomes_byte_array() {
        let message = Message {
            channel: "ch1".into(),
            payload: vec![0xff, 0x00],
            ..Message::default()
        };
        let value = message_value(&message);
        assert_eq!(value["payload"], serde_json::json!([255, 0]));
    }
}
