//! Wire-neutral message model and the bus subject grammar.
//!
//! Every adapter speaks `Message` internally: the CoAP front door and the
//! LoRa bridge produce them, observers and the rules engine consume them.
//! On the wire a message travels as a JSON envelope; the payload bytes are
//! base64 inside the envelope so binary device data survives the trip.

use serde::{Deserialize, Serialize};

/// Subject prefix for channel traffic.
pub const CHANNEL_PREFIX: &str = "channel";
/// Subject prefix for alarms raised by rule outputs.
pub const ALARMS_PREFIX: &str = "alarms";
/// Subject prefix consumed by the measurement writers.
pub const WRITERS_PREFIX: &str = "writers";

/// Protocol tag for messages entering through the CoAP adapter.
pub const PROTOCOL_COAP: &str = "coap";
/// Protocol tag for messages entering through the LoRa bridge.
pub const PROTOCOL_LORA: &str = "lora";
/// Protocol tag for messages synthesized inside the platform.
pub const PROTOCOL_INTERNAL: &str = "nats";

/// The unit carried on the internal bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Tenant scope.
    #[serde(default)]
    pub domain: String,
    /// Channel identifier; never empty for published messages.
    pub channel: String,
    /// Dot-delimited subtopic, possibly empty.
    #[serde(default)]
    pub subtopic: String,
    /// Identity of the publishing client.
    #[serde(default)]
    pub publisher: String,
    /// Ingress protocol tag ("coap", "lora", ...).
    #[serde(default)]
    pub protocol: String,
    /// Creation timestamp, nanoseconds since the Unix epoch.
    #[serde(default)]
    pub created: i64,
    /// Opaque payload bytes.
    #[serde(with = "base64_payload", default)]
    pub payload: Vec<u8>,
}

impl Message {
    /// Bus subject for this message: `channel.<id>[.<subtopic tokens>]`.
    pub fn subject(&self) -> String {
        subject(CHANNEL_PREFIX, &self.channel, &self.subtopic)
    }

    /// Serializes the JSON envelope published on the bus.
    pub fn to_envelope(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a bus envelope back into a message.
    pub fn from_envelope(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Builds a dot subject under the given prefix.
pub fn subject(prefix: &str, channel: &str, subtopic: &str) -> String {
    if subtopic.is_empty() {
        format!("{prefix}.{channel}")
    } else {
        format!("{prefix}.{channel}.{subtopic}")
    }
}

/// Matches a subtopic against a bus-wildcard pattern.
///
/// `*` matches exactly one token, `>` matches any suffix including the empty
/// one, and an empty pattern matches everything. The matcher is independent
/// of the broker so rules can be filtered before any subscription exists.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = if topic.is_empty() {
        Vec::new()
    } else {
        topic.split('.').collect()
    };

    for (i, part) in pattern.iter().enumerate() {
        match *part {
            ">" => return true,
            "*" => {
                if topic.get(i).is_none() {
                    return false;
                }
            }
            literal => {
                if topic.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }
    pattern.len() == topic.len()
}

mod base64_payload {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn subject_without_subtopic() {
        let msg = Message {
            channel: "ch1".into(),
            ..Message::default()
        };
        assert_eq!(msg.subject(), "channel.ch1");
    }

    #[test]
    fn subject_with_subtopic() {
        let msg = Message {
            channel: "ch1".into(),
            subtopic: "temperature.kitchen".into(),
            ..Message::default()
        };
        assert_eq!(msg.subject(), "channel.ch1.temperature.kitchen");
    }

    #[test]
    fn envelope_round_trip_preserves_binary_payload() {
        let msg = Message {
            domain: "d1".into(),
            channel: "ch1".into(),
            subtopic: "a.b".into(),
            publisher: "p1".into(),
            protocol: PROTOCOL_COAP.into(),
            created: 1_700_000_000_000_000_000,
            payload: vec![0x00, 0xff, 0x7f, 0x80],
        };
        let bytes = msg.to_envelope().unwrap();
        let decoded = Message::from_envelope(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn wildcard_matching_laws() {
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(topic_matches("a.>", "a.b.c.d"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(topic_matches("", "anything"));
    }

    #[test]
    fn tail_wildcard_matches_empty_suffix() {
        assert!(topic_matches("a.>", "a"));
        assert!(!topic_matches("a.>", "b.c"));
    }

    #[test]
    fn literal_pattern_requires_equal_length() {
        assert!(topic_matches("a.b", "a.b"));
        assert!(!topic_matches("a.b", "a"));
        assert!(!topic_matches("a", "a.b"));
    }

    #[test]
    fn star_does_not_match_missing_token() {
        assert!(!topic_matches("a.*", "a"));
    }

    proptest! {
        #[test]
        fn identical_topics_always_match(tokens in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..6)) {
            let topic = tokens.join(".");
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn tail_wildcard_matches_any_extension(
            tokens in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..4),
            extra in prop::collection::vec("[a-z][a-z0-9]{0,6}", 0..4),
        ) {
            let pattern = format!("{}.>", tokens.join("."));
            let mut all = tokens.clone();
            all.extend(extra);
            prop_assert!(topic_matches(&pattern, &all.join(".")));
        }

        #[test]
        fn star_replaces_exactly_one_token(
            prefix in "[a-z][a-z0-9]{0,6}",
            middle in "[a-z][a-z0-9]{0,6}",
            suffix in "[a-z][a-z0-9]{0,6}",
        ) {
            let pattern = format!("{prefix}.*.{suffix}");
            let topic = format!("{prefix}.{middle}.{suffix}");
            prop_assert!(topic_matches(&pattern, &topic));
            let too_long = format!("{prefix}.{middle}.{middle}.{suffix}");
            prop_assert!(!topic_matches(&pattern, &too_long));
        }
    }
}
