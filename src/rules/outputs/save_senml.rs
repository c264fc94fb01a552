//! Save-measurements output: the script result is validated as SenML and
//! republished for the writers to persist.

use super::{OutputContext, OutputError};
use crate::message::{Message, WRITERS_PREFIX, subject};
use crate::senml::{self, Record};

pub(super) async fn run(
    ctx: &OutputContext,
    message: &Message,
    result: &serde_json::Value,
) -> Result<(), OutputError> {
    let records = decode_records(result)?;
    let normalized = senml::normalize(&records);
    senml::validate(&normalized)?;

    let payload = serde_json::to_vec(&normalized).map_err(|e| OutputError::BadResult {
        reason: e.to_string(),
    })?;
    let out = Message {
        domain: message.domain.clone(),
        channel: message.channel.clone(),
        subtopic: message.subtopic.clone(),
        publisher: message.publisher.clone(),
        protocol: message.protocol.clone(),
        created: message.created,
        payload,
    };
    let target = subject(WRITERS_PREFIX, &out.channel, &out.subtopic);
    let envelope = out.to_envelope().map_err(|e| OutputError::BadResult {
        reason: e.to_string(),
    })?;
    ctx.bus.publish(&target, envelope.into()).await?;
    Ok(())
}

fn decode_records(result: &serde_json::Value) -> Result<Vec<Record>, OutputError> {
    let decoded = match result {
        serde_json::Value::Array(_) => serde_json::from_value::<Vec<Record>>(result.clone()),
        other => serde_json::from_value::<Record>(other.clone()).map(|record| vec![record]),
    };
    decoded.map_err(|e| OutputError::BadResult {
        reason: format!("not a SenML pack: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_and_array_results_both_decode() {
        let single = serde_json::json!({"n": "temp", "v": 21.5});
        assert_eq!(decode_records(&single).unwrap().len(), 1);

        let pack = serde_json::json!([
            {"bn": "dev1/", "n": "temp", "v": 21.5},
            {"n": "hum", "v": 40.0}
        ]);
        assert_eq!(decode_records(&pack).unwrap().len(), 2);
    }

    #[test]
    fn invalid_pack_is_rejected_before_publish() {
        let records = decode_records(&serde_json::json!({"n": "temp"})).unwrap();
        let normalized = senml::normalize(&records);
        assert!(senml::validate(&normalized).is_err());
    }
}
