//! Alarm output: the script result is one alarm or a list of them; the
//! rule and message identity fields are filled in before publication.

use super::{OutputContext, OutputError};
use crate::message::{ALARMS_PREFIX, Message, subject};
use crate::rules::{Alarm, Rule};
use tracing::debug;

pub(super) async fn run(
    ctx: &OutputContext,
    rule: &Rule,
    message: &Message,
    result: &serde_json::Value,
) -> Result<(), OutputError> {
    let alarms = decode_alarms(result)?;
    let target = subject(ALARMS_PREFIX, &message.channel, &message.subtopic);
    for mut alarm in alarms {
        alarm.rule_id = rule.id.clone();
        alarm.domain = message.domain.clone();
        alarm.client_id = message.publisher.clone();
        alarm.channel_id = message.channel.clone();
        alarm.subtopic = message.subtopic.clone();

        let payload = serde_json::to_vec(&alarm).map_err(|e| OutputError::BadResult {
            reason: e.to_string(),
        })?;
        ctx.bus.publish(&target, payload.into()).await?;
        debug!(rule = %rule.id, subject = %target, "alarm published");
    }
    Ok(())
}

fn decode_alarms(result: &serde_json::Value) -> Result<Vec<Alarm>, OutputError> {
    let decoded = match result {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()))
            .collect::<Result<Vec<Alarm>, _>>(),
        other => serde_json::from_value::<Alarm>(other.clone()).map(|alarm| vec![alarm]),
    };
    decoded.map_err(|e| OutputError::BadResult {
        reason: format!("not an alarm: {e}"),
    })
}
