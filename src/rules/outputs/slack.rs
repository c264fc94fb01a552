//! Slack output: the configured template renders the chat message body,
//! which is posted through the chat API with the output's token.

use super::{OutputContext, OutputError, render_template};
use crate::message::Message;
use serde::Deserialize;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub(super) async fn run(
    ctx: &OutputContext,
    message: &Message,
    result: &serde_json::Value,
    token: &str,
    channel_id: &str,
    template: &str,
) -> Result<(), OutputError> {
    let rendered = render_template(template, message, result)?;
    let body = build_body(&rendered, channel_id)?;

    let response = ctx
        .http
        .post(POST_MESSAGE_URL)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .map_err(|e| OutputError::Chat {
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(OutputError::Chat {
            reason: format!("HTTP {status}"),
        });
    }
    let reply: ApiReply = response.json().await.map_err(|e| OutputError::Chat {
        reason: e.to_string(),
    })?;
    if !reply.ok {
        return Err(OutputError::Chat {
            reason: reply.error.unwrap_or_else(|| "unknown API error".to_string()),
        });
    }
    Ok(())
}

/// Parses the rendered template as a JSON chat body and pins the channel.
fn build_body(rendered: &str, channel_id: &str) -> Result<serde_json::Value, OutputError> {
    let mut body: serde_json::Value =
        serde_json::from_str(rendered).map_err(|e| OutputError::Template {
            reason: format!("chat template must render JSON: {e}"),
        })?;
    let serde_json::Value::Object(map) = &mut body else {
        return Err(OutputError::BadResult {
            reason: "chat body is not an object".to_string(),
        });
    };
    map.insert(
        "channel".to_string(),
        serde_json::Value::String(channel_id.to_string()),
    );
    Ok(body)
}
