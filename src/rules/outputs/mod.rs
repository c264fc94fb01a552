//! Typed rule outputs.
//!
//! Each output is one operation: run with the triggering message and the
//! script result. Outputs persist themselves as tagged JSON objects; the
//! tag picks the variant back out at load time. One output failing never
//! stops the ones after it; the engine collects all errors per rule.

pub mod alarms;
pub mod channels;
pub mod email;
pub mod remote_pg;
pub mod save_senml;
pub mod slack;

pub use email::Mailer;

use super::Rule;
use crate::bus::{BusError, MessageBus};
use crate::message::Message;
use crate::senml::SenmlError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Output failures.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Republication onto the bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The script result does not fit what this output expects.
    #[error("unusable script result: {reason}")]
    BadResult {
        /// Shape mismatch description.
        reason: String,
    },

    /// A configured template failed to render.
    #[error("template failed: {reason}")]
    Template {
        /// Renderer diagnostic.
        reason: String,
    },

    /// SenML validation rejected the pack.
    #[error(transparent)]
    Senml(#[from] SenmlError),

    /// The SMTP relay rejected or never got the mail.
    #[error("email failed: {reason}")]
    Email {
        /// Transport diagnostic.
        reason: String,
    },

    /// The remote database rejected the insert; not retried.
    #[error("remote database failed: {reason}")]
    Database {
        /// Driver diagnostic.
        reason: String,
    },

    /// The chat API rejected the post; not retried.
    #[error("chat post failed: {reason}")]
    Chat {
        /// API diagnostic.
        reason: String,
    },

    /// The output needs a facility this deployment did not configure.
    #[error("output disabled: {reason}")]
    Disabled {
        /// The missing facility.
        reason: String,
    },
}

/// Collaborators shared by every output run.
#[derive(Clone)]
pub struct OutputContext {
    /// Bus for republication, alarms and measurement writes.
    pub bus: Arc<dyn MessageBus>,
    /// SMTP transport; `None` disables the email output.
    pub mailer: Option<Mailer>,
    /// HTTP client for chat webhooks.
    pub http: reqwest::Client,
}

impl OutputContext {
    /// Builds a context around a bus with the given optional mailer.
    pub fn new(bus: Arc<dyn MessageBus>, mailer: Option<Mailer>) -> Self {
        Self {
            bus,
            mailer,
            http: reqwest::Client::new(),
        }
    }
}

/// One typed output, self-describing for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    /// Republish the result as a message on another channel.
    Channels {
        /// Target channel.
        channel: String,
        /// Target subtopic.
        #[serde(default)]
        topic: String,
    },
    /// Interpret the result as alarms and publish them.
    Alarms {},
    /// Validate the result as SenML and hand it to the writers.
    SaveSenml {},
    /// Render and send an email.
    Email {
        /// Recipients.
        to: Vec<String>,
        /// Subject line.
        subject: String,
        /// Body template with `message` and `result` bindings.
        content: String,
    },
    /// Insert rendered rows into an external Postgres table.
    SaveRemotePg {
        /// Database host.
        host: String,
        /// Database port.
        port: u16,
        /// Login user.
        user: String,
        /// Login password.
        password: String,
        /// Database name.
        database: String,
        /// Target table.
        table: String,
        /// Template that must render a JSON row (or array of rows).
        mapping: String,
    },
    /// Post the rendered result to a Slack channel.
    Slack {
        /// Bot token.
        token: String,
        /// Channel to post into.
        channel_id: String,
        /// Message-body template rendering a JSON chat payload.
        message: String,
    },
}

impl Output {
    /// Runs this output with the script result of an evaluation.
    pub async fn run(
        &self,
        ctx: &OutputContext,
        rule: &Rule,
        message: &Message,
        result: &serde_json::Value,
    ) -> Result<(), OutputError> {
        match self {
            Self::Channels { channel, topic } => {
                channels::run(ctx, message, result, channel, topic).await
            }
            Self::Alarms {} => alarms::run(ctx, rule, message, result).await,
            Self::SaveSenml {} => save_senml::run(ctx, message, result).await,
            Self::Email {
                to,
                subject,
                content,
            } => email::run(ctx, message, result, to, subject, content).await,
            Self::SaveRemotePg {
                host,
                port,
                user,
                password,
                database,
                table,
                mapping,
            } => {
                remote_pg::run(
                    message, result, host, *port, user, password, database, table, mapping,
                )
                .await
            }
            Self::Slack {
                token,
                channel_id,
                message: template,
            } => slack::run(ctx, message, result, token, channel_id, template).await,
        }
    }
}

/// Renders a tera template with `message` and `result` in scope.
pub(crate) fn render_template(
    template: &str,
    message: &Message,
    result: &serde_json::Value,
) -> Result<String, OutputError> {
    let bindings = serde_json::json!({
        "message": super::script::message_value(message),
        "result": result,
    });
    let context =
        tera::Context::from_serialize(&bindings).map_err(|e| OutputError::Template {
            reason: e.to_string(),
        })?;
    tera::Tera::one_off(template, &context, false).map_err(|e| OutputError::Template {
        reason: e.to_string(),
    })
}
