//! Email output: the configured body template is rendered with the message
//! and script result, then sent through the deployment's SMTP relay.

use super::{OutputContext, OutputError, render_template};
use crate::config::SmtpConfig;
use crate::message::Message;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as EmailMessage, Tokio1Executor};

/// SMTP transport plus the configured sender identity.
#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl Mailer {
    /// Builds the relay transport from configuration.
    pub fn from_config(config: &SmtpConfig) -> Result<Self, OutputError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| OutputError::Email {
                reason: e.to_string(),
            })?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        let from = config
            .from_address
            .parse()
            .map_err(|e: lettre::address::AddressError| OutputError::Email {
                reason: format!("bad from address: {e}"),
            })?;
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    async fn send(&self, to: &[String], subject: &str, body: String) -> Result<(), OutputError> {
        let mut builder = EmailMessage::builder()
            .from(self.from.clone())
            .subject(subject);
        for addr in to {
            let mailbox: Mailbox =
                addr.parse()
                    .map_err(|e: lettre::address::AddressError| OutputError::Email {
                        reason: format!("bad recipient {addr:?}: {e}"),
                    })?;
            builder = builder.to(mailbox);
        }
        let email = builder.body(body).map_err(|e| OutputError::Email {
            reason: e.to_string(),
        })?;
        self.transport
            .send(email)
            .await
            .map_err(|e| OutputError::Email {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

pub(super) async fn run(
    ctx: &OutputContext,
    message: &Message,
    result: &serde_json::Value,
    to: &[String],
    subject: &str,
    content: &str,
) -> Result<(), OutputError> {
    let Some(mailer) = &ctx.mailer else {
        return Err(OutputError::Disabled {
            reason: "no SMTP relay configured".to_string(),
        });
    };
    if to.is_empty() {
        return Err(OutputError::Email {
            reason: "no recipients".to_string(),
        });
    }
    let body = render_template(content, message, result)?;
    mailer.send(to, subject, body).await
}
