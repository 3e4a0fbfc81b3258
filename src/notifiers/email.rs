//! SMTP notification channel.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::core::error::{MonitorError, Result};
use crate::notifiers::{ChannelConfig, NotificationChannel, NotificationMessage};

pub struct EmailChannel;

#[async_trait::async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, config: &ChannelConfig, message: &NotificationMessage) -> Result<()> {
        let ChannelConfig::Email {
            smtp_host,
            smtp_port,
            username,
            password,
            from,
            to,
            use_tls,
        } = config
        else {
            return Err(MonitorError::NotifierInvalid {
                message: "email channel received non-email config".to_string(),
            });
        };

        if to.is_empty() {
            return Err(MonitorError::NotifierInvalid {
                message: "email notifier has no recipients".to_string(),
            });
        }

        let mut builder = Message::builder()
            .from(from.parse().map_err(|e| MonitorError::NotifierInvalid {
                message: format!("invalid from address: {e}"),
            })?)
            .subject(&message.title);

        for recipient in to {
            builder = builder.to(recipient.parse().map_err(|e| MonitorError::NotifierInvalid {
                message: format!("invalid recipient address: {e}"),
            })?);
        }

        let email = builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| MonitorError::ChannelSend {
                channel_id: "email".to_string(),
                message: e.to_string(),
            })?;

        let creds = Credentials::new(username.clone(), password.clone());

        let transport = if *use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
        }
        .map_err(|e| MonitorError::ChannelSend {
            channel_id: "email".to_string(),
            message: e.to_string(),
        })?
        .port(*smtp_port)
        .credentials(creds)
        .build();

        transport
            .send(email)
            .await
            .map_err(|e| MonitorError::ChannelSend {
                channel_id: "email".to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}
