//! Generic outbound webhook channel: POST (or another method) a JSON body
//! to an arbitrary URL. Success is any 2xx response.

use std::time::Duration;

use serde_json::json;

use crate::core::error::{MonitorError, Result};
use crate::notifiers::{ChannelConfig, NotificationChannel, NotificationMessage};

pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, config: &ChannelConfig, message: &NotificationMessage) -> Result<()> {
        let ChannelConfig::Webhook {
            url,
            method,
            headers,
            timeout_secs,
        } = config
        else {
            return Err(MonitorError::NotifierInvalid {
                message: "webhook channel received non-webhook config".to_string(),
            });
        };

        let body = json!({
            "title": message.title,
            "body": message.body,
        });

        let method = method.parse::<reqwest::Method>().map_err(|e| MonitorError::NotifierInvalid {
            message: format!("invalid HTTP method '{method}': {e}"),
        })?;

        let mut request = self
            .client
            .request(method, url)
            .timeout(Duration::from_secs(*timeout_secs))
            .json(&body);

        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(MonitorError::HttpRequest {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }

        Ok(())
    }
}
