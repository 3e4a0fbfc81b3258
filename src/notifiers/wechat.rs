//! WeChat group-robot channel: POST a markdown/text message to a webhook
//! URL. Success is HTTP 200 with `errcode == 0` in the response body.

use serde_json::json;

use crate::core::error::{MonitorError, Result};
use crate::notifiers::{ChannelConfig, NotificationChannel, NotificationMessage};

pub struct WeChatChannel {
    client: reqwest::Client,
}

impl WeChatChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WeChatChannel {
    async fn send(&self, config: &ChannelConfig, message: &NotificationMessage) -> Result<()> {
        let ChannelConfig::WeChat { webhook_url } = config else {
            return Err(MonitorError::NotifierInvalid {
                message: "wechat channel received non-wechat config".to_string(),
            });
        };

        let body = json!({
            "msgtype": "text",
            "text": {
                "content": format!("{}\n{}", message.title, message.body),
            },
        });

        let response = self.client.post(webhook_url).json(&body).send().await?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        let errcode = payload.get("errcode").and_then(|v| v.as_i64()).unwrap_or(-1);

        if !status.is_success() || errcode != 0 {
            return Err(MonitorError::ChannelSend {
                channel_id: "wechat".to_string(),
                message: format!("status={status} errcode={errcode}"),
            });
        }

        Ok(())
    }
}
