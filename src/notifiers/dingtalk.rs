//! DingTalk group-robot channel. When a signing secret is configured, the
//! webhook URL carries a millisecond timestamp and an HMAC-SHA256 signature
//! over `"{timestamp}\n{secret}"`, base64-encoded and URL-escaped, per
//! DingTalk's custom-robot signing scheme. Success is HTTP 200 with
//! `errcode == 0`.

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use crate::core::error::{MonitorError, Result};
use crate::notifiers::{ChannelConfig, NotificationChannel, NotificationMessage};

type HmacSha256 = Hmac<Sha256>;

pub struct DingTalkChannel {
    client: reqwest::Client,
}

impl DingTalkChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

fn signed_url(webhook_url: &str, secret: &str) -> Result<String> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let string_to_sign = format!("{timestamp}\n{secret}");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| MonitorError::ChannelSend {
        channel_id: "dingtalk".to_string(),
        message: format!("invalid HMAC key: {e}"),
    })?;
    mac.update(string_to_sign.as_bytes());
    use base64::Engine;
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    let encoded_signature = urlencoding::encode(&signature);

    Ok(format!("{webhook_url}&timestamp={timestamp}&sign={encoded_signature}"))
}

#[async_trait::async_trait]
impl NotificationChannel for DingTalkChannel {
    async fn send(&self, config: &ChannelConfig, message: &NotificationMessage) -> Result<()> {
        let ChannelConfig::DingTalk { webhook_url, secret } = config else {
            return Err(MonitorError::NotifierInvalid {
                message: "dingtalk channel received non-dingtalk config".to_string(),
            });
        };

        let url = match secret {
            Some(secret) => signed_url(webhook_url, secret)?,
            None => webhook_url.clone(),
        };

        let body = json!({
            "msgtype": "text",
            "text": {
                "content": format!("{}\n{}", message.title, message.body),
            },
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        let errcode = payload.get("errcode").and_then(|v| v.as_i64()).unwrap_or(-1);

        if !status.is_success() || errcode != 0 {
            return Err(MonitorError::ChannelSend {
                channel_id: "dingtalk".to_string(),
                message: format!("status={status} errcode={errcode}"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_url_appends_timestamp_and_sign() {
        let url = signed_url("https://oapi.dingtalk.com/robot/send?access_token=abc", "s3cr3t").unwrap();
        assert!(url.contains("&timestamp="));
        assert!(url.contains("&sign="));
    }
}
