//! Notification channels and dispatch.
//!
//! Each channel type (email, webhook, WeChat robot, DingTalk robot)
//! implements the `NotificationChannel` capability; `Dispatcher` fans a
//! single notification out to every enabled channel concurrently and never
//! lets one channel's failure hide another's result.

mod dingtalk;
mod email;
mod wechat;
mod webhook;

pub use dingtalk::DingTalkChannel;
pub use email::EmailChannel;
pub use wechat::WeChatChannel;
pub use webhook::WebhookChannel;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::alerts::{Alert, AlertObserver, AlertState};
use crate::core::error::{MonitorError, Result};
use crate::coordination::{CoordinationStore, WatchEvent};

/// Per-type configuration payload. Tagged on `type` so the admin API can
/// accept/return a single JSON shape per notifier kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Email {
        smtp_host: String,
        smtp_port: u16,
        username: String,
        password: String,
        from: String,
        to: Vec<String>,
        use_tls: bool,
    },
    Webhook {
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
        timeout_secs: u64,
    },
    WeChat {
        webhook_url: String,
    },
    DingTalk {
        webhook_url: String,
        secret: Option<String>,
    },
}

/// A saved notifier: identity/metadata plus its channel-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub config: ChannelConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one send attempt against one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResult {
    pub notifier_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
}

/// A rendered message ready to hand to a channel.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
}

/// Capability implemented by every channel adapter.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, config: &ChannelConfig, message: &NotificationMessage) -> Result<()>;
}

/// Resolve the stateless adapter for a given config's tag.
fn channel_for(config: &ChannelConfig) -> Arc<dyn NotificationChannel> {
    match config {
        ChannelConfig::Email { .. } => Arc::new(EmailChannel),
        ChannelConfig::Webhook { .. } => Arc::new(WebhookChannel::new()),
        ChannelConfig::WeChat { .. } => Arc::new(WeChatChannel::new()),
        ChannelConfig::DingTalk { .. } => Arc::new(DingTalkChannel::new()),
    }
}

/// Renders alerts into messages and fans them out to every enabled notifier.
///
/// Notifier configs live in the coordination store so any admin-API node can
/// edit them; every node watches the notifier prefix and reconciles an
/// in-memory cache, mirroring `AlertManager`'s rule cache. A config with
/// `enabled: false` stays in the cache but `send_notification` skips it, so
/// no live channel is ever resolved for it.
pub struct Dispatcher {
    coordination: Arc<dyn CoordinationStore>,
    notifier_prefix: String,
    notifiers: RwLock<BTreeMap<String, NotifierConfig>>,
    templates: handlebars::Handlebars<'static>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub async fn new(
        coordination: Arc<dyn CoordinationStore>,
        notifier_prefix: impl Into<String>,
        send_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut templates = handlebars::Handlebars::new();
        templates.register_helper("format_time", Box::new(format_time_helper));
        templates
            .register_template_string(
                "alert_title",
                "{{#if resolved}}[RESOLVED] {{/if}}{{severity}}: {{rule_name}}",
            )
            .expect("built-in template must compile");
        templates
            .register_template_string(
                "alert_body",
                "Metric: {{metric}}\nValue: {{value}}\nThreshold: {{condition}} {{threshold}}\nStarted: {{format_time starts_at}}\n{{#each labels}}{{@key}}={{this}} {{/each}}",
            )
            .expect("built-in template must compile");

        let dispatcher = Arc::new(Self {
            coordination,
            notifier_prefix: notifier_prefix.into(),
            notifiers: RwLock::new(BTreeMap::new()),
            templates,
            send_timeout,
        });
        dispatcher.reload_notifiers().await?;
        Ok(dispatcher)
    }

    async fn reload_notifiers(&self) -> Result<()> {
        let entries = self.coordination.get_prefix(&self.notifier_prefix).await?;
        let mut notifiers = self.notifiers.write().await;
        notifiers.clear();
        for (key, value) in entries {
            match serde_json::from_slice::<NotifierConfig>(&value) {
                Ok(notifier) => {
                    notifiers.insert(notifier.id.clone(), notifier);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "failed to decode notifier config, skipping");
                }
            }
        }
        Ok(())
    }

    /// Spawn the watch-reconciliation task: reloads the whole notifier cache
    /// on every coordination-store event under the notifier prefix.
    pub fn spawn_watch_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match dispatcher.coordination.watch_prefix(&dispatcher.notifier_prefix).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start notifier watch");
                    return;
                }
            };
            while let Some(event) = rx.recv().await {
                match event {
                    WatchEvent::Put { .. } | WatchEvent::Delete { .. } => {
                        if let Err(e) = dispatcher.reload_notifiers().await {
                            tracing::warn!(error = %e, "notifier reload after watch event failed");
                        }
                    }
                }
            }
        })
    }

    /// Persist `notifier` to the coordination store, then swap the cache
    /// pointer. On an existing id, the previous entry is simply replaced —
    /// no live channel instance needs tearing down since channels are
    /// resolved fresh per send from the config.
    pub async fn put_notifier(&self, notifier: NotifierConfig) -> Result<()> {
        let key = format!("{}/{}", self.notifier_prefix, notifier.id);
        let value = serde_json::to_vec(&notifier)
            .map_err(|e| MonitorError::NotifierInvalid { message: e.to_string() })?;
        self.coordination.put(&key, value).await?;
        self.notifiers.write().await.insert(notifier.id.clone(), notifier);
        Ok(())
    }

    pub async fn delete_notifier(&self, id: &str) -> Result<()> {
        let key = format!("{}/{}", self.notifier_prefix, id);
        self.coordination.delete(&key).await?;
        self.notifiers.write().await.remove(id);
        Ok(())
    }

    pub async fn get_notifier(&self, id: &str) -> Result<NotifierConfig> {
        self.notifiers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MonitorError::notifier_not_found(id))
    }

    pub async fn list_notifiers(&self) -> Vec<NotifierConfig> {
        self.notifiers.read().await.values().cloned().collect()
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut notifier = self.get_notifier(id).await?;
        notifier.enabled = enabled;
        notifier.updated_at = Utc::now();
        self.put_notifier(notifier).await
    }

    /// Render an alert into a notification message.
    pub fn render_alert(&self, alert: &Alert) -> Result<NotificationMessage> {
        let mut context = serde_json::Map::new();
        context.insert("rule_name".to_string(), alert.rule_name.clone().into());
        context.insert("severity".to_string(), alert.severity.as_str().into());
        context.insert("level".to_string(), alert.severity.notification_level().into());
        context.insert("metric".to_string(), alert.metric.clone().into());
        context.insert("value".to_string(), alert.value.into());
        context.insert("threshold".to_string(), alert.threshold.into());
        context.insert("condition".to_string(), format!("{:?}", alert.condition).into());
        context.insert("starts_at".to_string(), alert.starts_at.to_rfc3339().into());
        context.insert("resolved".to_string(), (alert.state == AlertState::Resolved).into());

        let mut labels = alert.labels.clone();
        labels.insert("rule_id".to_string(), alert.rule_id.clone());
        labels.insert("target_type".to_string(), alert.target_type.to_string());
        labels.insert("metric".to_string(), alert.metric.clone());
        context.insert(
            "labels".to_string(),
            serde_json::to_value(labels).map_err(|e| MonitorError::TemplateRender { message: e.to_string() })?,
        );

        let title = self
            .templates
            .render("alert_title", &context)
            .map_err(|e| MonitorError::TemplateRender { message: e.to_string() })?;
        let body = self
            .templates
            .render("alert_body", &context)
            .map_err(|e| MonitorError::TemplateRender { message: e.to_string() })?;

        Ok(NotificationMessage { title, body })
    }

    /// Send a message to every enabled notifier concurrently. Never
    /// propagates a channel failure; every attempt's outcome is returned.
    pub async fn send_notification(&self, message: &NotificationMessage) -> Vec<NotificationResult> {
        let notifiers: Vec<NotifierConfig> = self
            .notifiers
            .read()
            .await
            .values()
            .filter(|n| n.enabled)
            .cloned()
            .collect();

        let sends = notifiers.into_iter().map(|notifier| {
            let message = message.clone();
            let timeout = self.send_timeout;
            async move { send_one(notifier, message, timeout).await }
        });

        futures::future::join_all(sends).await
    }
}

impl Clone for NotificationMessage {
    fn clone(&self) -> Self {
        Self {
            title: self.title.clone(),
            body: self.body.clone(),
        }
    }
}

async fn send_one(notifier: NotifierConfig, message: NotificationMessage, timeout: Duration) -> NotificationResult {
    let started = std::time::Instant::now();
    let channel = channel_for(&notifier.config);

    let outcome = tokio::time::timeout(timeout, channel.send(&notifier.config, &message)).await;

    let (success, error) = match outcome {
        Ok(Ok(())) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some(format!("send timed out after {}s", timeout.as_secs()))),
    };

    NotificationResult {
        notifier_id: notifier.id,
        success,
        error,
        timestamp: Utc::now(),
        response_time_ms: started.elapsed().as_millis() as u64,
    }
}

fn format_time_helper(
    h: &handlebars::Helper,
    _: &handlebars::Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or_default();
    out.write(value)?;
    Ok(())
}

/// Observer that adapts alert state changes into rendered notifications and
/// fans them out through the dispatcher.
pub struct AlertNotificationAdapter {
    dispatcher: Arc<Dispatcher>,
}

impl AlertNotificationAdapter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl AlertObserver for AlertNotificationAdapter {
    async fn on_alert_change(&self, alert: &Alert) {
        let message = match self.dispatcher.render_alert(alert) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "failed to render alert notification");
                return;
            }
        };

        let results = self.dispatcher.send_notification(&message).await;
        for result in results {
            if !result.success {
                tracing::warn!(
                    notifier_id = %result.notifier_id,
                    error = ?result.error,
                    "notification delivery failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, ConditionOperator};
    use crate::coordination::InMemoryCoordinationStore;
    use crate::model::MetricCategory;

    async fn test_dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(InMemoryCoordinationStore::new(), "/monitor/notifiers", Duration::from_secs(5))
            .await
            .unwrap()
    }

    fn sample_alert() -> Alert {
        Alert {
            id: "r1:cpu".to_string(),
            rule_id: "r1".to_string(),
            rule_name: "high cpu".to_string(),
            target_type: MetricCategory::Server,
            metric: "server.cpu.usage".to_string(),
            labels: BTreeMap::new(),
            value: 97.0,
            threshold: 90.0,
            condition: ConditionOperator::GreaterThan,
            severity: AlertSeverity::Critical,
            state: AlertState::Firing,
            starts_at: Utc::now(),
            ends_at: None,
            description: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn render_alert_includes_title_and_metric() {
        let dispatcher = test_dispatcher().await;
        let message = dispatcher.render_alert(&sample_alert()).unwrap();
        assert!(message.title.contains("critical"));
        assert!(message.body.contains("server.cpu.usage"));
    }

    #[tokio::test]
    async fn render_resolved_alert_prefixes_title() {
        let mut alert = sample_alert();
        alert.state = AlertState::Resolved;
        let dispatcher = test_dispatcher().await;
        let message = dispatcher.render_alert(&alert).unwrap();
        assert!(message.title.starts_with("[RESOLVED]"));
    }

    #[tokio::test]
    async fn send_notification_with_no_notifiers_returns_empty() {
        let dispatcher = test_dispatcher().await;
        let message = dispatcher.render_alert(&sample_alert()).unwrap();
        let results = dispatcher.send_notification(&message).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn disabled_notifier_is_skipped() {
        let dispatcher = test_dispatcher().await;
        dispatcher
            .put_notifier(NotifierConfig {
                id: "n1".to_string(),
                name: "disabled webhook".to_string(),
                description: None,
                enabled: false,
                config: ChannelConfig::Webhook {
                    url: "https://example.invalid/hook".to_string(),
                    method: "POST".to_string(),
                    headers: BTreeMap::new(),
                    timeout_secs: 5,
                },
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let message = dispatcher.render_alert(&sample_alert()).unwrap();
        let results = dispatcher.send_notification(&message).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn put_notifier_persists_to_coordination_store() {
        let coordination = InMemoryCoordinationStore::new();
        let dispatcher = Dispatcher::new(coordination.clone(), "/monitor/notifiers", Duration::from_secs(5))
            .await
            .unwrap();
        dispatcher
            .put_notifier(NotifierConfig {
                id: "n1".to_string(),
                name: "webhook".to_string(),
                description: None,
                enabled: true,
                config: ChannelConfig::Webhook {
                    url: "https://example.invalid/hook".to_string(),
                    method: "POST".to_string(),
                    headers: BTreeMap::new(),
                    timeout_secs: 5,
                },
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let entries = coordination.get_prefix("/monitor/notifiers").await.unwrap();
        assert_eq!(entries.len(), 1);

        // A fresh dispatcher against the same store picks the config up on
        // construction, proving configs survive a restart.
        let reloaded = Dispatcher::new(coordination, "/monitor/notifiers", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reloaded.list_notifiers().await.len(), 1);
    }
}
