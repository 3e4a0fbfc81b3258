//! Alert rule management and evaluation.
//!
//! Rules live in the coordination store so any admin-API node can edit
//! them; every node watches the rule prefix and reconciles an in-memory
//! cache, then runs its own evaluation loop against that cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::error::{MonitorError, Result};
use crate::coordination::{CoordinationStore, WatchEvent};
use crate::model::{MetricCategory, MetricPoint};
use crate::storage::{MetricStore, PointFilter};

/// How an alert's value is compared against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl ConditionOperator {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
            Self::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Severity assigned to a rule, carried through to fired alerts and
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }

    /// Collapse to a notification `level`, per the adapter's severity→level
    /// mapping (`critical` and `emergency` both read as `critical`).
    pub fn notification_level(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical | Self::Emergency => "critical",
        }
    }
}

/// A saved alerting rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub target_type: MetricCategory,
    pub metric: String,
    pub label_matchers: BTreeMap<String, String>,
    pub condition: ConditionOperator,
    pub threshold: f64,
    /// Rule must hold for every sample across this duration before firing.
    pub duration: chrono::Duration,
    pub severity: AlertSeverity,
    pub description: Option<String>,
}

/// Lifecycle state of a fired alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Firing,
    Resolved,
}

/// One active or historically-resolved alert instance, keyed by
/// `<rule_id>:<series identity>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub target_type: MetricCategory,
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub threshold: f64,
    pub condition: ConditionOperator,
    pub severity: AlertSeverity,
    pub state: AlertState,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Alert key = `"<rule_id>:<series identity>"`, where series identity
/// already folds in the metric name and every `k=v` label in sorted order.
fn alert_key(rule_id: &str, series_identity: &str) -> String {
    format!("{rule_id}:{series_identity}")
}

/// Observer notified whenever an alert transitions state, used to fan out
/// to the notifier dispatcher without the alert manager depending on it
/// directly.
#[async_trait::async_trait]
pub trait AlertObserver: Send + Sync {
    async fn on_alert_change(&self, alert: &Alert);
}

/// Owns the rule cache, active alert table, and the background evaluation
/// loop.
pub struct AlertManager {
    store: MetricStore,
    coordination: Arc<dyn CoordinationStore>,
    rule_prefix: String,
    rules: RwLock<BTreeMap<String, AlertRule>>,
    active: RwLock<BTreeMap<String, Alert>>,
    observers: RwLock<Vec<Arc<dyn AlertObserver>>>,
}

impl AlertManager {
    pub async fn new(
        store: MetricStore,
        coordination: Arc<dyn CoordinationStore>,
        rule_prefix: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let rule_prefix = rule_prefix.into();
        let manager = Arc::new(Self {
            store,
            coordination,
            rule_prefix,
            rules: RwLock::new(BTreeMap::new()),
            active: RwLock::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
        });
        manager.reload_rules().await?;
        Ok(manager)
    }

    pub async fn add_observer(&self, observer: Arc<dyn AlertObserver>) {
        self.observers.write().await.push(observer);
    }

    async fn reload_rules(&self) -> Result<()> {
        let entries = self.coordination.get_prefix(&self.rule_prefix).await?;
        let mut rules = self.rules.write().await;
        rules.clear();
        for (key, value) in entries {
            match serde_json::from_slice::<AlertRule>(&value) {
                Ok(rule) => {
                    rules.insert(rule.id.clone(), rule);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "failed to decode alert rule, skipping");
                }
            }
        }
        Ok(())
    }

    pub async fn put_rule(&self, rule: AlertRule) -> Result<()> {
        let key = format!("{}/{}", self.rule_prefix, rule.id);
        let value = serde_json::to_vec(&rule)
            .map_err(|e| MonitorError::RuleInvalid { message: e.to_string() })?;
        self.coordination.put(&key, value).await?;
        self.rules.write().await.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let key = format!("{}/{}", self.rule_prefix, rule_id);
        self.coordination.delete(&key).await?;
        self.rules.write().await.remove(rule_id);
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<AlertRule> {
        self.rules
            .read()
            .await
            .get(rule_id)
            .cloned()
            .ok_or_else(|| MonitorError::rule_not_found(rule_id))
    }

    pub async fn list_rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rule = self.get_rule(rule_id).await?;
        rule.enabled = enabled;
        self.put_rule(rule).await
    }

    pub async fn list_active_alerts(&self) -> Vec<Alert> {
        self.active
            .read()
            .await
            .values()
            .filter(|a| a.state == AlertState::Firing)
            .cloned()
            .collect()
    }

    /// Spawn the watch-reconciliation task: reloads the whole rule cache on
    /// every coordination-store event under the rule prefix.
    pub fn spawn_watch_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match manager.coordination.watch_prefix(&manager.rule_prefix).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start rule watch");
                    return;
                }
            };
            while let Some(event) = rx.recv().await {
                match event {
                    WatchEvent::Put { .. } | WatchEvent::Delete { .. } => {
                        if let Err(e) = manager.reload_rules().await {
                            tracing::warn!(error = %e, "rule reload after watch event failed");
                        }
                    }
                }
            }
        })
    }

    /// Spawn the 30-second evaluation loop.
    pub fn spawn_evaluation_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if let Err(e) = manager.evaluate_all().await {
                    tracing::warn!(error = %e, "alert evaluation tick failed");
                }
            }
        })
    }

    /// Evaluate every enabled rule once, sequentially.
    pub async fn evaluate_all(&self) -> Result<()> {
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        for rule in rules {
            if let Err(e) = self.evaluate_rule(&rule).await {
                tracing::warn!(rule_id = %rule.id, error = %e, "rule evaluation failed");
            }
        }
        Ok(())
    }

    /// Evaluate a single rule against the raw points in its duration window.
    ///
    /// For each series matching the rule: if the last point fails the
    /// condition, resolve immediately. Otherwise the condition must hold for
    /// every individual point in the window before the rule fires; if the
    /// last point holds but some earlier point in the window doesn't, the
    /// series is left exactly as it was — neither fired nor resolved.
    async fn evaluate_rule(&self, rule: &AlertRule) -> Result<()> {
        let end = Utc::now();
        let start = end - rule.duration;

        let filter = PointFilter {
            categories: Some(vec![rule.target_type]),
            metric_names: Some(vec![rule.metric.clone()]),
            labels: rule.label_matchers.clone(),
            ..Default::default()
        };

        let points = self.store.query_points(&filter, start, end, None)?;

        let mut by_series: BTreeMap<String, Vec<MetricPoint>> = BTreeMap::new();
        for point in points {
            by_series.entry(point.series_identity()).or_default().push(point);
        }

        for (identity, mut samples) in by_series {
            samples.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            let Some(last) = samples.last() else { continue };
            let key = alert_key(&rule.id, &identity);

            if !rule.condition.holds(last.value, rule.threshold) {
                self.resolve(&key).await;
                continue;
            }

            let all_hold = samples
                .iter()
                .all(|p| rule.condition.holds(p.value, rule.threshold));
            if all_hold {
                let labels = last.labels.clone();
                let value = last.value;
                self.fire(rule, &labels, value, &key).await;
            }
        }

        Ok(())
    }

    async fn fire(&self, rule: &AlertRule, labels: &BTreeMap<String, String>, value: f64, key: &str) {
        let now = Utc::now();
        let mut active = self.active.write().await;

        let alert = active.entry(key.to_string()).or_insert_with(|| Alert {
            id: key.to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            target_type: rule.target_type,
            metric: rule.metric.clone(),
            labels: labels.clone(),
            value,
            threshold: rule.threshold,
            condition: rule.condition,
            severity: rule.severity,
            state: AlertState::Firing,
            starts_at: now,
            ends_at: None,
            description: rule.description.clone(),
            updated_at: now,
        });

        let was_resolved = alert.state == AlertState::Resolved;
        alert.value = value;
        alert.state = AlertState::Firing;
        alert.ends_at = None;
        alert.updated_at = now;
        if was_resolved {
            alert.starts_at = now;
        }
        let snapshot = alert.clone();
        drop(active);

        if was_resolved {
            self.notify_observers(&snapshot).await;
        }
    }

    async fn resolve(&self, key: &str) {
        let mut active = self.active.write().await;
        let Some(alert) = active.get_mut(key) else { return };
        if alert.state == AlertState::Resolved {
            return;
        }
        alert.state = AlertState::Resolved;
        alert.ends_at = Some(Utc::now());
        alert.updated_at = Utc::now();
        let snapshot = alert.clone();
        drop(active);

        self.notify_observers(&snapshot).await;
    }

    async fn notify_observers(&self, alert: &Alert) {
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            observer.on_alert_change(alert).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use crate::model::{MetricPoint, MetricType};

    fn rule(id: &str, threshold: f64) -> AlertRule {
        AlertRule {
            id: id.to_string(),
            name: "high cpu".to_string(),
            enabled: true,
            target_type: MetricCategory::Server,
            metric: "server.cpu.usage".to_string(),
            label_matchers: BTreeMap::new(),
            condition: ConditionOperator::GreaterThan,
            threshold,
            duration: chrono::Duration::seconds(30),
            severity: AlertSeverity::Critical,
            description: Some("CPU usage too high".to_string()),
        }
    }

    fn point(value: f64, ts: DateTime<Utc>) -> MetricPoint {
        MetricPoint {
            timestamp: ts,
            metric_name: "server.cpu.usage".to_string(),
            metric_type: MetricType::Gauge,
            value,
            source: "host1".to_string(),
            instance: "10.0.0.1".to_string(),
            category: MetricCategory::Server,
            labels: BTreeMap::new(),
            unit: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn fires_when_condition_holds_across_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();
        let now = Utc::now();
        store
            .store(&[
                point(95.0, now - chrono::Duration::seconds(20)),
                point(97.0, now),
            ])
            .unwrap();

        let coordination = InMemoryCoordinationStore::new();
        let manager = AlertManager::new(store, coordination, "/monitor/alerts/rules")
            .await
            .unwrap();
        manager.put_rule(rule("r1", 90.0)).await.unwrap();

        manager.evaluate_all().await.unwrap();
        let active = manager.list_active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "r1");
    }

    #[tokio::test]
    async fn does_not_fire_if_any_sample_is_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();
        let now = Utc::now();
        store
            .store(&[
                point(95.0, now - chrono::Duration::seconds(20)),
                point(10.0, now),
            ])
            .unwrap();

        let coordination = InMemoryCoordinationStore::new();
        let manager = AlertManager::new(store, coordination, "/monitor/alerts/rules")
            .await
            .unwrap();
        manager.put_rule(rule("r1", 90.0)).await.unwrap();

        manager.evaluate_all().await.unwrap();
        assert!(manager.list_active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn does_not_fire_when_last_point_holds_but_window_is_mixed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();
        let now = Utc::now();
        // Last point (200) passes ">50", but an earlier point in the window
        // (10) doesn't, so the average (~136.7) would wrongly cross the
        // threshold if buckets were averaged instead of checked per-point.
        store
            .store(&[
                point(10.0, now - chrono::Duration::seconds(20)),
                point(200.0, now - chrono::Duration::seconds(10)),
                point(200.0, now),
            ])
            .unwrap();

        let coordination = InMemoryCoordinationStore::new();
        let manager = AlertManager::new(store, coordination, "/monitor/alerts/rules")
            .await
            .unwrap();
        manager.put_rule(rule("r1", 50.0)).await.unwrap();

        manager.evaluate_all().await.unwrap();
        assert!(manager.list_active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn resolves_previously_firing_alert() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();
        let now = Utc::now();
        store
            .store(&[point(95.0, now - chrono::Duration::seconds(20)), point(95.0, now)])
            .unwrap();

        let coordination = InMemoryCoordinationStore::new();
        let manager = AlertManager::new(store.clone(), coordination, "/monitor/alerts/rules")
            .await
            .unwrap();
        manager.put_rule(rule("r1", 90.0)).await.unwrap();
        manager.evaluate_all().await.unwrap();
        assert_eq!(manager.list_active_alerts().await.len(), 1);

        let resolved_now = Utc::now();
        store
            .store(&[
                point(10.0, resolved_now - chrono::Duration::seconds(20)),
                point(10.0, resolved_now),
            ])
            .unwrap();
        manager.evaluate_all().await.unwrap();
        assert!(manager.list_active_alerts().await.is_empty());
    }
}
