//! Metric collectors: the `MetricProvider` implementations that turn host,
//! application, API and externally-pushed state into `MetricPoint`s.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use tokio::sync::Mutex;

use crate::core::error::Result;
use crate::model::{MetricCategory, MetricPoint, MetricProvider, MetricType};

/// Local host metrics: CPU, memory, disk. Labeled with the host's IP per the
/// resolved "IP-labelled" collector shape — no separate hostname-only
/// variant is implemented.
pub struct ServerCollector {
    hostname: String,
    ip: String,
    sys: Mutex<System>,
}

impl ServerCollector {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip: ip.into(),
            sys: Mutex::new(System::new_all()),
        }
    }

    fn base_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("hostname".to_string(), self.hostname.clone());
        labels.insert("ip".to_string(), self.ip.clone());
        labels
    }
}

#[async_trait::async_trait]
impl MetricProvider for ServerCollector {
    fn get_metric_names(&self) -> Vec<String> {
        vec![
            "server.cpu.usage".to_string(),
            "server.memory.used_bytes".to_string(),
            "server.memory.usage_pct".to_string(),
            "server.disk.used_bytes".to_string(),
        ]
    }

    fn get_category(&self) -> MetricCategory {
        MetricCategory::Server
    }

    async fn to_metric_points(&self) -> Result<Vec<MetricPoint>> {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_disks_list();
        sys.refresh_disks();

        let now = Utc::now();
        let labels = self.base_labels();
        let mut points = Vec::new();

        let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;
        points.push(MetricPoint {
            timestamp: now,
            metric_name: "server.cpu.usage".to_string(),
            metric_type: MetricType::Gauge,
            value: cpu_usage,
            source: self.hostname.clone(),
            instance: self.ip.clone(),
            category: MetricCategory::Server,
            labels: labels.clone(),
            unit: Some("percent".to_string()),
            description: Some("Global CPU utilization".to_string()),
        });

        let used = sys.used_memory() as f64;
        let total = sys.total_memory().max(1) as f64;
        points.push(MetricPoint {
            timestamp: now,
            metric_name: "server.memory.used_bytes".to_string(),
            metric_type: MetricType::Gauge,
            value: used,
            source: self.hostname.clone(),
            instance: self.ip.clone(),
            category: MetricCategory::Server,
            labels: labels.clone(),
            unit: Some("bytes".to_string()),
            description: None,
        });
        points.push(MetricPoint {
            timestamp: now,
            metric_name: "server.memory.usage_pct".to_string(),
            metric_type: MetricType::Gauge,
            value: (used / total) * 100.0,
            source: self.hostname.clone(),
            instance: self.ip.clone(),
            category: MetricCategory::Server,
            labels: labels.clone(),
            unit: Some("percent".to_string()),
            description: None,
        });

        let disk_used: u64 = sys
            .disks()
            .iter()
            .map(|d| d.total_space().saturating_sub(d.available_space()))
            .sum();
        points.push(MetricPoint {
            timestamp: now,
            metric_name: "server.disk.used_bytes".to_string(),
            metric_type: MetricType::Gauge,
            value: disk_used as f64,
            source: self.hostname.clone(),
            instance: self.ip.clone(),
            category: MetricCategory::Server,
            labels,
            unit: Some("bytes".to_string()),
            description: None,
        });

        Ok(points)
    }
}

/// Application-level counters reported in-process (request counts, queue
/// depths, background task durations) via a simple accumulator the app
/// updates and this collector snapshots.
pub struct AppCollector {
    app_name: String,
    instance: String,
    counters: Mutex<BTreeMap<String, f64>>,
}

impl AppCollector {
    pub fn new(app_name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            instance: instance.into(),
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record/overwrite the current value for a named application metric.
    pub async fn record(&self, metric_name: impl Into<String>, value: f64) {
        self.counters.lock().await.insert(metric_name.into(), value);
    }
}

#[async_trait::async_trait]
impl MetricProvider for AppCollector {
    fn get_metric_names(&self) -> Vec<String> {
        vec!["app.*".to_string()]
    }

    fn get_category(&self) -> MetricCategory {
        MetricCategory::App
    }

    async fn to_metric_points(&self) -> Result<Vec<MetricPoint>> {
        let now = Utc::now();
        let counters = self.counters.lock().await;
        Ok(counters
            .iter()
            .map(|(name, value)| MetricPoint {
                timestamp: now,
                metric_name: name.clone(),
                metric_type: MetricType::Gauge,
                value: *value,
                source: self.app_name.clone(),
                instance: self.instance.clone(),
                category: MetricCategory::App,
                labels: BTreeMap::new(),
                unit: None,
                description: None,
            })
            .collect())
    }
}

/// Request latency/error-rate metrics reported by API handlers.
pub struct ApiCollector {
    service_name: String,
    instance: String,
    samples: Mutex<Vec<(String, f64, u16)>>,
}

impl ApiCollector {
    pub fn new(service_name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance: instance.into(),
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Record one completed request: route, duration in ms, HTTP status.
    pub async fn record(&self, route: impl Into<String>, duration_ms: f64, status: u16) {
        self.samples.lock().await.push((route.into(), duration_ms, status));
    }
}

#[async_trait::async_trait]
impl MetricProvider for ApiCollector {
    fn get_metric_names(&self) -> Vec<String> {
        vec!["api.request.duration_ms".to_string(), "api.request.error".to_string()]
    }

    fn get_category(&self) -> MetricCategory {
        MetricCategory::Api
    }

    async fn to_metric_points(&self) -> Result<Vec<MetricPoint>> {
        let now = Utc::now();
        let mut samples = self.samples.lock().await;
        let mut points = Vec::with_capacity(samples.len() * 2);

        for (route, duration_ms, status) in samples.drain(..) {
            let mut labels = BTreeMap::new();
            labels.insert("route".to_string(), route.clone());
            labels.insert("status".to_string(), status.to_string());

            points.push(MetricPoint {
                timestamp: now,
                metric_name: "api.request.duration_ms".to_string(),
                metric_type: MetricType::Gauge,
                value: duration_ms,
                source: self.service_name.clone(),
                instance: self.instance.clone(),
                category: MetricCategory::Api,
                labels: labels.clone(),
                unit: Some("milliseconds".to_string()),
                description: None,
            });
            points.push(MetricPoint {
                timestamp: now,
                metric_name: "api.request.error".to_string(),
                metric_type: MetricType::Gauge,
                value: if status >= 500 { 1.0 } else { 0.0 },
                source: self.service_name.clone(),
                instance: self.instance.clone(),
                category: MetricCategory::Api,
                labels,
                unit: None,
                description: None,
            });
        }

        Ok(points)
    }
}

/// Database/ORM integration hook: a fixed metric/label contract
/// (`db.operation.duration`, `slow` label) rather than per-ORM plugin code.
pub struct DbHookCollector {
    service_name: String,
    instance: String,
    slow_threshold_ms: f64,
    samples: Mutex<Vec<(String, f64)>>,
}

impl DbHookCollector {
    pub fn new(service_name: impl Into<String>, instance: impl Into<String>, slow_threshold_ms: f64) -> Self {
        Self {
            service_name: service_name.into(),
            instance: instance.into(),
            slow_threshold_ms,
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Record one completed database operation's duration.
    pub async fn record(&self, operation: impl Into<String>, duration_ms: f64) {
        self.samples.lock().await.push((operation.into(), duration_ms));
    }
}

#[async_trait::async_trait]
impl MetricProvider for DbHookCollector {
    fn get_metric_names(&self) -> Vec<String> {
        vec!["db.operation.duration".to_string()]
    }

    fn get_category(&self) -> MetricCategory {
        MetricCategory::App
    }

    async fn to_metric_points(&self) -> Result<Vec<MetricPoint>> {
        let now = Utc::now();
        let mut samples = self.samples.lock().await;
        let mut points = Vec::with_capacity(samples.len());

        for (operation, duration_ms) in samples.drain(..) {
            let mut labels = BTreeMap::new();
            labels.insert("operation".to_string(), operation);
            labels.insert(
                "slow".to_string(),
                (duration_ms >= self.slow_threshold_ms).to_string(),
            );

            points.push(MetricPoint {
                timestamp: now,
                metric_name: "db.operation.duration".to_string(),
                metric_type: MetricType::Gauge,
                value: duration_ms,
                source: self.service_name.clone(),
                instance: self.instance.clone(),
                category: MetricCategory::App,
                labels,
                unit: Some("milliseconds".to_string()),
                description: None,
            });
        }

        Ok(points)
    }
}

/// Shape pushed in by external agents via the HTTP push API (§6), flattened
/// into standard `MetricPoint`s.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushedServerMetrics {
    pub timestamp: chrono::DateTime<Utc>,
    pub hostname: String,
    pub ip: String,
    pub metrics: BTreeMap<String, f64>,
}

/// Flatten one pushed payload into `MetricPoint`s tagged `category=server`,
/// `source=hostname`, `instance=ip`.
pub fn flatten_pushed_metrics(payload: &PushedServerMetrics) -> Vec<MetricPoint> {
    let mut labels = BTreeMap::new();
    labels.insert("hostname".to_string(), payload.hostname.clone());
    labels.insert("ip".to_string(), payload.ip.clone());

    payload
        .metrics
        .iter()
        .map(|(name, value)| MetricPoint {
            timestamp: payload.timestamp,
            metric_name: name.clone(),
            metric_type: MetricType::Gauge,
            value: *value,
            source: payload.hostname.clone(),
            instance: payload.ip.clone(),
            category: MetricCategory::Server,
            labels: labels.clone(),
            unit: None,
            description: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_collector_snapshots_recorded_values() {
        let collector = AppCollector::new("svc", "inst-1");
        collector.record("queue.depth", 42.0).await;

        let points = collector.to_metric_points().await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].metric_name, "queue.depth");
        assert_eq!(points[0].value, 42.0);
    }

    #[tokio::test]
    async fn db_hook_marks_slow_operations() {
        let collector = DbHookCollector::new("svc", "inst-1", 100.0);
        collector.record("select_users", 250.0).await;
        collector.record("select_orders", 10.0).await;

        let points = collector.to_metric_points().await.unwrap();
        let slow = points.iter().find(|p| p.labels["operation"] == "select_users").unwrap();
        let fast = points.iter().find(|p| p.labels["operation"] == "select_orders").unwrap();
        assert_eq!(slow.labels["slow"], "true");
        assert_eq!(fast.labels["slow"], "false");
    }

    #[test]
    fn flatten_pushed_metrics_tags_server_category() {
        let mut metrics = BTreeMap::new();
        metrics.insert("cpu.usage".to_string(), 55.0);
        let payload = PushedServerMetrics {
            timestamp: Utc::now(),
            hostname: "web-1".to_string(),
            ip: "10.1.2.3".to_string(),
            metrics,
        };

        let points = flatten_pushed_metrics(&payload);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].source, "web-1");
        assert_eq!(points[0].instance, "10.1.2.3");
        assert!(matches!(points[0].category, MetricCategory::Server));
    }
}
