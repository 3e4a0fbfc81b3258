//! Shared metric data model: the types every collector produces and every
//! storage/alert/query path consumes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a metric's value should be interpreted across samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Point-in-time measurement (CPU%, memory bytes, latency).
    Gauge,
    /// Monotonically increasing count. Stored as the absolute value observed
    /// at ingest time (snapshot-at-ingest), not a running delta.
    Counter,
}

/// Which collector family a metric point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Server,
    App,
    Api,
    Custom,
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::App => "app",
            Self::Api => "api",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single observation: one metric, one source/instance, one timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub value: f64,
    /// Logical source emitting the point (hostname, service name, ...).
    pub source: String,
    /// Instance disambiguator within the source (IP, PID, shard id, ...).
    pub instance: String,
    pub category: MetricCategory,
    pub labels: BTreeMap<String, String>,
    pub unit: Option<String>,
    pub description: Option<String>,
}

impl MetricPoint {
    /// Canonical series identity for this point: metric name + sorted `k=v`
    /// labels, joined so two points belonging to the same series always
    /// produce identical strings regardless of label insertion order.
    /// Deliberately excludes `category`/`source`/`instance` — those are
    /// auxiliary display fields, not part of series identity.
    pub fn series_identity(&self) -> String {
        series_identity(&self.metric_name, &self.labels)
    }
}

/// Build the canonical series-identity string from its components. Shared by
/// `MetricPoint::series_identity` and `TimeSeries::identity` so the two
/// never drift apart.
pub fn series_identity(metric_name: &str, labels: &BTreeMap<String, String>) -> String {
    let mut parts = vec![metric_name.to_string()];
    for (k, v) in labels {
        parts.push(format!("{k}={v}"));
    }
    parts.join("|")
}

/// Aggregation applied when a time series is bucketed over an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Last,
}

impl AggregationType {
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Self::Sum => values.iter().sum(),
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Self::Count => values.len() as f64,
            Self::Last => *values.last().unwrap(),
        }
    }
}

/// One bucket of a queried, aggregated time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesBucket {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A named, labeled time series made of aggregated buckets.
///
/// `source`/`instance`/`category` are carried for display only — they are
/// populated from the first point observed for this identity during a
/// query and play no part in `identity()`, since independent points sharing
/// `(metric_name, labels)` merge into one series regardless of where they
/// were produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    pub metric_name: String,
    pub source: String,
    pub instance: String,
    pub category: MetricCategory,
    pub labels: BTreeMap<String, String>,
    pub buckets: Vec<SeriesBucket>,
}

impl TimeSeries {
    pub fn identity(&self) -> String {
        series_identity(&self.metric_name, &self.labels)
    }
}

/// Capability implemented by every metric source: servers, applications,
/// API endpoints, custom push producers.
#[async_trait::async_trait]
pub trait MetricProvider: Send + Sync {
    /// Stable names of the metrics this provider can emit, used for
    /// discovery and rule-authoring UIs.
    fn get_metric_names(&self) -> Vec<String>;

    /// The category every point from this provider is tagged with.
    fn get_category(&self) -> MetricCategory;

    /// Collect the current set of points.
    async fn to_metric_points(&self) -> crate::core::error::Result<Vec<MetricPoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_identity_ignores_label_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("region".to_string(), "us".to_string());
        a.insert("az".to_string(), "1a".to_string());

        let mut b = BTreeMap::new();
        b.insert("az".to_string(), "1a".to_string());
        b.insert("region".to_string(), "us".to_string());

        let id_a = series_identity("cpu.usage", &a);
        let id_b = series_identity("cpu.usage", &b);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn series_identity_ignores_source_and_instance() {
        let point_a = MetricPoint {
            timestamp: Utc::now(),
            metric_name: "cpu.usage".to_string(),
            metric_type: MetricType::Gauge,
            value: 1.0,
            source: "host1".to_string(),
            instance: "10.0.0.1".to_string(),
            category: MetricCategory::Server,
            labels: BTreeMap::new(),
            unit: None,
            description: None,
        };
        let mut point_b = point_a.clone();
        point_b.source = "host2".to_string();
        point_b.instance = "10.0.0.2".to_string();

        assert_eq!(point_a.series_identity(), point_b.series_identity());
    }

    #[test]
    fn aggregation_min_max_on_empty_is_zero() {
        assert_eq!(AggregationType::Max.apply(&[]), 0.0);
        assert_eq!(AggregationType::Min.apply(&[]), 0.0);
    }

    #[test]
    fn aggregation_avg() {
        assert_eq!(AggregationType::Avg.apply(&[1.0, 2.0, 3.0]), 2.0);
    }
}
