//! Embedded time-series storage for metric points.
//!
//! Backed by `sled`, an ordered KV store, using a key layout that makes
//! range scans over a series' time window a contiguous iteration:
//!
//! ```text
//! metric:<category>:<source>:<instance>:<metric_name>:<unix_nanos>
//! ```
//!
//! Label sets are not part of the key (they vary independently of the
//! series coordinates the key encodes) and are stored in the value record
//! alongside the point.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{MonitorError, Result};
use crate::model::{AggregationType, MetricCategory, MetricPoint, SeriesBucket, TimeSeries};

/// On-disk record for one point. Timestamp is redundant with the key but
/// kept here too so decoding doesn't require re-parsing the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    timestamp: DateTime<Utc>,
    metric_name: String,
    metric_type: crate::model::MetricType,
    value: f64,
    source: String,
    instance: String,
    category: MetricCategory,
    labels: BTreeMap<String, String>,
    unit: Option<String>,
    description: Option<String>,
}

impl From<&MetricPoint> for StoredPoint {
    fn from(p: &MetricPoint) -> Self {
        Self {
            timestamp: p.timestamp,
            metric_name: p.metric_name.clone(),
            metric_type: p.metric_type,
            value: p.value,
            source: p.source.clone(),
            instance: p.instance.clone(),
            category: p.category,
            labels: p.labels.clone(),
            unit: p.unit.clone(),
            description: p.description.clone(),
        }
    }
}

impl From<StoredPoint> for MetricPoint {
    fn from(s: StoredPoint) -> Self {
        Self {
            timestamp: s.timestamp,
            metric_name: s.metric_name,
            metric_type: s.metric_type,
            value: s.value,
            source: s.source,
            instance: s.instance,
            category: s.category,
            labels: s.labels,
            unit: s.unit,
            description: s.description,
        }
    }
}

const ALL_CATEGORIES: [MetricCategory; 4] = [
    MetricCategory::Server,
    MetricCategory::App,
    MetricCategory::Api,
    MetricCategory::Custom,
];

fn category_prefix(category: MetricCategory) -> Vec<u8> {
    format!("metric:{}:", category.as_str()).into_bytes()
}

fn point_key(p: &MetricPoint) -> Vec<u8> {
    let mut key = category_prefix(p.category);
    key.extend_from_slice(format!("{}:{}:{}:", p.source, p.instance, p.metric_name).as_bytes());
    let nanos = p.timestamp.timestamp_nanos_opt().unwrap_or_default();
    key.extend_from_slice(format!("{nanos:020}").as_bytes());
    key
}

/// Filter applied when scanning points within a window. Every `Some` field
/// is a set membership test (`None` matches everything); `labels` is an
/// equality matcher on every listed key.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    pub categories: Option<Vec<MetricCategory>>,
    pub sources: Option<Vec<String>>,
    pub instances: Option<Vec<String>>,
    pub metric_names: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
}

impl PointFilter {
    fn matches(&self, p: &MetricPoint) -> bool {
        if let Some(ref sources) = self.sources {
            if !sources.iter().any(|s| s == &p.source) {
                return false;
            }
        }
        if let Some(ref instances) = self.instances {
            if !instances.iter().any(|i| i == &p.instance) {
                return false;
            }
        }
        if let Some(ref names) = self.metric_names {
            if !names.iter().any(|n| n == &p.metric_name) {
                return false;
            }
        }
        for (k, v) in &self.labels {
            if p.labels.get(k) != Some(v) {
                return false;
            }
        }
        true
    }

    fn categories_to_scan(&self) -> Vec<MetricCategory> {
        self.categories.clone().unwrap_or_else(|| ALL_CATEGORIES.to_vec())
    }
}

/// Persistent metric point store. Cloneable handle over a shared `sled::Db`.
#[derive(Clone)]
pub struct MetricStore {
    db: Arc<sled::Db>,
    retention_days: i64,
}

impl MetricStore {
    pub fn open(data_dir: impl AsRef<Path>, retention_days: i64) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).map_err(|_| MonitorError::ConfigDirCreation {
            path: data_dir.as_ref().to_path_buf(),
        })?;
        let db = sled::open(data_dir)?;
        Ok(Self {
            db: Arc::new(db),
            retention_days,
        })
    }

    /// Write a batch of points atomically.
    pub fn store(&self, points: &[MetricPoint]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for p in points {
            let key = point_key(p);
            let value = serde_json::to_vec(&StoredPoint::from(p))
                .map_err(|e| MonitorError::StorageWrite { message: e.to_string() })?;
            batch.insert(key, value);
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| MonitorError::StorageWrite { message: e.to_string() })?;
        Ok(())
    }

    /// Scan every point matching `filter` within `[start, end]`, in
    /// timestamp order. `categories` in the filter is the scan's own
    /// partitioning (one prefix scan per requested category, or all four
    /// if unset); the remaining fields filter decoded points.
    fn scan_raw(
        &self,
        filter: &PointFilter,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricPoint>> {
        let start_nanos = start.timestamp_nanos_opt().unwrap_or(i64::MIN);
        let end_nanos = end.timestamp_nanos_opt().unwrap_or(i64::MAX);

        let mut out = Vec::new();
        for category in filter.categories_to_scan() {
            for item in self.db.scan_prefix(category_prefix(category)) {
                let (key, value) = item.map_err(|e| MonitorError::StorageQuery { message: e.to_string() })?;
                let Some(nanos) = extract_nanos(&key) else { continue };
                if nanos < start_nanos || nanos > end_nanos {
                    continue;
                }
                let stored: StoredPoint = serde_json::from_slice(&value)
                    .map_err(|e| MonitorError::StorageDecode { message: e.to_string() })?;
                let point = MetricPoint::from(stored);
                if !filter.matches(&point) {
                    continue;
                }
                out.push(point);
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        out.sort_by_key(|p| p.timestamp);
                        return Ok(out);
                    }
                }
            }
        }
        out.sort_by_key(|p| p.timestamp);
        Ok(out)
    }

    /// Scan raw points matching `filter` within `[start, end]`, time-ordered.
    pub fn query_points(
        &self,
        filter: &PointFilter,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricPoint>> {
        self.scan_raw(filter, start, end, limit)
    }

    /// Scan every series matching `filter` within a window, group by series
    /// identity, bucket by `interval`, and aggregate each bucket with `agg`.
    pub fn query_series(
        &self,
        filter: &PointFilter,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: chrono::Duration,
        agg: AggregationType,
    ) -> Result<Vec<TimeSeries>> {
        let points = self.scan_raw(filter, start, end, None)?;

        let mut grouped: BTreeMap<String, TimeSeries> = BTreeMap::new();
        let mut raw: BTreeMap<String, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();

        for point in points {
            let id = point.series_identity();
            grouped.entry(id.clone()).or_insert_with(|| TimeSeries {
                metric_name: point.metric_name.clone(),
                source: point.source.clone(),
                instance: point.instance.clone(),
                category: point.category,
                labels: point.labels.clone(),
                buckets: Vec::new(),
            });
            raw.entry(id).or_default().push((point.timestamp, point.value));
        }

        for (id, mut samples) in raw {
            samples.sort_by_key(|(ts, _)| *ts);
            let series = grouped.get_mut(&id).unwrap();

            let mut bucket_start = start;
            while bucket_start < end {
                let bucket_end = bucket_start + interval;
                let values: Vec<f64> = samples
                    .iter()
                    .filter(|(ts, _)| *ts >= bucket_start && *ts < bucket_end)
                    .map(|(_, v)| *v)
                    .collect();
                if !values.is_empty() {
                    series.buckets.push(SeriesBucket {
                        timestamp: bucket_start,
                        value: agg.apply(&values),
                    });
                }
                bucket_start = bucket_end;
            }
        }

        Ok(grouped.into_values().collect())
    }

    /// Delete every point older than the retention window and request
    /// compaction. Intended to be run periodically by a background task.
    pub fn enforce_retention(&self) -> Result<u64> {
        if self.retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        let cutoff_nanos = cutoff.timestamp_nanos_opt().unwrap_or_default();

        let mut to_delete = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item.map_err(|e| MonitorError::StorageCompaction { message: e.to_string() })?;
            if let Some(nanos) = extract_nanos(&key) {
                if nanos < cutoff_nanos {
                    to_delete.push(key.to_vec());
                }
            }
        }

        let mut batch = sled::Batch::default();
        for key in &to_delete {
            batch.remove(key.clone());
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| MonitorError::StorageCompaction { message: e.to_string() })?;

        self.db
            .flush()
            .map_err(|e| MonitorError::StorageCompaction { message: e.to_string() })?;

        Ok(to_delete.len() as u64)
    }

    /// Spawn the retention GC loop, ticking once a day.
    pub fn spawn_retention_task(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            loop {
                ticker.tick().await;
                match self.enforce_retention() {
                    Ok(removed) => tracing::info!(removed, "retention compaction completed"),
                    Err(e) => tracing::warn!(error = %e, "retention compaction failed"),
                }
            }
        })
    }
}

fn extract_nanos(key: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(key).ok()?;
    let nanos_str = s.rsplit(':').next()?;
    nanos_str.parse::<i64>().ok()
}

#[allow(dead_code)]
fn nanos_to_datetime(nanos: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_nanos(nanos).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn point(name: &str, value: f64, ts: DateTime<Utc>) -> MetricPoint {
        MetricPoint {
            timestamp: ts,
            metric_name: name.to_string(),
            metric_type: crate::model::MetricType::Gauge,
            value,
            source: "host1".to_string(),
            instance: "10.0.0.1".to_string(),
            category: MetricCategory::Server,
            labels: BTreeMap::new(),
            unit: None,
            description: None,
        }
    }

    #[test]
    fn store_and_query_points_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();

        let now = Utc::now();
        let points = vec![
            point("cpu.usage", 10.0, now - chrono::Duration::seconds(60)),
            point("cpu.usage", 20.0, now),
        ];
        store.store(&points).unwrap();

        let fetched = store
            .query_points(
                &PointFilter::default(),
                now - chrono::Duration::minutes(5),
                now + chrono::Duration::minutes(5),
                None,
            )
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].value, 10.0);
        assert_eq!(fetched[1].value, 20.0);
    }

    #[test]
    fn query_points_filters_by_metric_name_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();

        let now = Utc::now();
        store
            .store(&[point("cpu.usage", 10.0, now), point("mem.usage", 20.0, now)])
            .unwrap();

        let filter = PointFilter {
            metric_names: Some(vec!["cpu.usage".to_string()]),
            ..Default::default()
        };
        let fetched = store
            .query_points(&filter, now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1), None)
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].metric_name, "cpu.usage");
    }

    #[test]
    fn query_series_aggregates_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();

        let now = Utc::now();
        store
            .store(&[
                point("cpu.usage", 10.0, now),
                point("cpu.usage", 30.0, now + chrono::Duration::seconds(1)),
            ])
            .unwrap();

        let filter = PointFilter {
            metric_names: Some(vec!["cpu.usage".to_string()]),
            ..Default::default()
        };
        let series = store
            .query_series(
                &filter,
                now - chrono::Duration::seconds(1),
                now + chrono::Duration::minutes(1),
                chrono::Duration::minutes(1),
                AggregationType::Avg,
            )
            .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].buckets.len(), 1);
        assert_eq!(series[0].buckets[0].value, 20.0);
    }

    #[test]
    fn query_series_merges_across_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 30).unwrap();

        let now = Utc::now();
        let mut from_host2 = point("cpu.usage", 30.0, now + chrono::Duration::seconds(1));
        from_host2.source = "host2".to_string();
        from_host2.instance = "10.0.0.2".to_string();

        store.store(&[point("cpu.usage", 10.0, now), from_host2]).unwrap();

        let filter = PointFilter {
            metric_names: Some(vec!["cpu.usage".to_string()]),
            ..Default::default()
        };
        let series = store
            .query_series(
                &filter,
                now - chrono::Duration::seconds(1),
                now + chrono::Duration::minutes(1),
                chrono::Duration::minutes(1),
                AggregationType::Avg,
            )
            .unwrap();

        assert_eq!(series.len(), 1, "points from different sources with the same metric/labels merge into one series");
        assert_eq!(series[0].buckets[0].value, 20.0);
    }

    #[test]
    fn retention_removes_old_points_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path(), 1).unwrap();

        let now = Utc::now();
        store
            .store(&[
                point("cpu.usage", 1.0, now - chrono::Duration::days(5)),
                point("cpu.usage", 2.0, now),
            ])
            .unwrap();

        let removed = store.enforce_retention().unwrap();
        assert_eq!(removed, 1);

        let remaining = store
            .query_points(
                &PointFilter::default(),
                now - chrono::Duration::days(10),
                now + chrono::Duration::minutes(1),
                None,
            )
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, 2.0);
    }
}
