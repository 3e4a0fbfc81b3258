//! tonic implementation of the metric ingest/query gRPC service.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tonic::{Request, Response, Status};

use crate::allocator::NodeAllocator;
use crate::model::{MetricCategory, MetricPoint, MetricType};
use crate::storage::{MetricStore, PointFilter};

use super::proto::{
    ingest_service_server::IngestService, GetStorageNodeRequest, GetStorageNodeResponse,
    HeartbeatRequest, HeartbeatResponse, QueryMetricPointsRequest, QueryMetricPointsResponse,
    QueryTimeSeriesRequest, QueryTimeSeriesResponse, SeriesBucket as ProtoSeriesBucket,
    StoreMetricPointsRequest, StoreMetricPointsResponse, StoreMetricProviderRequest,
    TimeSeries as ProtoTimeSeries,
};

fn category_from_str(s: &str) -> Result<MetricCategory, Status> {
    match s {
        "server" => Ok(MetricCategory::Server),
        "app" => Ok(MetricCategory::App),
        "api" => Ok(MetricCategory::Api),
        "custom" => Ok(MetricCategory::Custom),
        other => Err(Status::invalid_argument(format!("unknown category '{other}'"))),
    }
}

fn metric_type_from_str(s: &str) -> Result<MetricType, Status> {
    match s {
        "gauge" => Ok(MetricType::Gauge),
        "counter" => Ok(MetricType::Counter),
        other => Err(Status::invalid_argument(format!("unknown metric type '{other}'"))),
    }
}

fn categories_from_strs(values: &[String]) -> Result<Option<Vec<MetricCategory>>, Status> {
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(values.iter().map(|s| category_from_str(s)).collect::<Result<_, _>>()?))
}

fn set_or_none(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn aggregation_from_str(s: &str) -> Result<crate::model::AggregationType, Status> {
    use crate::model::AggregationType::*;
    match s {
        "sum" => Ok(Sum),
        "avg" => Ok(Avg),
        "min" => Ok(Min),
        "max" => Ok(Max),
        "count" => Ok(Count),
        "last" => Ok(Last),
        other => Err(Status::invalid_argument(format!("unknown aggregation '{other}'"))),
    }
}

fn point_from_proto(p: &super::proto::MetricPoint) -> Result<MetricPoint, Status> {
    Ok(MetricPoint {
        timestamp: Utc
            .timestamp_millis_opt(p.timestamp_millis)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid timestamp_millis"))?,
        metric_name: p.metric_name.clone(),
        metric_type: metric_type_from_str(&p.metric_type)?,
        value: p.value,
        source: p.source.clone(),
        instance: p.instance.clone(),
        category: category_from_str(&p.category)?,
        labels: p.labels.clone().into_iter().collect(),
        unit: p.unit.clone(),
        description: p.description.clone(),
    })
}

fn point_to_proto(p: &MetricPoint) -> super::proto::MetricPoint {
    super::proto::MetricPoint {
        timestamp_millis: p.timestamp.timestamp_millis(),
        metric_name: p.metric_name.clone(),
        metric_type: match p.metric_type {
            MetricType::Gauge => "gauge".to_string(),
            MetricType::Counter => "counter".to_string(),
        },
        value: p.value,
        source: p.source.clone(),
        instance: p.instance.clone(),
        category: p.category.as_str().to_string(),
        labels: p.labels.clone().into_iter().collect(),
        unit: p.unit.clone(),
        description: p.description.clone(),
    }
}

/// Implements `IngestService` over the metric store and node allocator.
pub struct IngestServiceImpl {
    store: MetricStore,
    allocator: Arc<NodeAllocator>,
}

impl IngestServiceImpl {
    pub fn new(store: MetricStore, allocator: Arc<NodeAllocator>) -> Self {
        Self { store, allocator }
    }
}

#[tonic::async_trait]
impl IngestService for IngestServiceImpl {
    async fn store_metric_points(
        &self,
        request: Request<StoreMetricPointsRequest>,
    ) -> Result<Response<StoreMetricPointsResponse>, Status> {
        let req = request.into_inner();
        let points: Result<Vec<MetricPoint>, Status> = req.points.iter().map(point_from_proto).collect();
        let points = points?;

        self.store
            .store(&points)
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(StoreMetricPointsResponse {
            stored: points.len() as u32,
        }))
    }

    async fn store_metric_provider(
        &self,
        request: Request<StoreMetricProviderRequest>,
    ) -> Result<Response<StoreMetricPointsResponse>, Status> {
        let req = request.into_inner();
        let points: Result<Vec<MetricPoint>, Status> = req.points.iter().map(point_from_proto).collect();
        let points = points?;

        self.store
            .store(&points)
            .map_err(|e| Status::internal(e.to_string()))?;

        tracing::debug!(provider = %req.provider_name, count = points.len(), "stored provider points");

        Ok(Response::new(StoreMetricPointsResponse {
            stored: points.len() as u32,
        }))
    }

    async fn query_metric_points(
        &self,
        request: Request<QueryMetricPointsRequest>,
    ) -> Result<Response<QueryMetricPointsResponse>, Status> {
        let req = request.into_inner();
        let start = Utc
            .timestamp_millis_opt(req.start_millis)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid start_millis"))?;
        let end = Utc
            .timestamp_millis_opt(req.end_millis)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid end_millis"))?;

        let filter = PointFilter {
            categories: categories_from_strs(&req.categories)?,
            sources: set_or_none(&req.sources),
            instances: set_or_none(&req.instances),
            metric_names: set_or_none(&req.metric_names),
            labels: req.label_matchers.clone().into_iter().collect::<BTreeMap<_, _>>(),
        };

        let points = self
            .store
            .query_points(&filter, start, end, req.limit.map(|l| l as usize))
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(QueryMetricPointsResponse {
            points: points.iter().map(point_to_proto).collect(),
        }))
    }

    async fn query_time_series(
        &self,
        request: Request<QueryTimeSeriesRequest>,
    ) -> Result<Response<QueryTimeSeriesResponse>, Status> {
        let req = request.into_inner();
        let aggregation = aggregation_from_str(&req.aggregation)?;
        let start = Utc
            .timestamp_millis_opt(req.start_millis)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid start_millis"))?;
        let end = Utc
            .timestamp_millis_opt(req.end_millis)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid end_millis"))?;

        let filter = PointFilter {
            categories: categories_from_strs(&req.categories)?,
            sources: set_or_none(&req.sources),
            instances: set_or_none(&req.instances),
            metric_names: set_or_none(&req.metric_names),
            labels: req.label_matchers.clone().into_iter().collect::<BTreeMap<_, _>>(),
        };

        let series = self
            .store
            .query_series(
                &filter,
                start,
                end,
                chrono::Duration::seconds(req.interval_secs as i64),
                aggregation,
            )
            .map_err(|e| Status::internal(e.to_string()))?;

        let proto_series = series
            .into_iter()
            .map(|ts| ProtoTimeSeries {
                metric_name: ts.metric_name,
                source: ts.source,
                instance: ts.instance,
                category: ts.category.as_str().to_string(),
                labels: ts.labels.into_iter().collect(),
                buckets: ts
                    .buckets
                    .into_iter()
                    .map(|b| ProtoSeriesBucket {
                        timestamp_millis: b.timestamp.timestamp_millis(),
                        value: b.value,
                    })
                    .collect(),
            })
            .collect();

        Ok(Response::new(QueryTimeSeriesResponse { series: proto_series }))
    }

    async fn get_storage_node(
        &self,
        request: Request<GetStorageNodeRequest>,
    ) -> Result<Response<GetStorageNodeResponse>, Status> {
        let req = request.into_inner();
        let allocation = self
            .allocator
            .get_storage_node(&req.service_name, req.force_reassign)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(Response::new(GetStorageNodeResponse {
            node_id: allocation.node_id,
            node_address: allocation.node_address,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let expires_at = self
            .allocator
            .heartbeat(&req.service_name, &req.node_id, &req.address, req.service_count)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(HeartbeatResponse {
            expires_at_millis: expires_at.timestamp_millis(),
        }))
    }
}
