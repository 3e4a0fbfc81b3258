//! HTTP push API: external agents post server metrics directly, bypassing
//! the gRPC ingest path (useful for simple shell-based agents).

use std::convert::Infallible;

use warp::{Filter, Rejection, Reply};

use crate::collectors::{flatten_pushed_metrics, PushedServerMetrics};
use crate::storage::MetricStore;

pub fn routes(store: MetricStore) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let store_filter = warp::any().map(move || store.clone());

    let push_one = warp::path!("monitoring" / "server" / "metrics")
        .and(warp::post())
        .and(warp::body::json())
        .and(store_filter.clone())
        .and_then(|payload: PushedServerMetrics, store: MetricStore| async move {
            let points = flatten_pushed_metrics(&payload);
            match store.store(&points) {
                Ok(()) => Ok::<_, Infallible>(warp::reply::json(&serde_json::json!({"stored": points.len()}))),
                Err(e) => Ok(warp::reply::json(&serde_json::json!({"error": e.to_string()}))),
            }
        });

    let push_batch = warp::path!("monitoring" / "server" / "metrics" / "batch")
        .and(warp::post())
        .and(warp::body::json())
        .and(store_filter)
        .and_then(|payloads: Vec<PushedServerMetrics>, store: MetricStore| async move {
            let mut points = Vec::new();
            for payload in &payloads {
                points.extend(flatten_pushed_metrics(payload));
            }
            match store.store(&points) {
                Ok(()) => Ok::<_, Infallible>(warp::reply::json(&serde_json::json!({"stored": points.len()}))),
                Err(e) => Ok(warp::reply::json(&serde_json::json!({"error": e.to_string()}))),
            }
        });

    push_one.or(push_batch)
}
