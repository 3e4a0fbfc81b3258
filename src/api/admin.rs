//! HTTP admin API: alert rule CRUD, active alerts, notifier CRUD/test,
//! notifier type metadata, manual notification send.

use std::convert::Infallible;
use std::sync::Arc;

use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::alerts::AlertManager;
use crate::core::error::MonitorError;
use crate::model::MetricCategory;
use crate::notifiers::{ChannelConfig, Dispatcher, NotifierConfig};
use crate::storage::{MetricStore, PointFilter};

fn category_from_str(s: &str) -> Result<MetricCategory, MonitorError> {
    match s {
        "server" => Ok(MetricCategory::Server),
        "app" => Ok(MetricCategory::App),
        "api" => Ok(MetricCategory::Api),
        "custom" => Ok(MetricCategory::Custom),
        other => Err(MonitorError::invalid_input(format!("unknown category '{other}'"))),
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    category: String,
}

fn error_reply(err: MonitorError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match err.category() {
        crate::core::error::ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
        crate::core::error::ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        crate::core::error::ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
        crate::core::error::ErrorCategory::TransientIo
        | crate::core::error::ErrorCategory::ConfigDecode
        | crate::core::error::ErrorCategory::ChannelSend
        | crate::core::error::ErrorCategory::System => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorBody {
        category: err.category().to_string(),
        error: err.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status)
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct BatchResult {
    id: String,
    success: bool,
    error: Option<String>,
}

/// Build every admin route, wired to the given alert manager, notification
/// dispatcher, and metric store.
pub fn routes(
    alerts: Arc<AlertManager>,
    dispatcher: Arc<Dispatcher>,
    store: MetricStore,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let alerts_filter = warp::any().map(move || alerts.clone());
    let dispatcher_filter = warp::any().map(move || dispatcher.clone());
    let store_filter = warp::any().map(move || store.clone());

    let list_rules = warp::path!("alerts" / "rules")
        .and(warp::get())
        .and(alerts_filter.clone())
        .and_then(|alerts: Arc<AlertManager>| async move {
            Ok::<_, Infallible>(warp::reply::json(&alerts.list_rules().await))
        });

    let put_rule = warp::path!("alerts" / "rules")
        .and(warp::post().or(warp::put()).unify())
        .and(warp::body::json())
        .and(alerts_filter.clone())
        .and_then(|rule: crate::alerts::AlertRule, alerts: Arc<AlertManager>| async move {
            match alerts.put_rule(rule).await {
                Ok(()) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "ok"})),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        });

    let delete_rule = warp::path!("alerts" / "rules" / String)
        .and(warp::delete())
        .and(alerts_filter.clone())
        .and_then(|id: String, alerts: Arc<AlertManager>| async move {
            match alerts.delete_rule(&id).await {
                Ok(()) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "ok"})),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        });

    let toggle_rule = warp::path!("alerts" / "rules" / String / "enabled")
        .and(warp::post())
        .and(warp::body::json())
        .and(alerts_filter.clone())
        .and_then(|id: String, body: ToggleBody, alerts: Arc<AlertManager>| async move {
            match alerts.set_enabled(&id, body.enabled).await {
                Ok(()) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "ok"})),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        });

    let active_alerts = warp::path!("alerts" / "active")
        .and(warp::get())
        .and(alerts_filter.clone())
        .and_then(|alerts: Arc<AlertManager>| async move {
            Ok::<_, Infallible>(warp::reply::json(&alerts.list_active_alerts().await))
        });

    let list_notifiers = warp::path!("notifiers")
        .and(warp::get())
        .and(dispatcher_filter.clone())
        .and_then(|dispatcher: Arc<Dispatcher>| async move {
            Ok::<_, Infallible>(warp::reply::json(&dispatcher.list_notifiers().await))
        });

    let put_notifier = warp::path!("notifiers")
        .and(warp::post().or(warp::put()).unify())
        .and(warp::body::json())
        .and(dispatcher_filter.clone())
        .and_then(|notifier: NotifierConfig, dispatcher: Arc<Dispatcher>| async move {
            match dispatcher.put_notifier(notifier).await {
                Ok(()) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "ok"})),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        });

    let delete_notifier = warp::path!("notifiers" / String)
        .and(warp::delete())
        .and(dispatcher_filter.clone())
        .and_then(|id: String, dispatcher: Arc<Dispatcher>| async move {
            match dispatcher.delete_notifier(&id).await {
                Ok(()) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "ok"})),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        });

    let toggle_notifier = warp::path!("notifiers" / String / "enabled")
        .and(warp::post())
        .and(warp::body::json())
        .and(dispatcher_filter.clone())
        .and_then(|id: String, body: ToggleBody, dispatcher: Arc<Dispatcher>| async move {
            match dispatcher.set_enabled(&id, body.enabled).await {
                Ok(()) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "ok"})),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        });

    let batch_notifiers = warp::path!("notifiers" / "batch")
        .and(warp::post())
        .and(warp::body::json())
        .and(dispatcher_filter.clone())
        .and_then(|notifiers: Vec<NotifierConfig>, dispatcher: Arc<Dispatcher>| async move {
            let mut results = Vec::with_capacity(notifiers.len());
            for notifier in notifiers {
                let id = notifier.id.clone();
                let (success, error) = match dispatcher.put_notifier(notifier).await {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                results.push(BatchResult { id, success, error });
            }
            Ok::<_, Infallible>(warp::reply::json(&results))
        });

    let notifier_types = warp::path!("notifiers" / "types")
        .and(warp::get())
        .and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&serde_json::json!([
                "email", "webhook", "wechat", "dingtalk"
            ])))
        });

    let notifier_template = warp::path!("notifiers" / "templates" / String)
        .and(warp::get())
        .and_then(|kind: String| async move {
            let shape = match kind.as_str() {
                "email" => serde_json::json!({
                    "type": "email", "smtp_host": "", "smtp_port": 587, "username": "",
                    "password": "", "from": "", "to": [], "use_tls": false
                }),
                "webhook" => serde_json::json!({
                    "type": "webhook", "url": "", "method": "POST", "headers": {}, "timeout_secs": 10
                }),
                "wechat" => serde_json::json!({"type": "wechat", "webhook_url": ""}),
                "dingtalk" => serde_json::json!({"type": "dingtalk", "webhook_url": "", "secret": null}),
                _ => {
                    return Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({"error": "unknown notifier type"})),
                        StatusCode::BAD_REQUEST,
                    ))
                }
            };
            Ok(warp::reply::with_status(warp::reply::json(&shape), StatusCode::OK))
        });

    #[derive(Deserialize)]
    struct TestSendBody {
        title: String,
        body: String,
    }

    let send_notification = warp::path!("notifiers" / "send")
        .and(warp::post())
        .and(warp::body::json())
        .and(dispatcher_filter.clone())
        .and_then(|body: TestSendBody, dispatcher: Arc<Dispatcher>| async move {
            let message = crate::notifiers::NotificationMessage {
                title: body.title,
                body: body.body,
            };
            let results = dispatcher.send_notification(&message).await;
            Ok::<_, Infallible>(warp::reply::json(&results))
        });

    // Allow a test notifier config in the request body without saving it,
    // sent through a disposable dispatcher backed by its own in-memory
    // coordination store rather than the shared one.
    let test_notifier = warp::path!("notifiers" / "test")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(|config: ChannelConfig| async move {
            let notifier = NotifierConfig {
                id: "test".to_string(),
                name: "test".to_string(),
                description: None,
                enabled: true,
                config,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            };
            let coordination = crate::coordination::InMemoryCoordinationStore::new();
            let dispatcher = match Dispatcher::new(coordination, "/monitor/notifiers/test", std::time::Duration::from_secs(10)).await {
                Ok(dispatcher) => dispatcher,
                Err(e) => return Ok::<_, Infallible>(error_reply(e)),
            };
            if let Err(e) = dispatcher.put_notifier(notifier).await {
                return Ok(error_reply(e));
            }
            let message = crate::notifiers::NotificationMessage {
                title: "Test notification".to_string(),
                body: "This is a test notification from the monitoring control plane.".to_string(),
            };
            let results = dispatcher.send_notification(&message).await;
            Ok(warp::reply::with_status(warp::reply::json(&results), StatusCode::OK))
        });

    #[derive(Deserialize)]
    struct QueryPointsQuery {
        metric: String,
        category: Option<String>,
        start_millis: Option<i64>,
        end_millis: Option<i64>,
        limit: Option<usize>,
    }

    let query_points = warp::path!("query" / "points")
        .and(warp::get())
        .and(warp::query::<QueryPointsQuery>())
        .and(store_filter.clone())
        .and_then(|q: QueryPointsQuery, store: MetricStore| async move {
            let category = match q.category.as_deref().map(category_from_str).transpose() {
                Ok(c) => c,
                Err(e) => return Ok::<_, Infallible>(error_reply(e)),
            };
            let end = q
                .end_millis
                .and_then(|m| chrono::Utc.timestamp_millis_opt(m).single())
                .unwrap_or_else(chrono::Utc::now);
            let start = q
                .start_millis
                .and_then(|m| chrono::Utc.timestamp_millis_opt(m).single())
                .unwrap_or_else(|| end - chrono::Duration::hours(1));

            let filter = PointFilter {
                categories: category.map(|c| vec![c]),
                metric_names: Some(vec![q.metric]),
                ..Default::default()
            };

            match store.query_points(&filter, start, end, q.limit) {
                Ok(points) => Ok(warp::reply::with_status(warp::reply::json(&points), StatusCode::OK)),
                Err(e) => Ok(error_reply(e)),
            }
        });

    list_rules
        .or(put_rule)
        .or(delete_rule)
        .or(toggle_rule)
        .or(active_alerts)
        .or(list_notifiers)
        .or(put_notifier)
        .or(delete_notifier)
        .or(toggle_notifier)
        .or(batch_notifiers)
        .or(notifier_types)
        .or(notifier_template)
        .or(send_notification)
        .or(test_notifier)
        .or(query_points)
}
