//! Admin API route handlers.
//!
//! One endpoint, dispatched on `action`: reads via `GET ?action=`, writes via
//! `POST {"action": ...}`.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use postflow_core::PostflowError;
use postflow_monitor::OverallHealth;
use postflow_queue::QueueManager;
use postflow_scheduler::{ScalingConfigPatch, StatsRange};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::server::AppState;

pub const READ_ACTIONS: [&str; 9] = [
    "system_metrics",
    "redis_cluster",
    "redis_performance",
    "queue_metrics",
    "scaling_status",
    "scaling_metrics",
    "health_check",
    "monitoring_status",
    "sync_statistics",
];

pub const WRITE_ACTIONS: [&str; 9] = [
    "start_monitoring",
    "stop_monitoring",
    "start_autoscaling",
    "stop_autoscaling",
    "manual_scale",
    "update_scaling_config",
    "collect_metrics",
    "schedule_incremental_sync",
    "schedule_daily_sync",
];

/// JSON error response: `{"ok": false, "error": ...}`.
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({"ok": false, "error": message.into()}),
        }
    }

    fn unknown_action(action: &str, valid: &[&str]) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({
                "ok": false,
                "error": format!("Unknown action '{action}'"),
                "valid_actions": valid,
            }),
        }
    }
}

impl From<PostflowError> for ApiError {
    fn from(e: PostflowError) -> Self {
        let status = match &e {
            PostflowError::Validation(_) => StatusCode::BAD_REQUEST,
            PostflowError::Unknown(_) => StatusCode::NOT_FOUND,
            PostflowError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!("⚠️ Admin action failed ({}): {}", e.kind(), e);
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn ok(action: &str, data: Value) -> ApiResult {
    Ok(Json(json!({"ok": true, "action": action, "data": data})).into_response())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::from(PostflowError::from(e)))
}

pub(crate) fn unauthorized(message: &str) -> Response {
    ApiError::new(StatusCode::UNAUTHORIZED, message).into_response()
}

/// Unauthenticated liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "ok": true,
        "service": "postflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    pub action: Option<String>,
    /// Window for `sync_statistics`: hour, day or week.
    pub range: Option<String>,
}

/// `GET /api/v1/admin?action=...`
pub async fn admin_get(State(state): State<Arc<AppState>>, Query(q): Query<AdminQuery>) -> ApiResult {
    let Some(action) = q.action.as_deref().filter(|a| !a.is_empty()) else {
        return overview(&state).await;
    };

    match action {
        "system_metrics" => {
            let metrics = match state.monitor.last_metrics().await {
                Some(m) => m,
                None => state.monitor.collect_now().await,
            };
            ok(action, to_json(&metrics)?)
        }
        "redis_cluster" => ok(action, to_json(&state.queues.cluster_info().await?)?),
        "redis_performance" => {
            let perf = state.queues.performance_counters().await?;
            let latency = state.queues.ping().await?;
            ok(
                action,
                json!({
                    "latency_ms": latency.as_secs_f64() * 1000.0,
                    "used_memory_mb": perf.used_memory_bytes as f64 / 1024.0 / 1024.0,
                    "peak_memory_mb": perf.peak_memory_bytes as f64 / 1024.0 / 1024.0,
                    "key_count": perf.key_count,
                    "hit_rate": perf.hit_rate,
                }),
            )
        }
        "queue_metrics" => {
            let per_queue = state.queues.get_all_queue_metrics().await?;
            let totals = QueueManager::totals(&per_queue);
            ok(action, json!({"queues": per_queue, "totals": totals}))
        }
        "scaling_status" => ok(action, to_json(&state.scaler.status().await)?),
        "scaling_metrics" => ok(action, to_json(&state.scaler.metrics().await)?),
        "health_check" => health_check(&state).await,
        "monitoring_status" => ok(action, to_json(&state.monitor.status().await)?),
        "sync_statistics" => {
            let range = match q.range.as_deref() {
                Some(r) => r.parse::<StatsRange>().map_err(PostflowError::Validation)?,
                None => StatsRange::Day,
            };
            ok(action, to_json(&state.sync.get_sync_statistics(range).await?)?)
        }
        other => Err(ApiError::unknown_action(other, &READ_ACTIONS)),
    }
}

/// Latest health; 503 while critical.
async fn health_check(state: &AppState) -> ApiResult {
    let metrics = match state.monitor.last_metrics().await {
        Some(m) => m,
        None => state.monitor.collect_now().await,
    };
    let health = &metrics.health;
    let status = if health.overall == OverallHealth::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "ok": status.is_success(),
        "action": "health_check",
        "data": {
            "overall": health.overall,
            "score": health.score,
            "issues": health.issues,
            "recommendations": health.recommendations,
            "checked_at": metrics.timestamp,
        },
    });
    Ok((status, Json(body)).into_response())
}

/// Combined view when no action is given. Sections fail independently.
async fn overview(state: &AppState) -> ApiResult {
    let queues = match state.queues.get_all_queue_metrics().await {
        Ok(per_queue) => json!({
            "totals": QueueManager::totals(&per_queue),
            "queues": per_queue,
        }),
        Err(e) => json!({"error": e.to_string()}),
    };
    let health = state.monitor.last_metrics().await.map(|m| m.health);
    let scaling = state.scaler.status().await;
    let monitoring = state.monitor.status().await;

    ok(
        "overview",
        json!({
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "backend": state.queues.backend_name(),
            "queues": queues,
            "health": health,
            "scaling": {
                "active": scaling.active,
                "current_workers": scaling.current_workers,
                "recent_actions": scaling.recent_actions,
            },
            "monitoring": {
                "active": monitoring.active,
                "last_collected_at": monitoring.last_collected_at,
                "recent_alerts": monitoring.recent_alerts,
            },
        }),
    )
}

fn required_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, ApiError> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PostflowError::Validation(format!("'{field}' is required")).into())
}

/// `POST /api/v1/admin` with `{"action": ..., ...}`.
pub async fn admin_post(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> ApiResult {
    let action = required_str(&body, "action")?;

    match action {
        "start_monitoring" => ok(action, json!({"started": state.monitor.start()})),
        "stop_monitoring" => ok(action, json!({"stopped": state.monitor.stop()})),
        "start_autoscaling" => ok(action, json!({"started": state.scaler.start()})),
        "stop_autoscaling" => ok(action, json!({"stopped": state.scaler.stop()})),
        "manual_scale" => {
            let queue = required_str(&body, "queueName")?;
            let target = body
                .get("targetWorkers")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| PostflowError::Validation("'targetWorkers' must be a positive integer".into()))?;
            let reason = body.get("reason").and_then(Value::as_str).unwrap_or("");
            let scaling = state.scaler.manual_scale(queue, target, reason).await?;
            ok(action, to_json(&scaling)?)
        }
        "update_scaling_config" => {
            let queue = required_str(&body, "queueName")?;
            let patch: ScalingConfigPatch = serde_json::from_value(body.clone())
                .map_err(|e| PostflowError::Validation(format!("invalid scaling config: {e}")))?;
            if patch.is_empty() {
                return Err(PostflowError::Validation("no scaling fields to update".into()).into());
            }
            let config = state.scaler.update_scaling_config(queue, &patch).await?;
            ok(action, json!({"queueName": queue, "config": config}))
        }
        "collect_metrics" => ok(action, to_json(&state.monitor.collect_now().await)?),
        "schedule_incremental_sync" => {
            ok(action, to_json(&state.sync.schedule_incremental_sync_for_all_accounts().await?)?)
        }
        "schedule_daily_sync" => {
            ok(action, to_json(&state.sync.schedule_daily_sync_for_all_accounts().await?)?)
        }
        other => Err(ApiError::unknown_action(other, &WRITE_ACTIONS)),
    }
}
