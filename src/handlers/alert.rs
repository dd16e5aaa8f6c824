//! 告警管理与仪表盘的 HTTP 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::AppError,
    middleware::AppState,
    models::{AlertFilter, AlertResolution, AlertSeverity, DashboardStats, SecurityAlert, SecurityAlertType},
};

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub user_id: Option<String>,
    pub alert_type: Option<SecurityAlertType>,
    pub severity: Option<AlertSeverity>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// 查询告警
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = AlertFilter {
        user_id: query.user_id,
        alert_type: query.alert_type,
        severity: query.severity,
        resolved: query.resolved,
        since: query.since,
    };

    let alerts = state
        .alert_manager
        .list_alerts(&filter, query.limit, query.offset)
        .await?;
    let total = state.alert_manager.count_alerts(&filter).await?;

    Ok(Json(json!({
        "alerts": alerts,
        "count": alerts.len(),
        "total": total
    })))
}

/// 告警详情
pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SecurityAlert>, AppError> {
    let alert = state.alert_manager.get_alert(id).await?;
    Ok(Json(alert))
}

/// 处理告警
pub async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(resolution): Json<AlertResolution>,
) -> Result<Json<SecurityAlert>, AppError> {
    let alert = state.alert_manager.resolve_alert(id, resolution).await?;
    Ok(Json(alert))
}

/// 通知送达确认
pub async fn mark_notification_sent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.alert_manager.mark_notification_sent(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 安全仪表盘
pub async fn get_dashboard(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardStats>, AppError> {
    let stats = state.alert_manager.get_dashboard_stats().await?;
    Ok(Json(stats))
}
