//! 入站事件与用户级管理操作的 HTTP 处理器
//! 只做协议适配，检测逻辑全部在 SecurityMonitor 中

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    error::AppError,
    middleware::AppState,
    models::{ActivityReport, ApiRequestEvent, LoginEvent, TradeEvent, WalletChangeEvent},
    services::AlertCreation,
};

/// 告警创建结果的响应形式
pub(crate) fn creation_json(creation: &AlertCreation) -> Value {
    json!({
        "alert": creation.alert(),
        "deduplicated": !creation.is_new(),
    })
}

fn alerts_json(creations: &[AlertCreation]) -> Value {
    let alerts: Vec<Value> = creations.iter().map(creation_json).collect();
    json!({
        "count": alerts.len(),
        "alerts": alerts,
    })
}

/// 登录事件
pub async fn ingest_login(
    State(state): State<Arc<AppState>>,
    Json(event): Json<LoginEvent>,
) -> Result<Json<Value>, AppError> {
    let creations = state.monitor.monitor_login(&event).await?;
    Ok(Json(alerts_json(&creations)))
}

/// 成交事件
pub async fn ingest_trade(
    State(state): State<Arc<AppState>>,
    Json(event): Json<TradeEvent>,
) -> Result<Json<Value>, AppError> {
    let creations = state.monitor.monitor_trade(&event).await?;
    Ok(Json(alerts_json(&creations)))
}

/// 提现地址变更事件
pub async fn ingest_wallet_change(
    State(state): State<Arc<AppState>>,
    Json(event): Json<WalletChangeEvent>,
) -> Result<Json<Value>, AppError> {
    let creations = state.monitor.monitor_wallet_change(&event).await?;
    Ok(Json(alerts_json(&creations)))
}

/// API 请求事件
pub async fn ingest_api_request(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ApiRequestEvent>,
) -> Result<Json<Value>, AppError> {
    let creations = state.monitor.monitor_api_request(&event).await?;
    Ok(Json(alerts_json(&creations)))
}

/// 人工/外部系统上报
pub async fn report_activity(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ActivityReport>,
) -> Result<Json<Value>, AppError> {
    let creation = state.monitor.report_activity(report).await?;
    Ok(Json(creation_json(&creation)))
}

/// 清除用户计数器（误报恢复）
pub async fn reset_user_counters(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let deleted = state.monitor.reset_user_counters(&user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "deleted_keys": deleted,
    })))
}

/// 立即复查用户
pub async fn recheck_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let creations = state.monitor.recheck_user(&user_id).await?;
    Ok(Json(alerts_json(&creations)))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

/// 用户告警历史
pub async fn user_alert_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let alerts = state
        .alert_manager
        .user_alert_history(&user_id, query.limit)
        .await?;

    Ok(Json(json!({
        "user_id": user_id,
        "count": alerts.len(),
        "alerts": alerts,
    })))
}
