//! 安全事件的 HTTP 处理器

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppError,
    middleware::AppState,
    models::{
        AssignIncidentRequest, AttachAlertRequest, IncidentFilter, IncidentNoteRequest,
        IncidentSeverity, IncidentStatus, SecurityIncident, UpdateIncidentStatusRequest,
    },
};

#[derive(Debug, Deserialize)]
pub struct IncidentQuery {
    pub user_id: Option<String>,
    pub status: Option<IncidentStatus>,
    /// 只看未进入终态的事件
    #[serde(default)]
    pub active: bool,
    pub severity: Option<IncidentSeverity>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl IncidentQuery {
    fn filter(&self) -> IncidentFilter {
        let statuses = match (self.status, self.active) {
            (Some(status), _) => Some(vec![status]),
            (None, true) => Some(IncidentStatus::active()),
            (None, false) => None,
        };
        IncidentFilter {
            user_id: self.user_id.clone(),
            statuses,
            severity: self.severity,
        }
    }
}

/// 查询事件
pub async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IncidentQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = query.filter();
    let incidents = state
        .alert_manager
        .list_incidents(&filter, query.limit, query.offset)
        .await?;
    let total = state.alert_manager.count_incidents(&filter).await?;

    Ok(Json(json!({
        "incidents": incidents,
        "count": incidents.len(),
        "total": total
    })))
}

/// 事件详情
pub async fn get_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SecurityIncident>, AppError> {
    let incident = state.alert_manager.get_incident(id).await?;
    Ok(Json(incident))
}

/// 更新事件状态
pub async fn update_incident_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateIncidentStatusRequest>,
) -> Result<Json<SecurityIncident>, AppError> {
    request.validate()?;

    let incident = state
        .alert_manager
        .update_incident_status(id, request.status, &request.actor, request.note.as_deref())
        .await?;
    Ok(Json(incident))
}

/// 分配事件
pub async fn assign_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignIncidentRequest>,
) -> Result<Json<SecurityIncident>, AppError> {
    request.validate()?;

    let incident = state
        .alert_manager
        .assign_incident(id, &request.assignee, &request.actor)
        .await?;
    Ok(Json(incident))
}

/// 关联告警
pub async fn attach_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<AttachAlertRequest>,
) -> Result<Json<SecurityIncident>, AppError> {
    request.validate()?;

    let incident = state
        .alert_manager
        .attach_alert(id, request.alert_id, &request.actor)
        .await?;
    Ok(Json(incident))
}

/// 添加备注
pub async fn add_incident_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<IncidentNoteRequest>,
) -> Result<Json<SecurityIncident>, AppError> {
    request.validate()?;

    let incident = state
        .alert_manager
        .add_incident_note(id, &request.actor, &request.note)
        .await?;
    Ok(Json(incident))
}
