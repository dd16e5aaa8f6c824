//! Security incident models
//! 事件聚合一个或多个告警，带有只追加的审计时间线

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::Json;
use uuid::Uuid;

/// 事件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "incident_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    /// 新建
    Open,
    /// 调查中
    Investigating,
    /// 已控制
    Contained,
    /// 已解决
    Resolved,
    /// 误报
    FalsePositive,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Investigating => "INVESTIGATING",
            IncidentStatus::Contained => "CONTAINED",
            IncidentStatus::Resolved => "RESOLVED",
            IncidentStatus::FalsePositive => "FALSE_POSITIVE",
        }
    }

    /// 终态会写入 resolved_at / resolved_by，回到非终态时清空
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::FalsePositive)
    }

    /// 仍需处理的状态
    pub fn active() -> Vec<IncidentStatus> {
        vec![
            IncidentStatus::Open,
            IncidentStatus::Investigating,
            IncidentStatus::Contained,
        ]
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "incident_severity", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// 时间线动作
pub mod timeline_action {
    pub const CREATED: &str = "incident.created";
    pub const STATUS_CHANGED: &str = "incident.status_changed";
    pub const ASSIGNED: &str = "incident.assigned";
    pub const ALERT_ATTACHED: &str = "incident.alert_attached";
    pub const NOTE_ADDED: &str = "incident.note_added";
}

/// 时间线条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub details: serde_json::Value,
}

/// 安全事件
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecurityIncident {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: IncidentStatus,
    pub severity: IncidentSeverity,
    /// 关联告警，只追加
    pub alert_ids: Vec<Uuid>,
    /// 审计时间线，只追加，不修改不重排
    pub timeline: Json<Vec<TimelineEntry>>,

    // 运营字段
    pub assigned_to: Option<String>,
    pub account_locked: bool,
    pub requires_2fa_reset: bool,
    pub metadata: Json<serde_json::Value>,

    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecurityIncident {
    /// 新事件总是从 OPEN 开始，时间线只有一条创建记录
    pub fn new(new_incident: NewSecurityIncident) -> Self {
        let now = Utc::now();
        let created = TimelineEntry {
            timestamp: now,
            action: timeline_action::CREATED.to_string(),
            actor: new_incident.created_by.clone(),
            details: json!({
                "to": IncidentStatus::Open,
                "alert_count": new_incident.alert_ids.len(),
            }),
        };

        Self {
            id: Uuid::new_v4(),
            user_id: new_incident.user_id,
            title: new_incident.title,
            description: new_incident.description,
            status: IncidentStatus::Open,
            severity: new_incident.severity,
            alert_ids: new_incident.alert_ids,
            timeline: Json(vec![created]),
            assigned_to: None,
            account_locked: new_incident.account_locked,
            requires_2fa_reset: new_incident.requires_2fa_reset,
            metadata: Json(new_incident.metadata),
            resolved_at: None,
            resolved_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn append(&mut self, action: &str, actor: &str, details: serde_json::Value) {
        let now = Utc::now();
        self.timeline.push(TimelineEntry {
            timestamp: now,
            action: action.to_string(),
            actor: actor.to_string(),
            details,
        });
        self.updated_at = now;
    }

    /// 状态变更与时间线记录在同一次修改中完成
    ///
    /// 不限制状态之间的迁移路径，任何状态都可以转到任何状态。
    pub fn transition(&mut self, to: IncidentStatus, actor: &str, note: Option<&str>) {
        let from = self.status;
        self.status = to;
        self.append(
            timeline_action::STATUS_CHANGED,
            actor,
            json!({ "from": from, "to": to, "note": note }),
        );

        if to.is_terminal() {
            self.resolved_at = Some(self.updated_at);
            self.resolved_by = Some(actor.to_string());
        } else {
            // 重新打开的事件不保留上一次的处置信息
            self.resolved_at = None;
            self.resolved_by = None;
        }
    }

    pub fn assign(&mut self, assignee: &str, actor: &str) {
        let previous = self.assigned_to.replace(assignee.to_string());
        self.append(
            timeline_action::ASSIGNED,
            actor,
            json!({ "from": previous, "to_assignee": assignee }),
        );
    }

    /// 追加关联告警，已关联的告警返回 false 且不写时间线
    pub fn attach_alert(&mut self, alert_id: Uuid, actor: &str) -> bool {
        if self.alert_ids.contains(&alert_id) {
            return false;
        }
        self.alert_ids.push(alert_id);
        self.append(
            timeline_action::ALERT_ATTACHED,
            actor,
            json!({ "alert_id": alert_id, "alert_count": self.alert_ids.len() }),
        );
        true
    }

    pub fn add_note(&mut self, actor: &str, note: &str) {
        self.append(timeline_action::NOTE_ADDED, actor, json!({ "note": note }));
    }

    /// 时间线中最近一次状态记录的目标状态
    pub fn last_recorded_status(&self) -> Option<IncidentStatus> {
        self.timeline
            .iter()
            .rev()
            .find_map(|entry| entry.details.get("to"))
            .and_then(|to| serde_json::from_value(to.clone()).ok())
    }
}

/// 创建事件的输入
#[derive(Debug, Clone)]
pub struct NewSecurityIncident {
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub alert_ids: Vec<Uuid>,
    pub severity: IncidentSeverity,
    pub metadata: serde_json::Value,
    pub account_locked: bool,
    pub requires_2fa_reset: bool,
    /// 创建者（自动响应为 "system"）
    pub created_by: String,
}

/// 更新事件状态请求
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct UpdateIncidentStatusRequest {
    pub status: IncidentStatus,
    #[validate(length(min = 1, max = 128))]
    pub actor: String,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

/// 分配事件请求
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct AssignIncidentRequest {
    #[validate(length(min = 1, max = 128))]
    pub assignee: String,
    #[validate(length(min = 1, max = 128))]
    pub actor: String,
}

/// 关联告警请求
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct AttachAlertRequest {
    pub alert_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub actor: String,
}

/// 添加备注请求
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct IncidentNoteRequest {
    #[validate(length(min = 1, max = 128))]
    pub actor: String,
    #[validate(length(min = 1, max = 2000))]
    pub note: String,
}

/// 事件查询过滤器
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub user_id: Option<String>,
    pub statuses: Option<Vec<IncidentStatus>>,
    pub severity: Option<IncidentSeverity>,
}

impl IncidentFilter {
    pub fn matches(&self, incident: &SecurityIncident) -> bool {
        if let Some(user_id) = &self.user_id {
            if &incident.user_id != user_id {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&incident.status) {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if incident.severity != severity {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident() -> SecurityIncident {
        SecurityIncident::new(NewSecurityIncident {
            user_id: "u1".to_string(),
            title: "Critical alert".to_string(),
            description: None,
            alert_ids: vec![Uuid::new_v4()],
            severity: IncidentSeverity::Critical,
            metadata: json!({}),
            account_locked: true,
            requires_2fa_reset: true,
            created_by: "system".to_string(),
        })
    }

    #[test]
    fn test_new_incident_starts_open_with_one_entry() {
        let incident = incident();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.timeline.len(), 1);
        assert_eq!(incident.timeline[0].action, timeline_action::CREATED);
        assert_eq!(incident.timeline[0].details["alert_count"], json!(1));
        assert_eq!(incident.last_recorded_status(), Some(IncidentStatus::Open));
    }

    #[test]
    fn test_transition_records_from_and_to() {
        let mut incident = incident();
        incident.transition(IncidentStatus::Investigating, "analyst", Some("looking"));

        let entry = incident.timeline.last().unwrap();
        assert_eq!(entry.details["from"], json!("OPEN"));
        assert_eq!(entry.details["to"], json!("INVESTIGATING"));
        assert_eq!(entry.details["note"], json!("looking"));
        assert!(incident.resolved_at.is_none());
    }

    #[test]
    fn test_terminal_transition_stamps_resolution() {
        let mut incident = incident();
        incident.transition(IncidentStatus::FalsePositive, "analyst", None);

        assert!(incident.resolved_at.is_some());
        assert_eq!(incident.resolved_by.as_deref(), Some("analyst"));
    }

    #[test]
    fn test_any_status_can_follow_any_status() {
        let mut incident = incident();
        incident.transition(IncidentStatus::Resolved, "a", None);
        incident.transition(IncidentStatus::Open, "a", Some("reopened"));
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.timeline.len(), 3);
    }

    #[test]
    fn test_attach_alert_is_append_only_and_idempotent() {
        let mut incident = incident();
        let alert_id = Uuid::new_v4();

        assert!(incident.attach_alert(alert_id, "analyst"));
        assert!(!incident.attach_alert(alert_id, "analyst"));
        assert_eq!(incident.alert_ids.len(), 2);
        assert_eq!(incident.alert_ids[1], alert_id);
        assert_eq!(incident.timeline.len(), 2);
    }

    #[test]
    fn test_last_recorded_status_ignores_notes() {
        let mut incident = incident();
        incident.transition(IncidentStatus::Contained, "a", None);
        incident.add_note("a", "account frozen");
        incident.assign("bob", "a");
        assert_eq!(incident.last_recorded_status(), Some(IncidentStatus::Contained));
    }

    #[test]
    fn test_is_terminal() {
        assert!(IncidentStatus::Resolved.is_terminal());
        assert!(IncidentStatus::FalsePositive.is_terminal());
        assert!(!IncidentStatus::Contained.is_terminal());
        assert_eq!(IncidentStatus::active().len(), 3);
    }
}
