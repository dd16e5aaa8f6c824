//! Alert manager
//! 告警去重与持久化、事件生命周期与时间线、仪表盘统计

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::config::AlertConfig;
use crate::error::{AppError, Result};
use crate::models::*;
use crate::repository::{AlertRepository, IncidentRepository};

/// 单次列表查询的上限
const MAX_PAGE_SIZE: i64 = 500;

/// 创建告警的结果
#[derive(Debug, Clone)]
pub enum AlertCreation {
    /// 新建的告警
    Created(SecurityAlert),
    /// 去重窗口内已有相同的未处理告警，原样返回
    Deduplicated(SecurityAlert),
}

impl AlertCreation {
    pub fn alert(&self) -> &SecurityAlert {
        match self {
            AlertCreation::Created(alert) | AlertCreation::Deduplicated(alert) => alert,
        }
    }

    pub fn into_alert(self) -> SecurityAlert {
        match self {
            AlertCreation::Created(alert) | AlertCreation::Deduplicated(alert) => alert,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, AlertCreation::Created(_))
    }
}

/// 告警管理服务
pub struct AlertManager {
    alerts: Arc<dyn AlertRepository>,
    incidents: Arc<dyn IncidentRepository>,
    config: AlertConfig,
}

impl AlertManager {
    pub fn new(
        alerts: Arc<dyn AlertRepository>,
        incidents: Arc<dyn IncidentRepository>,
        config: AlertConfig,
    ) -> Self {
        Self {
            alerts,
            incidents,
            config,
        }
    }

    // ==================== 告警 ====================

    /// 创建告警（带去重）
    ///
    /// 去重是"先查后写"，并发的相同告警可能都被创建。
    #[instrument(skip(self, new_alert), fields(user_id = %new_alert.user_id, alert_type = %new_alert.alert_type))]
    pub async fn create_alert(&self, new_alert: NewSecurityAlert) -> Result<AlertCreation> {
        if new_alert.user_id.trim().is_empty() {
            return Err(AppError::validation("user_id is required"));
        }

        let existing = self
            .alerts
            .find_latest_unresolved(&new_alert.user_id, new_alert.alert_type, new_alert.severity)
            .await?;

        if let Some(existing) = existing {
            if Utc::now() - existing.created_at < self.config.dedup_window() {
                metrics::counter!("security_alerts_deduplicated_total").increment(1);
                info!(alert_id = %existing.id, "Alert deduplicated");
                return Ok(AlertCreation::Deduplicated(existing));
            }
        }

        let alert = SecurityAlert::new(new_alert);
        self.alerts.insert(&alert).await?;

        metrics::counter!(
            "security_alerts_created_total",
            "type" => alert.alert_type.as_str(),
            "severity" => alert.severity.as_str()
        )
        .increment(1);
        info!(alert_id = %alert.id, severity = %alert.severity, "Security alert created");

        Ok(AlertCreation::Created(alert))
    }

    /// 处理告警；已处理的告警再次处理会覆盖处理字段
    #[instrument(skip(self, resolution))]
    pub async fn resolve_alert(&self, id: Uuid, resolution: AlertResolution) -> Result<SecurityAlert> {
        resolution.validate()?;

        let mut alert = self.get_alert(id).await?;
        alert.apply_resolution(&resolution);
        self.alerts.update_resolution(&alert).await?;

        info!(
            alert_id = %id,
            resolved_by = %resolution.resolved_by,
            false_positive = resolution.false_positive,
            "Alert resolved"
        );
        Ok(alert)
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<SecurityAlert> {
        self.alerts
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("Alert {} not found", id)))
    }

    pub async fn list_alerts(
        &self,
        filter: &AlertFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityAlert>> {
        self.alerts
            .list(filter, limit.clamp(1, MAX_PAGE_SIZE), offset.max(0))
            .await
    }

    pub async fn count_alerts(&self, filter: &AlertFilter) -> Result<i64> {
        self.alerts.count(filter).await
    }

    /// 用户告警历史（最新在前）
    pub async fn user_alert_history(&self, user_id: &str, limit: i64) -> Result<Vec<SecurityAlert>> {
        self.list_alerts(&AlertFilter::for_user(user_id), limit, 0).await
    }

    /// 通知协作方确认已送达
    #[instrument(skip(self))]
    pub async fn mark_notification_sent(&self, id: Uuid) -> Result<()> {
        if !self.alerts.mark_notification_sent(id).await? {
            return Err(AppError::not_found(&format!("Alert {} not found", id)));
        }
        Ok(())
    }

    // ==================== 事件 ====================

    /// 创建事件，初始状态总是 OPEN
    #[instrument(skip(self, new_incident), fields(user_id = %new_incident.user_id))]
    pub async fn create_incident(&self, new_incident: NewSecurityIncident) -> Result<SecurityIncident> {
        let incident = SecurityIncident::new(new_incident);
        self.incidents.insert(&incident).await?;

        metrics::counter!("security_incidents_created_total").increment(1);
        info!(
            incident_id = %incident.id,
            severity = ?incident.severity,
            alert_count = incident.alert_ids.len(),
            "Security incident created"
        );
        Ok(incident)
    }

    pub async fn get_incident(&self, id: Uuid) -> Result<SecurityIncident> {
        self.incidents
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("Incident {} not found", id)))
    }

    pub async fn list_incidents(
        &self,
        filter: &IncidentFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityIncident>> {
        self.incidents
            .list(filter, limit.clamp(1, MAX_PAGE_SIZE), offset.max(0))
            .await
    }

    pub async fn count_incidents(&self, filter: &IncidentFilter) -> Result<i64> {
        self.incidents.count(filter).await
    }

    /// 更新事件状态；不限制迁移路径
    #[instrument(skip(self, note))]
    pub async fn update_incident_status(
        &self,
        id: Uuid,
        status: IncidentStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<SecurityIncident> {
        let mut incident = self.get_incident(id).await?;
        let from = incident.status;
        incident.transition(status, actor, note);
        self.incidents.update(&incident).await?;

        info!(incident_id = %id, from = %from, to = %status, actor, "Incident status updated");
        Ok(incident)
    }

    #[instrument(skip(self))]
    pub async fn assign_incident(
        &self,
        id: Uuid,
        assignee: &str,
        actor: &str,
    ) -> Result<SecurityIncident> {
        let mut incident = self.get_incident(id).await?;
        incident.assign(assignee, actor);
        self.incidents.update(&incident).await?;

        info!(incident_id = %id, assignee, "Incident assigned");
        Ok(incident)
    }

    /// 关联告警；告警必须存在，已关联的告警不重复记录
    #[instrument(skip(self))]
    pub async fn attach_alert(
        &self,
        id: Uuid,
        alert_id: Uuid,
        actor: &str,
    ) -> Result<SecurityIncident> {
        let mut incident = self.get_incident(id).await?;
        self.get_alert(alert_id).await?;

        if incident.attach_alert(alert_id, actor) {
            self.incidents.update(&incident).await?;
            info!(incident_id = %id, alert_id = %alert_id, "Alert attached to incident");
        }
        Ok(incident)
    }

    #[instrument(skip(self, note))]
    pub async fn add_incident_note(
        &self,
        id: Uuid,
        actor: &str,
        note: &str,
    ) -> Result<SecurityIncident> {
        if note.trim().is_empty() {
            return Err(AppError::validation("note must not be empty"));
        }

        let mut incident = self.get_incident(id).await?;
        incident.add_note(actor, note);
        self.incidents.update(&incident).await?;
        Ok(incident)
    }

    // ==================== 仪表盘 ====================

    /// 仪表盘统计，只读
    #[instrument(skip(self))]
    pub async fn get_dashboard_stats(&self) -> Result<DashboardStats> {
        let today = Utc::now().date_naive();
        let days = self.config.trend_days.max(1);
        let trend_start = today - Duration::days(i64::from(days) - 1);
        let since = trend_start
            .and_hms_opt(0, 0, 0)
            .map(|midnight| Utc.from_utc_datetime(&midnight))
            .ok_or_else(|| AppError::internal_error("Invalid trend start date"))?;

        let critical_filter = AlertFilter {
            severity: Some(AlertSeverity::Critical),
            resolved: Some(false),
            ..AlertFilter::default()
        };
        let open_filter = IncidentFilter {
            statuses: Some(IncidentStatus::active()),
            ..IncidentFilter::default()
        };
        let all = AlertFilter::default();
        let unresolved = AlertFilter::unresolved();

        let (
            total_alerts,
            unresolved_alerts,
            critical_alerts,
            open_incidents,
            by_type,
            by_severity,
            recent_alerts,
            daily,
        ) = tokio::try_join!(
            self.alerts.count(&all),
            self.alerts.count(&unresolved),
            self.alerts.count(&critical_filter),
            self.incidents.count(&open_filter),
            self.alerts.count_by_type(),
            self.alerts.count_by_severity(),
            self.alerts.list(
                &unresolved,
                self.config.dashboard_recent_limit,
                0
            ),
            self.alerts.daily_counts(since),
        )?;

        let mut alerts_by_type: BTreeMap<SecurityAlertType, i64> =
            SecurityAlertType::ALL.iter().map(|t| (*t, 0)).collect();
        alerts_by_type.extend(by_type);

        let mut alerts_by_severity: BTreeMap<AlertSeverity, i64> =
            AlertSeverity::ALL.iter().map(|s| (*s, 0)).collect();
        alerts_by_severity.extend(by_severity);

        Ok(DashboardStats {
            total_alerts,
            unresolved_alerts,
            critical_alerts,
            open_incidents,
            alerts_by_type,
            alerts_by_severity,
            recent_alerts,
            daily_trend: fill_daily_trend(daily, today, days),
        })
    }
}

/// 补齐最近 `days` 天（含 `today`）的每日数量，无数据的日期记 0
fn fill_daily_trend(
    counts: Vec<(NaiveDate, i64)>,
    today: NaiveDate,
    days: u32,
) -> Vec<DailyAlertCount> {
    let counts: HashMap<NaiveDate, i64> = counts.into_iter().collect();

    (0..i64::from(days))
        .rev()
        .map(|offset| {
            let date = today - Duration::days(offset);
            DailyAlertCount {
                date,
                count: counts.get(&date).copied().unwrap_or(0),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryAlertRepository, InMemoryIncidentRepository};
    use serde_json::json;

    fn manager_with(alerts: InMemoryAlertRepository) -> AlertManager {
        AlertManager::new(
            Arc::new(alerts),
            Arc::new(InMemoryIncidentRepository::new()),
            AlertConfig::default(),
        )
    }

    fn new_alert(severity: AlertSeverity) -> NewSecurityAlert {
        NewSecurityAlert {
            user_id: "u1".to_string(),
            alert_type: SecurityAlertType::FailedLogin,
            severity,
            details: json!({ "failed_attempts": 3 }),
        }
    }

    #[test]
    fn test_fill_daily_trend_zero_fills() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let counts = vec![
            (NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), 2),
            (today, 5),
        ];

        let trend = fill_daily_trend(counts, today, 7);
        assert_eq!(trend.len(), 7);
        assert_eq!(trend[0].date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(trend[0].count, 2);
        assert_eq!(trend[3].count, 0);
        assert_eq!(trend[6].date, today);
        assert_eq!(trend[6].count, 5);
    }

    #[tokio::test]
    async fn test_create_alert_dedup_within_window() {
        let manager = manager_with(InMemoryAlertRepository::new());

        let first = manager.create_alert(new_alert(AlertSeverity::Warning)).await.unwrap();
        let second = manager.create_alert(new_alert(AlertSeverity::Warning)).await.unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.alert().id, second.alert().id);
    }

    #[tokio::test]
    async fn test_create_alert_after_window_is_new() {
        let mut old = SecurityAlert::new(new_alert(AlertSeverity::Warning));
        old.created_at = Utc::now() - Duration::minutes(6);
        let old_id = old.id;
        let manager = manager_with(InMemoryAlertRepository::with_alerts(vec![old]));

        let created = manager.create_alert(new_alert(AlertSeverity::Warning)).await.unwrap();
        assert!(created.is_new());
        assert_ne!(created.alert().id, old_id);
    }

    #[tokio::test]
    async fn test_dedup_distinguishes_severity() {
        let manager = manager_with(InMemoryAlertRepository::new());

        let warning = manager.create_alert(new_alert(AlertSeverity::Warning)).await.unwrap();
        let critical = manager.create_alert(new_alert(AlertSeverity::Critical)).await.unwrap();
        assert!(critical.is_new());
        assert_ne!(warning.alert().id, critical.alert().id);
    }

    #[tokio::test]
    async fn test_resolved_alert_does_not_dedup() {
        let manager = manager_with(InMemoryAlertRepository::new());
        let first = manager.create_alert(new_alert(AlertSeverity::Warning)).await.unwrap();

        manager
            .resolve_alert(
                first.alert().id,
                AlertResolution {
                    resolved_by: "analyst".to_string(),
                    note: None,
                    false_positive: false,
                },
            )
            .await
            .unwrap();

        let second = manager.create_alert(new_alert(AlertSeverity::Warning)).await.unwrap();
        assert!(second.is_new());
    }

    #[tokio::test]
    async fn test_create_alert_rejects_blank_user() {
        let manager = manager_with(InMemoryAlertRepository::new());
        let alert = NewSecurityAlert {
            user_id: "  ".to_string(),
            ..new_alert(AlertSeverity::Info)
        };
        let err = manager.create_alert(alert).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_mark_notification_sent() {
        let manager = manager_with(InMemoryAlertRepository::new());
        let created = manager.create_alert(new_alert(AlertSeverity::Info)).await.unwrap();

        manager.mark_notification_sent(created.alert().id).await.unwrap();
        let alert = manager.get_alert(created.alert().id).await.unwrap();
        assert!(alert.notification_sent);

        let err = manager.mark_notification_sent(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
