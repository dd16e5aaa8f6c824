//! 内存实现的告警与事件存储
//!
//! 用于测试以及不接数据库的单机运行，查询语义与 PostgreSQL 实现保持一致。

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AlertRepository, IncidentRepository};
use crate::error::{AppError, Result};
use crate::models::{
    AlertFilter, AlertSeverity, IncidentFilter, SecurityAlert, SecurityAlertType,
    SecurityIncident,
};

/// 内存告警存储
#[derive(Clone, Default)]
pub struct InMemoryAlertRepository {
    alerts: Arc<RwLock<HashMap<Uuid, SecurityAlert>>>,
    failing_types: Arc<RwLock<HashSet<SecurityAlertType>>>,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置告警（可携带任意 created_at）
    pub fn with_alerts(alerts: Vec<SecurityAlert>) -> Self {
        let map: HashMap<Uuid, SecurityAlert> = alerts.into_iter().map(|a| (a.id, a)).collect();
        Self {
            alerts: Arc::new(RwLock::new(map)),
            failing_types: Arc::default(),
        }
    }

    /// 指定类型的告警写入全部失败（用于验证单条告警失败不影响其他告警）
    pub async fn set_fail_inserts_for(&self, alert_type: SecurityAlertType, fail: bool) {
        let mut failing = self.failing_types.write().await;
        if fail {
            failing.insert(alert_type);
        } else {
            failing.remove(&alert_type);
        }
    }

    pub async fn snapshot(&self) -> Vec<SecurityAlert> {
        let mut alerts: Vec<SecurityAlert> = self.alerts.read().await.values().cloned().collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        alerts
    }

    pub async fn len(&self) -> usize {
        self.alerts.read().await.len()
    }
}

fn newest_first(alerts: &mut [SecurityAlert]) {
    alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn insert(&self, alert: &SecurityAlert) -> Result<()> {
        if self.failing_types.read().await.contains(&alert.alert_type) {
            return Err(AppError::timeout("alert store unavailable"));
        }

        let mut alerts = self.alerts.write().await;
        if alerts.contains_key(&alert.id) {
            return Err(AppError::internal_error(&format!(
                "alert {} already exists",
                alert.id
            )));
        }
        alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SecurityAlert>> {
        Ok(self.alerts.read().await.get(&id).cloned())
    }

    async fn find_latest_unresolved(
        &self,
        user_id: &str,
        alert_type: SecurityAlertType,
        severity: AlertSeverity,
    ) -> Result<Option<SecurityAlert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .values()
            .filter(|a| {
                !a.resolved
                    && a.user_id == user_id
                    && a.alert_type == alert_type
                    && a.severity == severity
            })
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn update_resolution(&self, alert: &SecurityAlert) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        if let Some(stored) = alerts.get_mut(&alert.id) {
            stored.resolved = alert.resolved;
            stored.resolved_by = alert.resolved_by.clone();
            stored.resolved_at = alert.resolved_at;
            stored.resolution_note = alert.resolution_note.clone();
            stored.false_positive = alert.false_positive;
            stored.updated_at = alert.updated_at;
        }
        Ok(())
    }

    async fn mark_notification_sent(&self, id: Uuid) -> Result<bool> {
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(&id) {
            Some(alert) => {
                alert.notification_sent = true;
                alert.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(
        &self,
        filter: &AlertFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityAlert>> {
        let alerts = self.alerts.read().await;
        let mut result: Vec<SecurityAlert> =
            alerts.values().filter(|a| filter.matches(a)).cloned().collect();
        newest_first(&mut result);

        Ok(result
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, filter: &AlertFilter) -> Result<i64> {
        let alerts = self.alerts.read().await;
        Ok(alerts.values().filter(|a| filter.matches(a)).count() as i64)
    }

    async fn count_by_type(&self) -> Result<Vec<(SecurityAlertType, i64)>> {
        let alerts = self.alerts.read().await;
        let mut counts: BTreeMap<SecurityAlertType, i64> = BTreeMap::new();
        for alert in alerts.values() {
            *counts.entry(alert.alert_type).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn count_by_severity(&self) -> Result<Vec<(AlertSeverity, i64)>> {
        let alerts = self.alerts.read().await;
        let mut counts: BTreeMap<AlertSeverity, i64> = BTreeMap::new();
        for alert in alerts.values() {
            *counts.entry(alert.severity).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<(NaiveDate, i64)>> {
        let alerts = self.alerts.read().await;
        let mut counts: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for alert in alerts.values().filter(|a| a.created_at >= since) {
            *counts.entry(alert.created_at.date_naive()).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

/// 内存事件存储
#[derive(Clone, Default)]
pub struct InMemoryIncidentRepository {
    incidents: Arc<RwLock<HashMap<Uuid, SecurityIncident>>>,
    fail_inserts: Arc<AtomicBool>,
}

impl InMemoryIncidentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开后所有 insert 都返回存储错误（用于验证事件创建失败时的降级路径）
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Vec<SecurityIncident> {
        let mut incidents: Vec<SecurityIncident> =
            self.incidents.read().await.values().cloned().collect();
        incidents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        incidents
    }

    pub async fn len(&self) -> usize {
        self.incidents.read().await.len()
    }
}

#[async_trait]
impl IncidentRepository for InMemoryIncidentRepository {
    async fn insert(&self, incident: &SecurityIncident) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(AppError::timeout("incident store unavailable"));
        }

        let mut incidents = self.incidents.write().await;
        if incidents.contains_key(&incident.id) {
            return Err(AppError::internal_error(&format!(
                "incident {} already exists",
                incident.id
            )));
        }
        incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SecurityIncident>> {
        Ok(self.incidents.read().await.get(&id).cloned())
    }

    async fn update(&self, incident: &SecurityIncident) -> Result<()> {
        let mut incidents = self.incidents.write().await;
        if let Some(stored) = incidents.get_mut(&incident.id) {
            *stored = incident.clone();
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: &IncidentFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityIncident>> {
        let incidents = self.incidents.read().await;
        let mut result: Vec<SecurityIncident> =
            incidents.values().filter(|i| filter.matches(i)).cloned().collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(result
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, filter: &IncidentFilter) -> Result<i64> {
        let incidents = self.incidents.read().await;
        Ok(incidents.values().filter(|i| filter.matches(i)).count() as i64)
    }
}
