//! Database repository layer
//!
//! 告警与事件存储以 trait 形式注入服务层：生产环境使用 PostgreSQL 实现，
//! 测试和无数据库的单机部署使用内存实现。

pub mod alert_repo;
pub mod incident_repo;
pub mod memory;

pub use alert_repo::PgAlertRepository;
pub use incident_repo::PgIncidentRepository;
pub use memory::{InMemoryAlertRepository, InMemoryIncidentRepository};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    AlertFilter, AlertSeverity, IncidentFilter, SecurityAlert, SecurityAlertType,
    SecurityIncident,
};

/// 告警存储
#[async_trait]
pub trait AlertRepository: Send + Sync + 'static {
    async fn insert(&self, alert: &SecurityAlert) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SecurityAlert>>;

    /// 同一用户、类型、级别下最近一条未处理告警（去重查找）
    async fn find_latest_unresolved(
        &self,
        user_id: &str,
        alert_type: SecurityAlertType,
        severity: AlertSeverity,
    ) -> Result<Option<SecurityAlert>>;

    /// 只写入处理相关字段
    async fn update_resolution(&self, alert: &SecurityAlert) -> Result<()>;

    /// 返回 false 表示告警不存在
    async fn mark_notification_sent(&self, id: Uuid) -> Result<bool>;

    /// 按创建时间倒序
    async fn list(&self, filter: &AlertFilter, limit: i64, offset: i64)
        -> Result<Vec<SecurityAlert>>;

    async fn count(&self, filter: &AlertFilter) -> Result<i64>;

    async fn count_by_type(&self) -> Result<Vec<(SecurityAlertType, i64)>>;

    async fn count_by_severity(&self) -> Result<Vec<(AlertSeverity, i64)>>;

    /// `since` 之后每个 UTC 日期的告警数量，只返回有告警的日期
    async fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<(NaiveDate, i64)>>;
}

/// 事件存储
#[async_trait]
pub trait IncidentRepository: Send + Sync + 'static {
    async fn insert(&self, incident: &SecurityIncident) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SecurityIncident>>;

    /// 整条记录写回（同一记录单写者，冲突时后写覆盖）
    async fn update(&self, incident: &SecurityIncident) -> Result<()>;

    async fn list(
        &self,
        filter: &IncidentFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityIncident>>;

    async fn count(&self, filter: &IncidentFilter) -> Result<i64>;
}
