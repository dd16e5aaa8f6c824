//! Alert repository (告警数据访问)

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::AlertRepository;
use crate::error::Result;
use crate::models::{AlertFilter, AlertSeverity, SecurityAlert, SecurityAlertType};

pub struct PgAlertRepository {
    db: PgPool,
}

impl PgAlertRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 根据过滤器拼接 WHERE 条件，返回 SQL 片段和下一个参数序号
fn filter_clause(filter: &AlertFilter) -> (String, usize) {
    let mut clause = String::from(" WHERE 1=1");
    let mut index = 0;

    if filter.user_id.is_some() {
        index += 1;
        clause.push_str(&format!(" AND user_id = ${}", index));
    }
    if filter.alert_type.is_some() {
        index += 1;
        clause.push_str(&format!(" AND alert_type = ${}", index));
    }
    if filter.severity.is_some() {
        index += 1;
        clause.push_str(&format!(" AND severity = ${}", index));
    }
    if filter.resolved.is_some() {
        index += 1;
        clause.push_str(&format!(" AND resolved = ${}", index));
    }
    if filter.since.is_some() {
        index += 1;
        clause.push_str(&format!(" AND created_at >= ${}", index));
    }

    (clause, index)
}

#[async_trait]
impl AlertRepository for PgAlertRepository {
    async fn insert(&self, alert: &SecurityAlert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_alerts (
                id, user_id, alert_type, severity, details, resolved, resolved_by,
                resolved_at, resolution_note, false_positive, notification_sent,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.user_id)
        .bind(alert.alert_type)
        .bind(alert.severity)
        .bind(&alert.details)
        .bind(alert.resolved)
        .bind(&alert.resolved_by)
        .bind(alert.resolved_at)
        .bind(&alert.resolution_note)
        .bind(alert.false_positive)
        .bind(alert.notification_sent)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SecurityAlert>> {
        let alert = sqlx::query_as::<_, SecurityAlert>("SELECT * FROM security_alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(alert)
    }

    async fn find_latest_unresolved(
        &self,
        user_id: &str,
        alert_type: SecurityAlertType,
        severity: AlertSeverity,
    ) -> Result<Option<SecurityAlert>> {
        let alert = sqlx::query_as::<_, SecurityAlert>(
            r#"
            SELECT * FROM security_alerts
            WHERE user_id = $1 AND alert_type = $2 AND severity = $3 AND resolved = FALSE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(alert_type)
        .bind(severity)
        .fetch_optional(&self.db)
        .await?;

        Ok(alert)
    }

    async fn update_resolution(&self, alert: &SecurityAlert) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE security_alerts
            SET resolved = $2, resolved_by = $3, resolved_at = $4, resolution_note = $5,
                false_positive = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(alert.id)
        .bind(alert.resolved)
        .bind(&alert.resolved_by)
        .bind(alert.resolved_at)
        .bind(&alert.resolution_note)
        .bind(alert.false_positive)
        .bind(alert.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn mark_notification_sent(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE security_alerts SET notification_sent = TRUE, updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        filter: &AlertFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityAlert>> {
        let (clause, index) = filter_clause(filter);
        let query = format!(
            "SELECT * FROM security_alerts{} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            clause,
            index + 1,
            index + 2
        );

        let mut query_builder = sqlx::query_as::<_, SecurityAlert>(&query);

        if let Some(user_id) = &filter.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(alert_type) = filter.alert_type {
            query_builder = query_builder.bind(alert_type);
        }
        if let Some(severity) = filter.severity {
            query_builder = query_builder.bind(severity);
        }
        if let Some(resolved) = filter.resolved {
            query_builder = query_builder.bind(resolved);
        }
        if let Some(since) = filter.since {
            query_builder = query_builder.bind(since);
        }

        let alerts = query_builder
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(alerts)
    }

    async fn count(&self, filter: &AlertFilter) -> Result<i64> {
        let (clause, _) = filter_clause(filter);
        let query = format!("SELECT COUNT(*) FROM security_alerts{}", clause);

        let mut query_builder = sqlx::query(&query);

        if let Some(user_id) = &filter.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(alert_type) = filter.alert_type {
            query_builder = query_builder.bind(alert_type);
        }
        if let Some(severity) = filter.severity {
            query_builder = query_builder.bind(severity);
        }
        if let Some(resolved) = filter.resolved {
            query_builder = query_builder.bind(resolved);
        }
        if let Some(since) = filter.since {
            query_builder = query_builder.bind(since);
        }

        let count: i64 = query_builder.fetch_one(&self.db).await?.get(0);
        Ok(count)
    }

    async fn count_by_type(&self) -> Result<Vec<(SecurityAlertType, i64)>> {
        let rows = sqlx::query_as::<_, (SecurityAlertType, i64)>(
            "SELECT alert_type, COUNT(*) FROM security_alerts GROUP BY alert_type",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn count_by_severity(&self) -> Result<Vec<(AlertSeverity, i64)>> {
        let rows = sqlx::query_as::<_, (AlertSeverity, i64)>(
            "SELECT severity, COUNT(*) FROM security_alerts GROUP BY severity",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<(NaiveDate, i64)>> {
        let rows = sqlx::query_as::<_, (NaiveDate, i64)>(
            r#"
            SELECT (created_at AT TIME ZONE 'UTC')::date AS day, COUNT(*)
            FROM security_alerts
            WHERE created_at >= $1
            GROUP BY day
            ORDER BY day
            "#,
        )
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }
}
