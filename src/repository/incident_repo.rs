//! Incident repository (安全事件数据访问)

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::IncidentRepository;
use crate::error::Result;
use crate::models::{IncidentFilter, SecurityIncident};

pub struct PgIncidentRepository {
    db: PgPool,
}

impl PgIncidentRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn filter_clause(filter: &IncidentFilter) -> (String, usize) {
    let mut clause = String::from(" WHERE 1=1");
    let mut index = 0;

    if filter.user_id.is_some() {
        index += 1;
        clause.push_str(&format!(" AND user_id = ${}", index));
    }
    if filter.statuses.is_some() {
        index += 1;
        clause.push_str(&format!(" AND status = ANY(${})", index));
    }
    if filter.severity.is_some() {
        index += 1;
        clause.push_str(&format!(" AND severity = ${}", index));
    }

    (clause, index)
}

#[async_trait]
impl IncidentRepository for PgIncidentRepository {
    async fn insert(&self, incident: &SecurityIncident) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_incidents (
                id, user_id, title, description, status, severity, alert_ids, timeline,
                assigned_to, account_locked, requires_2fa_reset, metadata,
                resolved_at, resolved_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(incident.id)
        .bind(&incident.user_id)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(incident.status)
        .bind(incident.severity)
        .bind(&incident.alert_ids)
        .bind(&incident.timeline)
        .bind(&incident.assigned_to)
        .bind(incident.account_locked)
        .bind(incident.requires_2fa_reset)
        .bind(&incident.metadata)
        .bind(incident.resolved_at)
        .bind(&incident.resolved_by)
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SecurityIncident>> {
        let incident =
            sqlx::query_as::<_, SecurityIncident>("SELECT * FROM security_incidents WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

        Ok(incident)
    }

    async fn update(&self, incident: &SecurityIncident) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE security_incidents
            SET status = $2, severity = $3, alert_ids = $4, timeline = $5, assigned_to = $6,
                account_locked = $7, requires_2fa_reset = $8, metadata = $9,
                resolved_at = $10, resolved_by = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(incident.id)
        .bind(incident.status)
        .bind(incident.severity)
        .bind(&incident.alert_ids)
        .bind(&incident.timeline)
        .bind(&incident.assigned_to)
        .bind(incident.account_locked)
        .bind(incident.requires_2fa_reset)
        .bind(&incident.metadata)
        .bind(incident.resolved_at)
        .bind(&incident.resolved_by)
        .bind(incident.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list(
        &self,
        filter: &IncidentFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SecurityIncident>> {
        let (clause, index) = filter_clause(filter);
        let query = format!(
            "SELECT * FROM security_incidents{} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            clause,
            index + 1,
            index + 2
        );

        let mut query_builder = sqlx::query_as::<_, SecurityIncident>(&query);

        if let Some(user_id) = &filter.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(statuses) = &filter.statuses {
            query_builder = query_builder.bind(statuses);
        }
        if let Some(severity) = filter.severity {
            query_builder = query_builder.bind(severity);
        }

        let incidents = query_builder
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(incidents)
    }

    async fn count(&self, filter: &IncidentFilter) -> Result<i64> {
        let (clause, _) = filter_clause(filter);
        let query = format!("SELECT COUNT(*) FROM security_incidents{}", clause);

        let mut query_builder = sqlx::query(&query);

        if let Some(user_id) = &filter.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(statuses) = &filter.statuses {
            query_builder = query_builder.bind(statuses);
        }
        if let Some(severity) = filter.severity {
            query_builder = query_builder.bind(severity);
        }

        let count: i64 = query_builder.fetch_one(&self.db).await?.get(0);
        Ok(count)
    }
}
