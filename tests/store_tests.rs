//! 存储层测试
//!
//! 内存实现直接运行；Redis 和 PostgreSQL 实现需要外部服务，默认忽略

mod common;

use chrono::Utc;
use common::{create_test_config, new_alert};
use futures::future::join_all;
use secrecy::ExposeSecret;
use security_monitor::{
    db,
    models::{
        AlertFilter, AlertResolution, AlertSeverity, IncidentFilter, IncidentSeverity,
        IncidentStatus, NewSecurityIncident, SecurityAlert, SecurityAlertType, SecurityIncident,
    },
    repository::{AlertRepository, IncidentRepository, PgAlertRepository, PgIncidentRepository},
    store::{KeyValueStore, MemoryStore, RedisStore, SlidingWindowCounter},
};
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(60);

/// 并发写入同一个键，计数不丢失
async fn assert_concurrent_counts(store: Arc<dyn KeyValueStore>, key: &str) {
    let counter = SlidingWindowCounter::new(store);
    counter.reset(key).await.unwrap();

    let results = join_all((0..50).map(|_| counter.record_and_count(key, WINDOW))).await;
    let mut counts: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
    counts.sort_unstable();

    assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    assert_eq!(counter.count(key, WINDOW).await.unwrap(), 50);
}

#[tokio::test]
async fn test_memory_store_concurrent_counts() {
    assert_concurrent_counts(Arc::new(MemoryStore::new()), "failed_logins:concurrent").await;
}

#[tokio::test]
async fn test_memory_store_reset_by_pattern() {
    let store = Arc::new(MemoryStore::new());
    let counter = SlidingWindowCounter::new(store.clone());

    counter.record_and_count("api_requests:u1:k1", WINDOW).await.unwrap();
    counter.record_and_count("api_requests:u1:k2", WINDOW).await.unwrap();
    counter.record_and_count("api_requests:u2:k1", WINDOW).await.unwrap();

    assert_eq!(counter.reset("api_requests:u1:*").await.unwrap(), 2);
    assert_eq!(counter.count("api_requests:u2:k1", WINDOW).await.unwrap(), 1);
    assert_eq!(store.len(), 1);
}

// ==================== Redis ====================

async fn redis_store() -> RedisStore {
    let config = create_test_config();
    RedisStore::connect(config.redis.url.expose_secret(), config.redis.key_prefix.clone())
        .await
        .expect("Failed to connect to test Redis")
}

#[tokio::test]
#[ignore] // 需要 Redis
async fn test_redis_store_concurrent_counts() {
    assert_concurrent_counts(Arc::new(redis_store().await), "failed_logins:concurrent").await;
}

#[tokio::test]
#[ignore] // 需要 Redis
async fn test_redis_store_sets_and_values() {
    let store = redis_store().await;
    store.delete_matching("known_locations:redis-u1").await.unwrap();

    assert!(!store.set_contains("known_locations:redis-u1", "DE/Berlin").await.unwrap());
    store
        .set_insert("known_locations:redis-u1", "DE/Berlin", WINDOW)
        .await
        .unwrap();
    assert!(store.set_contains("known_locations:redis-u1", "DE/Berlin").await.unwrap());

    store.put("trade_avg:redis-u1:BTC", "12.5", WINDOW).await.unwrap();
    assert_eq!(
        store.get("trade_avg:redis-u1:BTC").await.unwrap().as_deref(),
        Some("12.5")
    );
    assert!(store.ping().await.is_ok());
}

#[tokio::test]
#[ignore] // 需要 Redis
async fn test_redis_delete_matching_spans_scan_batches() {
    let store = Arc::new(redis_store().await);
    let counter = SlidingWindowCounter::new(store.clone());
    counter.reset("api_requests:scan-u1:*").await.unwrap();
    counter.reset("api_requests:scan-u10:*").await.unwrap();

    join_all((0..1200).map(|i| {
        let key = format!("api_requests:scan-u1:k{}", i);
        let counter = &counter;
        async move { counter.record_and_count(&key, WINDOW).await }
    }))
    .await
    .into_iter()
    .for_each(|r| {
        r.unwrap();
    });
    counter
        .record_and_count("api_requests:scan-u10:k1", WINDOW)
        .await
        .unwrap();

    assert_eq!(counter.reset("api_requests:scan-u1:*").await.unwrap(), 1200);
    assert_eq!(
        counter.count("api_requests:scan-u10:k1", WINDOW).await.unwrap(),
        1
    );
}

// ==================== PostgreSQL ====================

async fn setup_test_db() -> PgPool {
    let config = create_test_config();
    let pool = db::create_pool(&config.database)
        .await
        .expect("Failed to create test database pool");

    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("TRUNCATE TABLE security_alerts, security_incidents")
        .execute(&pool)
        .await
        .expect("Failed to cleanup test database");

    pool
}

#[tokio::test]
#[ignore] // 需要数据库
#[serial]
async fn test_pg_alert_repository() {
    let repo = PgAlertRepository::new(setup_test_db().await);

    let mut alert = SecurityAlert::new(new_alert(
        "pg-u1",
        SecurityAlertType::FailedLogin,
        AlertSeverity::Critical,
    ));
    repo.insert(&alert).await.unwrap();

    let latest = repo
        .find_latest_unresolved("pg-u1", SecurityAlertType::FailedLogin, AlertSeverity::Critical)
        .await
        .unwrap()
        .expect("alert should exist");
    assert_eq!(latest.id, alert.id);
    assert_eq!(latest.details.0["source"], "test");

    alert.apply_resolution(&AlertResolution {
        resolved_by: "analyst".to_string(),
        note: None,
        false_positive: false,
    });
    repo.update_resolution(&alert).await.unwrap();
    assert!(repo
        .find_latest_unresolved("pg-u1", SecurityAlertType::FailedLogin, AlertSeverity::Critical)
        .await
        .unwrap()
        .is_none());

    assert!(repo.mark_notification_sent(alert.id).await.unwrap());
    assert!(!repo.mark_notification_sent(uuid::Uuid::new_v4()).await.unwrap());

    let filter = AlertFilter::for_user("pg-u1");
    assert_eq!(repo.count(&filter).await.unwrap(), 1);
    assert_eq!(repo.list(&filter, 10, 0).await.unwrap().len(), 1);
    assert_eq!(
        repo.count_by_severity().await.unwrap(),
        vec![(AlertSeverity::Critical, 1)]
    );

    let today = Utc::now().date_naive();
    let daily = repo
        .daily_counts(Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(daily, vec![(today, 1)]);
}

#[tokio::test]
#[ignore] // 需要数据库
#[serial]
async fn test_pg_incident_repository() {
    let repo = PgIncidentRepository::new(setup_test_db().await);

    let mut incident = SecurityIncident::new(NewSecurityIncident {
        user_id: "pg-u2".to_string(),
        title: "Critical security alert: FAILED_LOGIN".to_string(),
        description: None,
        alert_ids: vec![uuid::Uuid::new_v4()],
        severity: IncidentSeverity::Critical,
        metadata: serde_json::json!({ "auto_response": true }),
        account_locked: true,
        requires_2fa_reset: true,
        created_by: "system".to_string(),
    });
    repo.insert(&incident).await.unwrap();

    incident.transition(IncidentStatus::Investigating, "analyst", Some("triage"));
    repo.update(&incident).await.unwrap();

    let stored = repo.find_by_id(incident.id).await.unwrap().expect("incident");
    assert_eq!(stored.status, IncidentStatus::Investigating);
    assert_eq!(stored.timeline.0.len(), 2);
    assert_eq!(stored.alert_ids, incident.alert_ids);

    let active = IncidentFilter {
        statuses: Some(IncidentStatus::active()),
        ..IncidentFilter::default()
    };
    assert_eq!(repo.count(&active).await.unwrap(), 1);
    let resolved = IncidentFilter {
        statuses: Some(vec![IncidentStatus::Resolved]),
        ..IncidentFilter::default()
    };
    assert!(repo.list(&resolved, 10, 0).await.unwrap().is_empty());
}
