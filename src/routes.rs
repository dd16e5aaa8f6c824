//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::{handlers, middleware::AppState};

/// 请求体上限
const MAX_BODY_BYTES: usize = 64 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 入站事件（由网关和业务服务调用）
    let ingest_routes = Router::new()
        .route("/api/v1/events/login", post(handlers::monitor::ingest_login))
        .route("/api/v1/events/trade", post(handlers::monitor::ingest_trade))
        .route(
            "/api/v1/events/wallet-change",
            post(handlers::monitor::ingest_wallet_change),
        )
        .route(
            "/api/v1/events/api-request",
            post(handlers::monitor::ingest_api_request),
        )
        .route("/api/v1/activity/report", post(handlers::monitor::report_activity));

    // 管理端
    let admin_routes = Router::new()
        .route("/api/v1/dashboard", get(handlers::alert::get_dashboard))

        // 告警
        .route("/api/v1/alerts", get(handlers::alert::list_alerts))
        .route("/api/v1/alerts/{id}", get(handlers::alert::get_alert))
        .route("/api/v1/alerts/{id}/resolve", post(handlers::alert::resolve_alert))
        .route(
            "/api/v1/alerts/{id}/notification-sent",
            post(handlers::alert::mark_notification_sent),
        )

        // 事件
        .route("/api/v1/incidents", get(handlers::incident::list_incidents))
        .route("/api/v1/incidents/{id}", get(handlers::incident::get_incident))
        .route(
            "/api/v1/incidents/{id}/status",
            put(handlers::incident::update_incident_status),
        )
        .route(
            "/api/v1/incidents/{id}/assign",
            put(handlers::incident::assign_incident),
        )
        .route(
            "/api/v1/incidents/{id}/alerts",
            post(handlers::incident::attach_alert),
        )
        .route(
            "/api/v1/incidents/{id}/notes",
            post(handlers::incident::add_incident_note),
        )

        // 用户级操作
        .route(
            "/api/v1/users/{user_id}/alerts",
            get(handlers::monitor::user_alert_history),
        )
        .route(
            "/api/v1/users/{user_id}/reset-counters",
            post(handlers::monitor::reset_user_counters),
        )
        .route(
            "/api/v1/users/{user_id}/recheck",
            post(handlers::monitor::recheck_user),
        );

    let protected_routes = Router::new()
        .merge(ingest_routes)
        .merge(admin_routes)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::admin_auth_middleware,
        ));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
