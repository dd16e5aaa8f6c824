//! HTTP 中间件
//! 请求追踪、管理端 API Key 鉴权

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::AppError;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: crate::config::AppConfig,
    pub db: sqlx::PgPool,
    pub store: Arc<dyn crate::store::KeyValueStore>,
    pub alert_manager: Arc<crate::services::AlertManager>,
    pub monitor: Arc<crate::services::SecurityMonitor>,
    pub event_bus: Arc<crate::realtime::EventBus>,
}

impl AppState {
    /// 按依赖顺序组装服务：存储 → 检测器 → 告警管理 → 监控器
    pub fn new(
        config: crate::config::AppConfig,
        db: sqlx::PgPool,
        store: Arc<dyn crate::store::KeyValueStore>,
        alert_repo: Arc<dyn crate::repository::AlertRepository>,
        incident_repo: Arc<dyn crate::repository::IncidentRepository>,
        event_bus: Arc<crate::realtime::EventBus>,
    ) -> Self {
        let detector = Arc::new(crate::services::AnomalyDetector::new(
            store.clone(),
            config.detection.clone(),
        ));
        let alert_manager = Arc::new(crate::services::AlertManager::new(
            alert_repo,
            incident_repo,
            config.alerts.clone(),
        ));
        let monitor = Arc::new(crate::services::SecurityMonitor::new(
            detector,
            alert_manager.clone(),
            event_bus.clone(),
        ));

        Self {
            config,
            db,
            store,
            alert_manager,
            monitor,
            event_bus,
        }
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().to_string();
    let uri = req.uri().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        // 指标标签只使用静态字符串
        let status = response.status().as_u16();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "UNKNOWN",
        };
        let status_code = match status {
            200 => "200",
            201 => "201",
            204 => "204",
            400 => "400",
            401 => "401",
            404 => "404",
            408 => "408",
            500 => "500",
            _ => "other",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_code)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 从 `x-api-key` 或 `Authorization: Bearer` 读取 API Key
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }

    let authorization = headers.get("authorization")?.to_str().ok()?;
    if authorization.len() > 7 && authorization[..7].eq_ignore_ascii_case("bearer ") {
        Some(authorization[7..].trim())
    } else {
        None
    }
}

/// 比较摘要而不是原文，比较耗时与密钥前缀无关
fn keys_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    hex::encode(provided) == hex::encode(expected)
}

/// 管理端鉴权中间件
///
/// 未配置 admin_api_key 时跳过鉴权（开发/测试环境）。
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected_key = match &state.config.security.admin_api_key {
        Some(key) => key.expose_secret(),
        None => {
            tracing::debug!("Admin API key not configured, skipping auth");
            return Ok(next.run(req).await);
        }
    };

    let Some(provided_key) = extract_api_key(req.headers()) else {
        tracing::warn!(uri = %req.uri(), "Missing admin API key");
        return Err(AppError::Unauthorized);
    };

    if !keys_match(provided_key, expected_key) {
        tracing::warn!(uri = %req.uri(), "Invalid admin API key");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(req).await)
}
