//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    // 从环境变量构建过滤器
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // 根据配置选择日志格式
    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 预先描述安全指标
pub fn init_metrics() {
    metrics::describe_counter!(
        "security_alerts_created_total",
        "Security alerts persisted, by type and severity"
    );
    metrics::describe_counter!(
        "security_alerts_deduplicated_total",
        "Alerts merged into an existing unresolved alert"
    );
    metrics::describe_counter!(
        "security_incidents_created_total",
        "Incidents opened by the auto-response"
    );
    metrics::describe_counter!(
        "security_detection_failures_total",
        "Detection rules that failed or timed out"
    );
    tracing::debug!("Metrics initialized");
}
