//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis 连接 URL（可能包含密码）
    pub url: Secret<String>,
    /// 所有计数器键的前缀
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// 管理接口 API Key（未设置时跳过鉴权，仅用于开发环境）
    #[serde(default)]
    pub admin_api_key: Option<Secret<String>>,
}

/// 异常检测阈值
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// 登录失败统计窗口（秒）
    pub failed_login_window_secs: u64,
    pub failed_login_warning_threshold: u64,
    pub failed_login_critical_threshold: u64,
    /// 已知登录地点保留时间（天）
    pub known_location_ttl_days: u64,
    /// 交易量超过滚动均值的倍数时告警
    pub trade_volume_multiplier: f64,
    /// 指数平滑系数
    pub trade_ema_alpha: f64,
    /// 交易均值保留时间（天）
    pub trade_baseline_ttl_days: u64,
    pub wallet_change_window_secs: u64,
    pub wallet_change_critical_threshold: u64,
    pub api_rate_window_secs: u64,
    pub api_rate_limit: u64,
    /// 达到上限的该比例时发出预警
    pub api_rate_warning_ratio: f64,
    /// 单条规则的超时时间（毫秒）
    pub rule_timeout_ms: u64,
}

impl DetectionConfig {
    pub fn failed_login_window(&self) -> Duration {
        Duration::from_secs(self.failed_login_window_secs)
    }

    pub fn known_location_ttl(&self) -> Duration {
        Duration::from_secs(self.known_location_ttl_days * 24 * 3600)
    }

    pub fn trade_baseline_ttl(&self) -> Duration {
        Duration::from_secs(self.trade_baseline_ttl_days * 24 * 3600)
    }

    pub fn wallet_change_window(&self) -> Duration {
        Duration::from_secs(self.wallet_change_window_secs)
    }

    pub fn api_rate_window(&self) -> Duration {
        Duration::from_secs(self.api_rate_window_secs)
    }

    pub fn rule_timeout(&self) -> Duration {
        Duration::from_millis(self.rule_timeout_ms)
    }

    /// API 预警阈值（向上取整，1000 * 0.8 = 800）
    pub fn api_rate_warning_threshold(&self) -> u64 {
        (self.api_rate_limit as f64 * self.api_rate_warning_ratio).ceil() as u64
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            failed_login_window_secs: 15 * 60,
            failed_login_warning_threshold: 3,
            failed_login_critical_threshold: 5,
            known_location_ttl_days: 90,
            trade_volume_multiplier: 3.0,
            trade_ema_alpha: 0.1,
            trade_baseline_ttl_days: 30,
            wallet_change_window_secs: 5 * 60,
            wallet_change_critical_threshold: 5,
            api_rate_window_secs: 60 * 60,
            api_rate_limit: 1000,
            api_rate_warning_ratio: 0.8,
            rule_timeout_ms: 5000,
        }
    }
}

/// 告警与事件配置
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// 相同告警的去重窗口（秒）
    pub dedup_window_secs: u64,
    /// 仪表盘展示的最近未处理告警数量
    pub dashboard_recent_limit: i64,
    /// 仪表盘趋势天数
    pub trend_days: u32,
}

impl AlertConfig {
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            dashboard_recent_limit: 10,
            trend_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    pub detection: DetectionConfig,
    pub alerts: AlertConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let detection = DetectionConfig::default();
        let alerts = AlertConfig::default();

        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("redis.key_prefix", "secmon")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            // 检测阈值
            .set_default(
                "detection.failed_login_window_secs",
                detection.failed_login_window_secs,
            )?
            .set_default(
                "detection.failed_login_warning_threshold",
                detection.failed_login_warning_threshold,
            )?
            .set_default(
                "detection.failed_login_critical_threshold",
                detection.failed_login_critical_threshold,
            )?
            .set_default("detection.known_location_ttl_days", detection.known_location_ttl_days)?
            .set_default("detection.trade_volume_multiplier", detection.trade_volume_multiplier)?
            .set_default("detection.trade_ema_alpha", detection.trade_ema_alpha)?
            .set_default("detection.trade_baseline_ttl_days", detection.trade_baseline_ttl_days)?
            .set_default(
                "detection.wallet_change_window_secs",
                detection.wallet_change_window_secs,
            )?
            .set_default(
                "detection.wallet_change_critical_threshold",
                detection.wallet_change_critical_threshold,
            )?
            .set_default("detection.api_rate_window_secs", detection.api_rate_window_secs)?
            .set_default("detection.api_rate_limit", detection.api_rate_limit)?
            .set_default("detection.api_rate_warning_ratio", detection.api_rate_warning_ratio)?
            .set_default("detection.rule_timeout_ms", detection.rule_timeout_ms)?
            // 告警
            .set_default("alerts.dedup_window_secs", alerts.dedup_window_secs)?
            .set_default("alerts.dashboard_recent_limit", alerts.dashboard_recent_limit)?
            .set_default("alerts.trend_days", alerts.trend_days)?;

        // 从环境变量加载配置（前缀为 SECMON_）
        settings = settings.add_source(
            Environment::with_prefix("SECMON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        // 验证数据库连接池配置
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        // 键前缀参与 SCAN MATCH，不能带 glob 元字符
        if self.redis.key_prefix.is_empty()
            || self
                .redis
                .key_prefix
                .contains(['*', '?', '[', ']', '\\'])
        {
            return Err(ConfigError::Message(
                "redis.key_prefix must be non-empty and free of glob characters".to_string(),
            ));
        }

        self.detection.validate()?;

        if self.alerts.dedup_window_secs == 0 {
            return Err(ConfigError::Message(
                "alerts.dedup_window_secs must be > 0".to_string(),
            ));
        }
        if self.alerts.trend_days == 0 || self.alerts.trend_days > 90 {
            return Err(ConfigError::Message(
                "alerts.trend_days must be between 1 and 90".to_string(),
            ));
        }

        Ok(())
    }
}

impl DetectionConfig {
    /// 验证阈值之间的关系
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failed_login_warning_threshold == 0
            || self.failed_login_warning_threshold >= self.failed_login_critical_threshold
        {
            return Err(ConfigError::Message(
                "failed_login_warning_threshold must be > 0 and < failed_login_critical_threshold"
                    .to_string(),
            ));
        }

        if !(self.trade_ema_alpha > 0.0 && self.trade_ema_alpha <= 1.0) {
            return Err(ConfigError::Message(
                "trade_ema_alpha must be in (0, 1]".to_string(),
            ));
        }

        if self.trade_volume_multiplier <= 1.0 {
            return Err(ConfigError::Message(
                "trade_volume_multiplier must be > 1".to_string(),
            ));
        }

        if !(self.api_rate_warning_ratio > 0.0 && self.api_rate_warning_ratio < 1.0) {
            return Err(ConfigError::Message(
                "api_rate_warning_ratio must be in (0, 1)".to_string(),
            ));
        }

        let windows = [
            self.failed_login_window_secs,
            self.wallet_change_window_secs,
            self.api_rate_window_secs,
            self.rule_timeout_ms,
            self.known_location_ttl_days,
            self.trade_baseline_ttl_days,
        ];
        if windows.iter().any(|w| *w == 0) {
            return Err(ConfigError::Message(
                "detection windows, TTLs and timeouts must be > 0".to_string(),
            ));
        }

        if self.wallet_change_critical_threshold == 0 || self.api_rate_limit == 0 {
            return Err(ConfigError::Message(
                "detection thresholds must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
