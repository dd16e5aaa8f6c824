//! Security alert models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// 告警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "security_alert_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityAlertType {
    FailedLogin,
    NewLocation,
    UnusualTradeVolume,
    RapidWalletChanges,
    ApiRateAbuse,
    AccountLocked,
    SuspiciousActivity,
    MultipleSessions,
}

impl SecurityAlertType {
    pub const ALL: [SecurityAlertType; 8] = [
        SecurityAlertType::FailedLogin,
        SecurityAlertType::NewLocation,
        SecurityAlertType::UnusualTradeVolume,
        SecurityAlertType::RapidWalletChanges,
        SecurityAlertType::ApiRateAbuse,
        SecurityAlertType::AccountLocked,
        SecurityAlertType::SuspiciousActivity,
        SecurityAlertType::MultipleSessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityAlertType::FailedLogin => "FAILED_LOGIN",
            SecurityAlertType::NewLocation => "NEW_LOCATION",
            SecurityAlertType::UnusualTradeVolume => "UNUSUAL_TRADE_VOLUME",
            SecurityAlertType::RapidWalletChanges => "RAPID_WALLET_CHANGES",
            SecurityAlertType::ApiRateAbuse => "API_RATE_ABUSE",
            SecurityAlertType::AccountLocked => "ACCOUNT_LOCKED",
            SecurityAlertType::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            SecurityAlertType::MultipleSessions => "MULTIPLE_SESSIONS",
        }
    }
}

impl std::fmt::Display for SecurityAlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 告警级别，INFO < WARNING < CRITICAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_severity", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub const ALL: [AlertSeverity; 3] =
        [AlertSeverity::Info, AlertSeverity::Warning, AlertSeverity::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 安全告警
///
/// 创建后类型与级别不可变，只有处理相关字段和通知标记会被修改。
/// 告警永不物理删除。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub user_id: String,
    pub alert_type: SecurityAlertType,
    pub severity: AlertSeverity,
    /// 检测上下文（次数、阈值、IP、UA），不包含任何密钥
    pub details: Json<serde_json::Value>,

    // 处理信息
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub false_positive: bool,

    pub notification_sent: bool,

    // 审计字段
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecurityAlert {
    pub fn new(new_alert: NewSecurityAlert) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: new_alert.user_id,
            alert_type: new_alert.alert_type,
            severity: new_alert.severity,
            details: Json(new_alert.details),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
            false_positive: false,
            notification_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 检测结果是否要求二次验证
    pub fn requires_2fa(&self) -> bool {
        self.details
            .get("require_2fa")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// 写入处理结果；重复处理会覆盖上一次的处理字段
    pub fn apply_resolution(&mut self, resolution: &AlertResolution) {
        let now = Utc::now();
        self.resolved = true;
        self.resolved_by = Some(resolution.resolved_by.clone());
        self.resolved_at = Some(now);
        self.resolution_note = resolution.note.clone();
        self.false_positive = resolution.false_positive;
        self.updated_at = now;
    }
}

/// 创建告警的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSecurityAlert {
    pub user_id: String,
    pub alert_type: SecurityAlertType,
    pub severity: AlertSeverity,
    #[serde(default = "empty_details")]
    pub details: serde_json::Value,
}

fn empty_details() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// 处理告警请求
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct AlertResolution {
    #[validate(length(min = 1, max = 128))]
    pub resolved_by: String,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
    #[serde(default)]
    pub false_positive: bool,
}

/// 告警查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    pub user_id: Option<String>,
    pub alert_type: Option<SecurityAlertType>,
    pub severity: Option<AlertSeverity>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

impl AlertFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub fn unresolved() -> Self {
        Self {
            resolved: Some(false),
            ..Self::default()
        }
    }

    /// 内存实现与测试使用的匹配逻辑，与 SQL 条件保持一致
    pub fn matches(&self, alert: &SecurityAlert) -> bool {
        if let Some(user_id) = &self.user_id {
            if &alert.user_id != user_id {
                return false;
            }
        }
        if let Some(alert_type) = self.alert_type {
            if alert.alert_type != alert_type {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if alert.severity != severity {
                return false;
            }
        }
        if let Some(resolved) = self.resolved {
            if alert.resolved != resolved {
                return false;
            }
        }
        if let Some(since) = self.since {
            if alert.created_at < since {
                return false;
            }
        }
        true
    }
}

/// 每日告警数量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAlertCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// 安全仪表盘统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_alerts: i64,
    pub unresolved_alerts: i64,
    /// 未处理的严重告警
    pub critical_alerts: i64,
    /// 未进入终态的事件
    pub open_incidents: i64,
    pub alerts_by_type: BTreeMap<SecurityAlertType, i64>,
    pub alerts_by_severity: BTreeMap<AlertSeverity, i64>,
    pub recent_alerts: Vec<SecurityAlert>,
    /// 最近 N 天（含今天）每日告警数，按日期升序，无告警的日期为 0
    pub daily_trend: Vec<DailyAlertCount>,
}
