//! 入站领域事件
//! 由登录、交易、钱包和 API 网关等协作方在进程内调用（或经 HTTP 适配层转入）

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::alert::{AlertSeverity, SecurityAlertType};

/// 登录尝试
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoginEvent {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(min = 1, max = 64))]
    pub ip_address: String,
    #[serde(default)]
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    /// 解析后的地理位置（例如 "DE/Berlin"），无法解析时为空
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub location: Option<String>,
    pub success: bool,
}

/// 成交
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TradeEvent {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(range(min = 0.0))]
    pub volume: f64,
    #[validate(length(min = 1, max = 32))]
    pub asset: String,
}

/// 提现地址变更
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WalletChangeEvent {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(min = 1, max = 256))]
    pub new_address: String,
    #[serde(default)]
    pub previous_address: Option<String>,
}

/// API 请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApiRequestEvent {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(min = 1, max = 128))]
    pub api_key_id: String,
    #[validate(length(min = 1, max = 512))]
    pub endpoint: String,
}

/// 外部检测到的可疑行为（人工或其他系统上报）
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ActivityReport {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    pub alert_type: SecurityAlertType,
    pub severity: AlertSeverity,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_event_validation() {
        let valid = LoginEvent {
            user_id: "u1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: Some("curl/8".to_string()),
            location: Some("DE/Berlin".to_string()),
            success: false,
        };
        assert!(valid.validate().is_ok());

        let missing_user = LoginEvent {
            user_id: String::new(),
            ..valid.clone()
        };
        assert!(missing_user.validate().is_err());

        let empty_location = LoginEvent {
            location: Some(String::new()),
            ..valid
        };
        assert!(empty_location.validate().is_err());
    }

    #[test]
    fn test_trade_event_rejects_negative_volume() {
        let trade = TradeEvent {
            user_id: "u1".to_string(),
            volume: -1.0,
            asset: "BTC".to_string(),
        };
        assert!(trade.validate().is_err());

        let trade = TradeEvent { volume: 0.0, ..trade };
        assert!(trade.validate().is_ok());
    }

    #[test]
    fn test_login_event_deserialization_defaults() {
        let json = r#"{"user_id":"u1","ip_address":"1.2.3.4","success":true}"#;
        let event: LoginEvent = serde_json::from_str(json).unwrap();
        assert!(event.location.is_none());
        assert!(event.user_agent.is_none());
    }
}
