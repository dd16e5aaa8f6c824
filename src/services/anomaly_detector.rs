//! Anomaly detector
//! 无状态检测规则：所有历史状态（滑动窗口、已知地点、交易均值）都委托给计数器存储

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::DetectionConfig;
use crate::models::{
    AlertSeverity, ApiRequestEvent, LoginEvent, SecurityAlertType, TradeEvent, WalletChangeEvent,
};
use crate::store::{KeyValueStore, SlidingWindowCounter, StoreError, StoreResult};

/// 计数器键
///
/// 用户 ID、API Key ID、资产代码作为键的一段写入前先转义：`:`、glob 元字符和 `%`
/// 本身都替换成 `%XX`。任意一段都不会含有分隔符，`api_requests:{user}:*`
/// 只会命中该用户自己的键，Redis 与内存存储对模式的解释也保持一致。
pub mod keys {
    use std::borrow::Cow;
    use std::fmt::Write;

    const RESERVED: [char; 7] = ['%', ':', '*', '?', '[', ']', '\\'];

    pub fn segment(raw: &str) -> Cow<'_, str> {
        if !raw.contains(RESERVED) {
            return Cow::Borrowed(raw);
        }

        let mut encoded = String::with_capacity(raw.len() + 8);
        for c in raw.chars() {
            if RESERVED.contains(&c) {
                let _ = write!(encoded, "%{:02X}", c as u32);
            } else {
                encoded.push(c);
            }
        }
        Cow::Owned(encoded)
    }

    pub fn failed_logins(user_id: &str) -> String {
        format!("failed_logins:{}", segment(user_id))
    }

    pub fn known_locations(user_id: &str) -> String {
        format!("known_locations:{}", segment(user_id))
    }

    pub fn trade_average(user_id: &str, asset: &str) -> String {
        format!("trade_avg:{}:{}", segment(user_id), segment(asset))
    }

    pub fn wallet_changes(user_id: &str) -> String {
        format!("wallet_changes:{}", segment(user_id))
    }

    pub fn api_requests(user_id: &str, api_key_id: &str) -> String {
        format!("api_requests:{}:{}", segment(user_id), segment(api_key_id))
    }

    /// 人工恢复时清除的用户计数器（已知地点与交易均值保留）
    pub fn user_counter_patterns(user_id: &str) -> Vec<String> {
        vec![
            failed_logins(user_id),
            wallet_changes(user_id),
            format!("api_requests:{}:*", segment(user_id)),
        ]
    }
}

/// 单条规则的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyFinding {
    pub alert_type: SecurityAlertType,
    pub severity: AlertSeverity,
    pub details: serde_json::Value,
}

/// 异常检测器
pub struct AnomalyDetector {
    store: Arc<dyn KeyValueStore>,
    counter: SlidingWindowCounter,
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn KeyValueStore>, config: DetectionConfig) -> Self {
        let counter = SlidingWindowCounter::new(store.clone());
        Self {
            store,
            counter,
            config,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn counter(&self) -> &SlidingWindowCounter {
        &self.counter
    }

    /// 失败登录次数分级
    pub fn classify_failed_logins(&self, count: u64) -> Option<AlertSeverity> {
        if count >= self.config.failed_login_critical_threshold {
            Some(AlertSeverity::Critical)
        } else if count >= self.config.failed_login_warning_threshold {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }

    /// 钱包地址变更次数分级（只有严重级别）
    pub fn classify_wallet_changes(&self, count: u64) -> Option<AlertSeverity> {
        (count >= self.config.wallet_change_critical_threshold).then_some(AlertSeverity::Critical)
    }

    /// API 请求量分级
    pub fn classify_api_rate(&self, count: u64) -> Option<AlertSeverity> {
        if count >= self.config.api_rate_limit {
            Some(AlertSeverity::Critical)
        } else if count >= self.config.api_rate_warning_threshold() {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }

    fn failed_login_finding(&self, user_id: &str, count: u64) -> Option<AnomalyFinding> {
        let severity = self.classify_failed_logins(count)?;
        let threshold = match severity {
            AlertSeverity::Critical => self.config.failed_login_critical_threshold,
            _ => self.config.failed_login_warning_threshold,
        };
        Some(AnomalyFinding {
            alert_type: SecurityAlertType::FailedLogin,
            severity,
            details: json!({
                "user_id": user_id,
                "failed_attempts": count,
                "threshold": threshold,
                "window_secs": self.config.failed_login_window_secs,
            }),
        })
    }

    fn wallet_change_finding(&self, count: u64) -> Option<AnomalyFinding> {
        let severity = self.classify_wallet_changes(count)?;
        Some(AnomalyFinding {
            alert_type: SecurityAlertType::RapidWalletChanges,
            severity,
            details: json!({
                "changes": count,
                "threshold": self.config.wallet_change_critical_threshold,
                "window_secs": self.config.wallet_change_window_secs,
            }),
        })
    }

    /// 失败登录检测
    ///
    /// 每次失败都写入窗口，达到阈值时按次数分级。
    #[instrument(skip(self, event), fields(user_id = %event.user_id))]
    pub async fn detect_failed_login(&self, event: &LoginEvent) -> StoreResult<Option<AnomalyFinding>> {
        let key = keys::failed_logins(&event.user_id);
        let count = self
            .counter
            .record_and_count(&key, self.config.failed_login_window())
            .await?;
        debug!(count, "Failed login recorded");

        let finding = self.failed_login_finding(&event.user_id, count).map(|mut finding| {
            finding.details["ip_address"] = json!(event.ip_address);
            finding.details["user_agent"] = json!(event.user_agent);
            finding
        });

        if let Some(finding) = &finding {
            warn!(severity = %finding.severity, count, "Failed login threshold reached");
        }
        Ok(finding)
    }

    /// 新地点登录检测
    ///
    /// 先检查再写入：地点第一次出现时一定告警。
    #[instrument(skip(self, event), fields(user_id = %event.user_id))]
    pub async fn detect_new_location(&self, event: &LoginEvent) -> StoreResult<Option<AnomalyFinding>> {
        let Some(location) = event.location.as_deref() else {
            return Ok(None);
        };

        let key = keys::known_locations(&event.user_id);
        let known = self.store.set_contains(&key, location).await?;
        self.store
            .set_insert(&key, location, self.config.known_location_ttl())
            .await?;

        if known {
            return Ok(None);
        }

        warn!(location = %location, "Login from new location");
        Ok(Some(AnomalyFinding {
            alert_type: SecurityAlertType::NewLocation,
            severity: AlertSeverity::Warning,
            details: json!({
                "location": location,
                "ip_address": event.ip_address,
                "user_agent": event.user_agent,
                "require_2fa": true,
            }),
        }))
    }

    /// 交易量检测
    ///
    /// 均值在每笔交易后无条件更新；只有存在历史均值时才比较。
    #[instrument(skip(self, event), fields(user_id = %event.user_id, asset = %event.asset))]
    pub async fn detect_unusual_trade(&self, event: &TradeEvent) -> StoreResult<Option<AnomalyFinding>> {
        let key = keys::trade_average(&event.user_id, &event.asset);
        let previous = match self.store.get(&key).await? {
            Some(raw) => Some(raw.parse::<f64>().map_err(|_| StoreError::InvalidValue {
                key: key.clone(),
                value: raw.clone(),
            })?),
            None => None,
        };

        let alpha = self.config.trade_ema_alpha;
        let updated = match previous {
            Some(average) => alpha * event.volume + (1.0 - alpha) * average,
            None => event.volume,
        };
        self.store
            .put(&key, &updated.to_string(), self.config.trade_baseline_ttl())
            .await?;

        let Some(average) = previous.filter(|average| *average > 0.0) else {
            return Ok(None);
        };

        let multiplier = self.config.trade_volume_multiplier;
        if event.volume <= average * multiplier {
            return Ok(None);
        }

        warn!(volume = event.volume, average, "Unusual trade volume");
        Ok(Some(AnomalyFinding {
            alert_type: SecurityAlertType::UnusualTradeVolume,
            severity: AlertSeverity::Warning,
            details: json!({
                "asset": event.asset,
                "volume": event.volume,
                "average_volume": average,
                "multiplier": multiplier,
                "ratio": event.volume / average,
            }),
        }))
    }

    /// 钱包地址频繁变更检测
    #[instrument(skip(self, event), fields(user_id = %event.user_id))]
    pub async fn detect_rapid_wallet_changes(
        &self,
        event: &WalletChangeEvent,
    ) -> StoreResult<Option<AnomalyFinding>> {
        let key = keys::wallet_changes(&event.user_id);
        let count = self
            .counter
            .record_and_count(&key, self.config.wallet_change_window())
            .await?;

        let finding = self.wallet_change_finding(count).map(|mut finding| {
            finding.details["new_address"] = json!(event.new_address);
            finding.details["previous_address"] = json!(event.previous_address);
            finding
        });

        if finding.is_some() {
            warn!(count, "Rapid wallet address changes");
        }
        Ok(finding)
    }

    /// API 调用频率检测（按用户 + API Key 计数）
    #[instrument(skip(self, event), fields(user_id = %event.user_id, api_key_id = %event.api_key_id))]
    pub async fn detect_api_abuse(&self, event: &ApiRequestEvent) -> StoreResult<Option<AnomalyFinding>> {
        let key = keys::api_requests(&event.user_id, &event.api_key_id);
        let count = self
            .counter
            .record_and_count(&key, self.config.api_rate_window())
            .await?;

        let Some(severity) = self.classify_api_rate(count) else {
            return Ok(None);
        };

        warn!(severity = %severity, count, "API rate threshold reached");
        Ok(Some(AnomalyFinding {
            alert_type: SecurityAlertType::ApiRateAbuse,
            severity,
            details: json!({
                "api_key_id": event.api_key_id,
                "endpoint": event.endpoint,
                "requests": count,
                "limit": self.config.api_rate_limit,
                "window_secs": self.config.api_rate_window_secs,
            }),
        }))
    }

    /// 只读复查失败登录窗口，不写入新事件
    pub async fn recheck_failed_logins(&self, user_id: &str) -> StoreResult<Option<AnomalyFinding>> {
        let count = self
            .counter
            .count(&keys::failed_logins(user_id), self.config.failed_login_window())
            .await?;
        Ok(self.failed_login_finding(user_id, count).map(|mut finding| {
            finding.details["recheck"] = json!(true);
            finding
        }))
    }

    /// 只读复查钱包变更窗口
    pub async fn recheck_wallet_changes(&self, user_id: &str) -> StoreResult<Option<AnomalyFinding>> {
        let count = self
            .counter
            .count(&keys::wallet_changes(user_id), self.config.wallet_change_window())
            .await?;
        Ok(self.wallet_change_finding(count).map(|mut finding| {
            finding.details["recheck"] = json!(true);
            finding
        }))
    }
}
