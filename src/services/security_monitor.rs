//! Security monitor
//! 入站事件 → 检测规则 → 告警 → 按级别自动响应 → 出站事件
//!
//! 自动响应映射：
//! - INFO：只记录日志
//! - WARNING：用户通知，检测结果要求时再发出 2FA 事件
//! - CRITICAL：锁定账户、创建事件、事件创建通知、严重级别用户通知

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::models::*;
use crate::realtime::{EventSink, SecurityEvent};
use crate::services::alert_manager::{AlertCreation, AlertManager};
use crate::services::anomaly_detector::{keys, AnomalyDetector, AnomalyFinding};
use crate::store::StoreResult;

/// 自动响应执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum AutoResponse {
    /// INFO
    Logged,
    /// WARNING
    Notified { require_2fa: bool },
    /// CRITICAL；事件创建失败时 incident_id 为空，锁定事件仍然已发出
    Locked { incident_id: Option<Uuid> },
}

/// 安全监控器
pub struct SecurityMonitor {
    detector: Arc<AnomalyDetector>,
    alert_manager: Arc<AlertManager>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
}

impl SecurityMonitor {
    pub fn new(
        detector: Arc<AnomalyDetector>,
        alert_manager: Arc<AlertManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let timeout = detector.config().rule_timeout();
        Self {
            detector,
            alert_manager,
            events,
            timeout,
        }
    }

    // ==================== 入站事件 ====================

    /// 登录：失败登录与新地点两条规则并发执行
    #[instrument(skip(self, event), fields(user_id = %event.user_id, success = event.success))]
    pub async fn monitor_login(&self, event: &LoginEvent) -> Result<Vec<AlertCreation>> {
        event.validate()?;

        let failed_login = async {
            if event.success {
                return None;
            }
            self.run_rule("failed_login", &event.user_id, self.detector.detect_failed_login(event))
                .await
        };
        let new_location = async {
            if !event.success {
                return None;
            }
            self.run_rule("new_location", &event.user_id, self.detector.detect_new_location(event))
                .await
        };

        let (failed_login, new_location) = futures::join!(failed_login, new_location);
        let findings = [failed_login, new_location].into_iter().flatten().collect();
        Ok(self.process_findings(&event.user_id, findings).await)
    }

    #[instrument(skip(self, event), fields(user_id = %event.user_id, asset = %event.asset))]
    pub async fn monitor_trade(&self, event: &TradeEvent) -> Result<Vec<AlertCreation>> {
        event.validate()?;

        let finding = self
            .run_rule("unusual_trade_volume", &event.user_id, self.detector.detect_unusual_trade(event))
            .await;
        Ok(self.process_findings(&event.user_id, finding.into_iter().collect()).await)
    }

    #[instrument(skip(self, event), fields(user_id = %event.user_id))]
    pub async fn monitor_wallet_change(&self, event: &WalletChangeEvent) -> Result<Vec<AlertCreation>> {
        event.validate()?;

        let finding = self
            .run_rule(
                "rapid_wallet_changes",
                &event.user_id,
                self.detector.detect_rapid_wallet_changes(event),
            )
            .await;
        Ok(self.process_findings(&event.user_id, finding.into_iter().collect()).await)
    }

    #[instrument(skip(self, event), fields(user_id = %event.user_id, api_key_id = %event.api_key_id))]
    pub async fn monitor_api_request(&self, event: &ApiRequestEvent) -> Result<Vec<AlertCreation>> {
        event.validate()?;

        let finding = self
            .run_rule("api_rate_abuse", &event.user_id, self.detector.detect_api_abuse(event))
            .await;
        Ok(self.process_findings(&event.user_id, finding.into_iter().collect()).await)
    }

    /// 外部上报的可疑行为，错误直接返回给调用方
    #[instrument(skip(self, report), fields(user_id = %report.user_id, alert_type = %report.alert_type))]
    pub async fn report_activity(&self, report: ActivityReport) -> Result<AlertCreation> {
        report.validate()?;

        let details = match report.details {
            serde_json::Value::Null => json!({}),
            details => details,
        };
        let finding = AnomalyFinding {
            alert_type: report.alert_type,
            severity: report.severity,
            details,
        };
        self.process_anomaly(&report.user_id, finding).await
    }

    // ==================== 管理操作 ====================

    /// 清除用户的失败登录、钱包变更和 API 计数窗口
    #[instrument(skip(self))]
    pub async fn reset_user_counters(&self, user_id: &str) -> Result<u64> {
        validate_user_id(user_id)?;

        let mut deleted = 0;
        for pattern in keys::user_counter_patterns(user_id) {
            deleted += self.detector.counter().reset(&pattern).await?;
        }

        info!(deleted, "User counters reset");
        Ok(deleted)
    }

    /// 按当前窗口计数立即复查（不写入新事件），结果同样经过去重
    #[instrument(skip(self))]
    pub async fn recheck_user(&self, user_id: &str) -> Result<Vec<AlertCreation>> {
        validate_user_id(user_id)?;

        let (failed_logins, wallet_changes) = tokio::try_join!(
            self.bounded("failed-login recheck", async {
                self.detector
                    .recheck_failed_logins(user_id)
                    .await
                    .map_err(AppError::from)
            }),
            self.bounded("wallet-change recheck", async {
                self.detector
                    .recheck_wallet_changes(user_id)
                    .await
                    .map_err(AppError::from)
            }),
        )?;

        let findings = [failed_logins, wallet_changes].into_iter().flatten().collect();
        Ok(self.process_findings(user_id, findings).await)
    }

    // ==================== 告警流水线 ====================

    /// 告警持久化后先发出告警事件，再执行自动响应
    ///
    /// 去重命中时不重复执行自动响应。
    #[instrument(skip(self, finding), fields(alert_type = %finding.alert_type, severity = %finding.severity))]
    pub async fn process_anomaly(&self, user_id: &str, finding: AnomalyFinding) -> Result<AlertCreation> {
        let creation = self
            .bounded(
                "alert persistence",
                self.alert_manager.create_alert(NewSecurityAlert {
                    user_id: user_id.to_string(),
                    alert_type: finding.alert_type,
                    severity: finding.severity,
                    details: finding.details,
                }),
            )
            .await?;

        if let AlertCreation::Created(alert) = &creation {
            self.events.emit(SecurityEvent::AlertCreated {
                alert: alert.clone(),
            });
            self.execute_auto_response(alert).await;
        }

        Ok(creation)
    }

    /// 按告警级别执行自动响应，失败只记录日志，不回滚已创建的告警
    #[instrument(skip(self, alert), fields(alert_id = %alert.id, severity = %alert.severity))]
    pub async fn execute_auto_response(&self, alert: &SecurityAlert) -> AutoResponse {
        match alert.severity {
            AlertSeverity::Info => {
                info!(
                    user_id = %alert.user_id,
                    alert_type = %alert.alert_type,
                    "Informational security alert recorded"
                );
                AutoResponse::Logged
            }
            AlertSeverity::Warning => {
                self.notify(alert);

                let require_2fa = alert.requires_2fa();
                if require_2fa {
                    self.events.emit(SecurityEvent::Require2fa {
                        user_id: alert.user_id.clone(),
                        reason: format!("Security alert: {}", alert.alert_type),
                        alert_id: alert.id,
                    });
                }
                AutoResponse::Notified { require_2fa }
            }
            AlertSeverity::Critical => {
                warn!(user_id = %alert.user_id, alert_type = %alert.alert_type, "Locking account");
                self.events.emit(SecurityEvent::AccountLocked {
                    user_id: alert.user_id.clone(),
                    reason: format!("Critical security alert: {}", alert.alert_type),
                    alert_id: alert.id,
                    requires_2fa_reset: true,
                });

                let incident_id = match self.open_incident(alert).await {
                    Ok(incident) => {
                        let id = incident.id;
                        self.events.emit(SecurityEvent::IncidentCreated { incident });
                        Some(id)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to create incident for critical alert");
                        None
                    }
                };

                self.notify(alert);
                AutoResponse::Locked { incident_id }
            }
        }
    }

    async fn open_incident(&self, alert: &SecurityAlert) -> Result<SecurityIncident> {
        let new_incident = NewSecurityIncident {
            user_id: alert.user_id.clone(),
            title: format!("Critical security alert: {}", alert.alert_type),
            description: Some(format!(
                "Opened automatically for alert {} ({})",
                alert.id, alert.alert_type
            )),
            alert_ids: vec![alert.id],
            severity: IncidentSeverity::Critical,
            metadata: json!({
                "alert_type": alert.alert_type,
                "details": alert.details.0,
                "auto_response": true,
            }),
            account_locked: true,
            requires_2fa_reset: true,
            created_by: "system".to_string(),
        };

        self.bounded("incident persistence", self.alert_manager.create_incident(new_incident))
            .await
    }

    fn notify(&self, alert: &SecurityAlert) {
        self.events.emit(SecurityEvent::Notification {
            user_id: alert.user_id.clone(),
            level: alert.severity,
            alert_type: alert.alert_type,
            alert_id: alert.id,
            details: alert.details.0.clone(),
            timestamp: Utc::now(),
        });
    }

    /// 每条发现独立走完流水线，单条失败不影响其他发现
    async fn process_findings(&self, user_id: &str, findings: Vec<AnomalyFinding>) -> Vec<AlertCreation> {
        let results = join_all(
            findings
                .into_iter()
                .map(|finding| self.process_anomaly(user_id, finding)),
        )
        .await;

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(creation) => Some(creation),
                Err(e) => {
                    error!(user_id, error = %e, "Failed to record security alert");
                    None
                }
            })
            .collect()
    }

    /// 规则失败或超时按"未检测到"处理，但必须以 error 级别记录
    async fn run_rule<F>(&self, rule: &'static str, user_id: &str, detection: F) -> Option<AnomalyFinding>
    where
        F: Future<Output = StoreResult<Option<AnomalyFinding>>>,
    {
        let failure = match tokio::time::timeout(self.timeout, detection).await {
            Ok(Ok(finding)) => return finding,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };

        error!(rule, user_id, error = %failure, "Detection rule failed, treating as not detected");
        metrics::counter!("security_detection_failures_total", "rule" => rule).increment(1);
        None
    }

    async fn bounded<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| AppError::timeout(&format!("{} timed out", operation)))?
    }
}

/// 管理操作必须指定具体用户；ID 中的特殊字符由计数器键转义处理
fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(AppError::validation("user_id is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, DetectionConfig};
    use crate::realtime::EventBus;
    use crate::repository::{InMemoryAlertRepository, InMemoryIncidentRepository};
    use crate::store::MemoryStore;

    fn monitor() -> (SecurityMonitor, EventBus) {
        let bus = EventBus::new(64);
        let detector = Arc::new(AnomalyDetector::new(
            Arc::new(MemoryStore::new()),
            DetectionConfig::default(),
        ));
        let manager = Arc::new(AlertManager::new(
            Arc::new(InMemoryAlertRepository::new()),
            Arc::new(InMemoryIncidentRepository::new()),
            AlertConfig::default(),
        ));
        (
            SecurityMonitor::new(detector, manager, Arc::new(bus.clone())),
            bus,
        )
    }

    fn alert(severity: AlertSeverity, details: serde_json::Value) -> SecurityAlert {
        SecurityAlert::new(NewSecurityAlert {
            user_id: "u1".to_string(),
            alert_type: SecurityAlertType::SuspiciousActivity,
            severity,
            details,
        })
    }

    #[tokio::test]
    async fn test_auto_response_is_total() {
        let (monitor, bus) = monitor();
        let _rx = bus.subscribe();

        assert_eq!(
            monitor.execute_auto_response(&alert(AlertSeverity::Info, json!({}))).await,
            AutoResponse::Logged
        );
        assert_eq!(
            monitor
                .execute_auto_response(&alert(AlertSeverity::Warning, json!({ "require_2fa": true })))
                .await,
            AutoResponse::Notified { require_2fa: true }
        );
        assert!(matches!(
            monitor.execute_auto_response(&alert(AlertSeverity::Critical, json!({}))).await,
            AutoResponse::Locked { incident_id: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_info_emits_nothing() {
        let (monitor, bus) = monitor();
        let mut rx = bus.subscribe();

        monitor.execute_auto_response(&alert(AlertSeverity::Info, json!({}))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_event_rejected_before_counting() {
        let (monitor, _bus) = monitor();
        let event = LoginEvent {
            user_id: String::new(),
            ip_address: "1.2.3.4".to_string(),
            user_agent: None,
            location: None,
            success: false,
        };

        let err = monitor.monitor_login(&event).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_admin_operations_require_user_id() {
        let (monitor, _bus) = monitor();
        assert!(matches!(
            monitor.reset_user_counters(" ").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            monitor.recheck_user("").await,
            Err(AppError::Validation(_))
        ));
    }
}
