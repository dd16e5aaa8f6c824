//! Security event bus
//! 出站安全事件：锁定账户、2FA、通知等外部协作方通过订阅事件总线消费

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{AlertSeverity, SecurityAlert, SecurityAlertType, SecurityIncident};

/// 出站安全事件
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// 告警已创建
    AlertCreated { alert: SecurityAlert },
    /// 账户需要锁定
    AccountLocked {
        user_id: String,
        reason: String,
        alert_id: Uuid,
        requires_2fa_reset: bool,
    },
    /// 事件已创建
    IncidentCreated { incident: SecurityIncident },
    /// 需要二次验证
    Require2fa {
        user_id: String,
        reason: String,
        alert_id: Uuid,
    },
    /// 用户通知
    Notification {
        user_id: String,
        level: AlertSeverity,
        alert_type: SecurityAlertType,
        alert_id: Uuid,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl SecurityEvent {
    /// 事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            SecurityEvent::AlertCreated { .. } => "security.alert.created",
            SecurityEvent::AccountLocked { .. } => "security.account.locked",
            SecurityEvent::IncidentCreated { .. } => "security.incident.created",
            SecurityEvent::Require2fa { .. } => "security.require_2fa",
            SecurityEvent::Notification { .. } => "notification.security",
        }
    }

    /// 事件关联的用户
    pub fn user_id(&self) -> &str {
        match self {
            SecurityEvent::AlertCreated { alert } => &alert.user_id,
            SecurityEvent::IncidentCreated { incident } => &incident.user_id,
            SecurityEvent::AccountLocked { user_id, .. }
            | SecurityEvent::Require2fa { user_id, .. }
            | SecurityEvent::Notification { user_id, .. } => user_id,
        }
    }

    /// 转换为 JSON 载荷
    pub fn to_payload(&self) -> serde_json::Value {
        let data = match self {
            SecurityEvent::AlertCreated { alert } => json!({ "alert": alert }),
            SecurityEvent::AccountLocked {
                user_id,
                reason,
                alert_id,
                requires_2fa_reset,
            } => json!({
                "user_id": user_id,
                "reason": reason,
                "alert_id": alert_id,
                "requires_2fa_reset": requires_2fa_reset,
            }),
            SecurityEvent::IncidentCreated { incident } => json!({ "incident": incident }),
            SecurityEvent::Require2fa {
                user_id,
                reason,
                alert_id,
            } => json!({
                "user_id": user_id,
                "reason": reason,
                "alert_id": alert_id,
            }),
            SecurityEvent::Notification {
                user_id,
                level,
                alert_type,
                alert_id,
                details,
                timestamp,
            } => json!({
                "user_id": user_id,
                "level": level,
                "alert_type": alert_type,
                "alert_id": alert_id,
                "details": details,
                "timestamp": timestamp.to_rfc3339(),
            }),
        };

        json!({ "type": self.event_type(), "data": data })
    }
}

/// 出站事件接收方
///
/// 发送不等待消费者，失败只记录日志，不能阻塞检测流程。
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: SecurityEvent);
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    /// 广播发送器（用于向所有订阅者发送事件）
    sender: broadcast::Sender<SecurityEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，没有订阅者时返回错误
    pub fn publish(&self, event: SecurityEvent) -> Result<usize> {
        self.sender
            .send(event)
            .map_err(|e| AppError::internal_error(&format!("Failed to publish event: {}", e)))
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: SecurityEvent) {
        let event_type = event.event_type();
        let user_id = event.user_id().to_string();

        match self.publish(event) {
            Ok(receivers) => {
                tracing::debug!(event_type, user_id = %user_id, receivers, "Security event published");
            }
            Err(e) => {
                tracing::warn!(event_type, user_id = %user_id, error = %e, "Security event dropped");
            }
        }
    }
}
