//! Business logic services layer

pub mod alert_manager;
pub mod anomaly_detector;
pub mod security_monitor;

pub use alert_manager::{AlertCreation, AlertManager};
pub use anomaly_detector::{AnomalyDetector, AnomalyFinding};
pub use security_monitor::{AutoResponse, SecurityMonitor};
