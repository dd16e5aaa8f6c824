//! HTTP 处理器模块

pub mod alert;
pub mod health;
pub mod incident;
pub mod monitor;
