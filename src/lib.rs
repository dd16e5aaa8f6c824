//! 安全监控服务库
//! 异常检测、告警与事件生命周期、自动响应

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod repository;
pub mod routes;
pub mod services;
pub mod store;
pub mod telemetry;
