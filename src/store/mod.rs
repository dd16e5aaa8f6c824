//! 计数器存储抽象
//!
//! 检测规则依赖的临时状态（滑动窗口计数、已知登录地点、交易均值）都放在
//! 外部快速键值存储中，进程重启或多实例部署时状态不丢失。所有并发写入都
//! 通过存储自身的原子操作完成，应用层不加锁。
//!
//! - [`RedisStore`]：生产实现，基于 Redis 有序集合和 MULTI/EXEC 管道
//! - [`MemoryStore`]：单节点/测试实现，基于 DashMap 的分片锁
//! - [`SlidingWindowCounter`]：在存储之上提供按键计数的滑动窗口

mod counter;
mod memory;
mod redis;

pub use counter::SlidingWindowCounter;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Invalid stored value for key {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 键值存储需要提供的原子原语
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// 原子地写入一个事件：追加 `member`（分数为 `at`），删除早于
    /// `at - window` 的事件，把键的过期时间刷新为 `window`，返回剩余事件数
    async fn window_record(
        &self,
        key: &str,
        member: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<u64>;

    /// 先清理过期事件再计数，不写入新事件
    async fn window_count(&self, key: &str, at: DateTime<Utc>, window: Duration)
        -> StoreResult<u64>;

    /// 集合是否包含成员
    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// 向集合添加成员并刷新整个集合的过期时间
    async fn set_insert(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// 删除匹配 glob 模式（仅支持 `*`）的所有键，返回删除数量
    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64>;

    /// 连通性检查
    async fn ping(&self) -> StoreResult<()>;
}

/// 窗口起点（毫秒分数），早于该分数的事件会被清理
pub(crate) fn window_cutoff_ms(at: DateTime<Utc>, window: Duration) -> i64 {
    at.timestamp_millis() - window.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_cutoff() {
        let at = DateTime::from_timestamp_millis(1_000_000).unwrap();
        assert_eq!(window_cutoff_ms(at, Duration::from_secs(60)), 940_000);
    }
}
