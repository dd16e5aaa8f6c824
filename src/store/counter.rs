//! 滑动窗口计数器

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{KeyValueStore, StoreResult};

/// 按键的滑动窗口事件计数器
///
/// 原子性完全由底层存储提供，同一个键可以被多个实例并发写入。
#[derive(Clone)]
pub struct SlidingWindowCounter {
    store: Arc<dyn KeyValueStore>,
}

impl SlidingWindowCounter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// 记录一次"现在"发生的事件并返回窗口内的事件数
    ///
    /// 不存在的键视为空窗口，首次调用返回 1。
    pub async fn record_and_count(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let now = Utc::now();
        // 同一毫秒内的多个事件也要各自计数
        let member = format!("{}:{}", now.timestamp_millis(), Uuid::new_v4());
        self.store.window_record(key, &member, now, window).await
    }

    /// 只读计数（先清理过期事件）
    pub async fn count(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.store.window_count(key, Utc::now(), window).await
    }

    /// 清除匹配模式的所有计数器，用于误报后的人工恢复
    pub async fn reset(&self, key_pattern: &str) -> StoreResult<u64> {
        let deleted = self.store.delete_matching(key_pattern).await?;
        tracing::info!(pattern = %key_pattern, deleted, "Counters reset");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counter() -> SlidingWindowCounter {
        SlidingWindowCounter::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_record_and_count_increments() {
        let counter = counter();
        let window = Duration::from_secs(900);

        for expected in 1..=6 {
            let count = counter.record_and_count("failed_logins:u1", window).await.unwrap();
            assert_eq!(count, expected);
        }
        assert_eq!(counter.count("failed_logins:u1", window).await.unwrap(), 6);
        assert_eq!(counter.count("failed_logins:u2", window).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_records_are_all_counted() {
        let counter = counter();
        let window = Duration::from_secs(60);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.record_and_count("api:k", window).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(counter.count("api:k", window).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_reset() {
        let counter = counter();
        let window = Duration::from_secs(60);
        counter.record_and_count("failed_logins:u1", window).await.unwrap();
        counter.record_and_count("wallet_changes:u1", window).await.unwrap();

        assert_eq!(counter.reset("failed_logins:u1").await.unwrap(), 1);
        assert_eq!(counter.count("failed_logins:u1", window).await.unwrap(), 0);
        assert_eq!(counter.count("wallet_changes:u1", window).await.unwrap(), 1);
    }
}
