//! Redis 计数器存储
//!
//! 滑动窗口使用有序集合：成员为唯一事件 ID，分数为毫秒时间戳。
//! 写入、清理、续期、计数在同一个 MULTI/EXEC 事务中完成，
//! 同一键上的并发写入由 Redis 保证全序。
//!
//! 键格式：`{key_prefix}:{key}`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::{window_cutoff_ms, KeyValueStore, StoreError, StoreResult};

/// 每次 SCAN 的建议批量
const SCAN_BATCH: usize = 500;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// 基于 Redis 的键值存储
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// 建立连接并执行 PING
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("Invalid Redis URL: {}", e)))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        let store = Self {
            conn,
            key_prefix: key_prefix.into(),
        };
        store.ping().await?;

        tracing::info!(key_prefix = %store.key_prefix, "Redis counter store connected");
        Ok(store)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn window_record(
        &self,
        key: &str,
        member: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<u64> {
        let full_key = self.full_key(key);
        let cutoff = window_cutoff_ms(at, window);
        let mut conn = self.conn.clone();

        // 分数严格小于 cutoff 的事件被删除
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zadd(&full_key, member, at.timestamp_millis())
            .ignore()
            .zrembyscore(&full_key, "-inf", format!("({}", cutoff))
            .ignore()
            .expire(&full_key, window.as_secs().max(1) as i64)
            .ignore()
            .zcard(&full_key)
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn window_count(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<u64> {
        let full_key = self.full_key(key);
        let cutoff = window_cutoff_ms(at, window);
        let mut conn = self.conn.clone();

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(&full_key, "-inf", format!("({}", cutoff))
            .ignore()
            .zcard(&full_key)
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let found: bool = conn.sismember(self.full_key(key), member).await?;
        Ok(found)
    }

    async fn set_insert(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .sadd(&full_key, member)
            .ignore()
            .expire(&full_key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.full_key(key), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// SCAN 游标分批匹配，逐批 DEL
    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        let full_pattern = self.full_key(pattern);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            // SCAN 可能重复返回同一个键，DEL 只统计真正删除的数量
            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(format!("Redis PING failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 需要运行中的 Redis：cargo test store::redis -- --ignored

    #[tokio::test]
    #[ignore]
    async fn test_redis_window_record() {
        let store = RedisStore::connect("redis://127.0.0.1:6379", "secmon:test")
            .await
            .expect("redis available");
        store.delete_matching("window:*").await.unwrap();

        let now = Utc::now();
        let window = Duration::from_secs(60);
        assert_eq!(store.window_record("window:a", "e1", now, window).await.unwrap(), 1);
        assert_eq!(store.window_record("window:a", "e2", now, window).await.unwrap(), 2);
        assert_eq!(store.window_count("window:a", now, window).await.unwrap(), 2);

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(store.window_count("window:a", later, window).await.unwrap(), 0);

        store.window_record("window:b", "e3", later, window).await.unwrap();
        assert_eq!(store.delete_matching("window:*").await.unwrap(), 1);
    }
}
