//! 内存计数器存储
//! 单节点部署与测试使用；DashMap 的分片锁保证单键操作的原子性

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{window_cutoff_ms, KeyValueStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Entry {
    /// 分数（毫秒） -> 该分数下的成员
    Window(BTreeMap<i64, Vec<String>>),
    Set(HashSet<String>),
    Value(String),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at_ms: i64,
}

impl Slot {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// 每写入这么多次清扫一次过期键
const SWEEP_EVERY_WRITES: u64 = 1024;

/// 基于 DashMap 的键值存储
///
/// 过期键在读到时删除，另外每隔固定写入次数整体清扫一次。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: Arc<DashMap<String, Slot>>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前未过期的键数量
    pub fn len(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        self.slots.iter().filter(|s| !s.is_expired(now_ms)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 包括已过期但尚未清扫的键
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// 删除所有已过期的键，返回删除数量
    pub fn purge_expired(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now_ms));
        before.saturating_sub(self.slots.len())
    }

    /// 调用时不能持有任何分片上的引用
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Expired counter keys swept");
            }
        }
    }

    fn remove_if_expired(&self, key: &str, now_ms: i64) {
        self.slots.remove_if(key, |_, slot| slot.is_expired(now_ms));
    }

    fn expiry(from_ms: i64, ttl: Duration) -> i64 {
        from_ms + ttl.as_millis() as i64
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Command(format!(
            "WRONGTYPE operation against key {} holding the wrong kind of value",
            key
        ))
    }
}

/// 把 glob 模式（`*`）转换为锚定的正则表达式
pub(crate) fn glob_to_regex(pattern: &str) -> StoreResult<Regex> {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("^{}$", escaped))
        .map_err(|e| StoreError::Command(format!("Invalid key pattern {}: {}", pattern, e)))
}

fn prune_window(events: &mut BTreeMap<i64, Vec<String>>, cutoff_ms: i64) {
    *events = events.split_off(&cutoff_ms);
}

fn window_len(events: &BTreeMap<i64, Vec<String>>) -> u64 {
    events.values().map(|members| members.len() as u64).sum()
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn window_record(
        &self,
        key: &str,
        member: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<u64> {
        let at_ms = at.timestamp_millis();
        let count = {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
                entry: Entry::Window(BTreeMap::new()),
                expires_at_ms: Self::expiry(at_ms, window),
            });

            if slot.is_expired(at_ms) {
                slot.entry = Entry::Window(BTreeMap::new());
            }
            slot.expires_at_ms = Self::expiry(at_ms, window);

            let Entry::Window(events) = &mut slot.entry else {
                return Err(Self::wrong_type(key));
            };

            let members = events.entry(at_ms).or_default();
            if !members.iter().any(|m| m == member) {
                members.push(member.to_string());
            }
            prune_window(events, window_cutoff_ms(at, window));
            window_len(events)
        };

        self.after_write();
        Ok(count)
    }

    async fn window_count(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<u64> {
        let at_ms = at.timestamp_millis();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(0);
        };

        if slot.is_expired(at_ms) {
            drop(slot);
            self.remove_if_expired(key, at_ms);
            return Ok(0);
        }

        let Entry::Window(events) = &mut slot.entry else {
            return Err(Self::wrong_type(key));
        };

        prune_window(events, window_cutoff_ms(at, window));
        Ok(window_len(events))
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let Some(slot) = self.slots.get(key) else {
            return Ok(false);
        };

        if slot.is_expired(now_ms) {
            drop(slot);
            self.remove_if_expired(key, now_ms);
            return Ok(false);
        }

        match &slot.entry {
            Entry::Set(members) => Ok(members.contains(member)),
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn set_insert(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
                entry: Entry::Set(HashSet::new()),
                expires_at_ms: Self::expiry(now_ms, ttl),
            });

            if slot.is_expired(now_ms) {
                slot.entry = Entry::Set(HashSet::new());
            }
            slot.expires_at_ms = Self::expiry(now_ms, ttl);

            let Entry::Set(members) = &mut slot.entry else {
                return Err(Self::wrong_type(key));
            };
            members.insert(member.to_string());
        }

        self.after_write();
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now_ms = Utc::now().timestamp_millis();
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };

        if slot.is_expired(now_ms) {
            drop(slot);
            self.remove_if_expired(key, now_ms);
            return Ok(None);
        }

        match &slot.entry {
            Entry::Value(value) => Ok(Some(value.clone())),
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at_ms: Self::expiry(now_ms, ttl),
            },
        );
        self.after_write();
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        let matcher = glob_to_regex(pattern)?;
        let now_ms = Utc::now().timestamp_millis();

        let keys: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| matcher.is_match(slot.key()) && !slot.is_expired(now_ms))
            .map(|slot| slot.key().clone())
            .collect();

        let mut deleted = 0;
        for key in keys {
            if self.slots.remove(&key).is_some() {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_window_cold_key_counts_one() {
        let store = MemoryStore::new();
        let count = store
            .window_record("failed_logins:u1", "e1", ts(0), Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_window_prunes_old_events() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        store.window_record("k", "e1", ts(0), window).await.unwrap();
        store.window_record("k", "e2", ts(30), window).await.unwrap();
        assert_eq!(store.window_count("k", ts(30), window).await.unwrap(), 2);

        // e1 已经滑出窗口
        let count = store.window_record("k", "e3", ts(75), window).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.window_count("k", ts(200), window).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_same_millisecond_distinct_members() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        store.window_record("k", "a", ts(0), window).await.unwrap();
        let count = store.window_record("k", "b", ts(0), window).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_window_count_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(
            store.window_count("nothing", ts(0), Duration::from_secs(1)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_set_and_value() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(3600);

        assert!(!store.set_contains("locations:u1", "Berlin").await.unwrap());
        store.set_insert("locations:u1", "Berlin", ttl).await.unwrap();
        assert!(store.set_contains("locations:u1", "Berlin").await.unwrap());
        assert!(!store.set_contains("locations:u1", "Paris").await.unwrap());

        assert_eq!(store.get("avg:u1:BTC").await.unwrap(), None);
        store.put("avg:u1:BTC", "12.5", ttl).await.unwrap();
        assert_eq!(store.get("avg:u1:BTC").await.unwrap().as_deref(), Some("12.5"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.put("k", "1", Duration::from_secs(10)).await.unwrap();
        assert!(store.set_contains("k", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(600);
        let now = Utc::now();
        store.window_record("failed_logins:u1", "a", now, window).await.unwrap();
        store.window_record("wallet_changes:u1", "b", now, window).await.unwrap();
        store.window_record("failed_logins:u2", "c", now, window).await.unwrap();

        assert_eq!(store.delete_matching("*:u1").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete_matching("failed_logins:*").await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_keys_are_removed_on_read() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        store.window_record("k", "e1", ts(0), window).await.unwrap();
        assert_eq!(store.slot_count(), 1);

        assert_eq!(store.window_count("k", ts(120), window).await.unwrap(), 0);
        assert_eq!(store.slot_count(), 0);

        store.put("v", "1", Duration::ZERO).await.unwrap();
        store.set_insert("s", "m", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("v").await.unwrap(), None);
        assert!(!store.set_contains("s", "m").await.unwrap());
        assert_eq!(store.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_keys() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store.put(&format!("stale:{}", i), "1", Duration::ZERO).await.unwrap();
        }
        assert_eq!(store.slot_count(), 10);

        for i in 0..SWEEP_EVERY_WRITES {
            store
                .put(&format!("live:{}", i % 4), "1", Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(store.slot_count(), 4);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_glob_to_regex_escapes() {
        let re = glob_to_regex("api_requests:u.1:*").unwrap();
        assert!(re.is_match("api_requests:u.1:key-9"));
        assert!(!re.is_match("api_requests:ux1:key-9"));
        assert!(!re.is_match("prefix:api_requests:u.1:key"));
    }
}
