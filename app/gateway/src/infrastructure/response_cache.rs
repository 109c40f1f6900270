//! 节点响应缓存
//!
//! 仅缓存固定白名单中的只读方法。键为（方法名，参数的规范 JSON 序列化），
//! 每个条目由独立的淘汰任务负责：TTL 到期或所属令牌被取消，先到者删除条目。

use crate::service::cancel::CancelToken;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// 可缓存的节点方法
pub const CACHABLE_METHODS: &[&str] = &[
    "getblock",
    "gethexaddress",
    "getrawtransaction",
    "gettxout",
    "decoderawtransaction",
];

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

/// 命中缓存时的日志标记
pub const CACHE_HIT_MARKER: &str = "cache hit";

type CacheKey = (String, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    generation: u64,
}

/// 淘汰原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Timeout,
    Cancelled,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Timeout => "timeout",
            EvictionReason::Cancelled => "cancelled",
        }
    }
}

struct CacheInner {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// 响应缓存（可克隆，克隆共享同一存储）
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                ttl,
                generation: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_cachable(method: &str) -> bool {
        CACHABLE_METHODS.contains(&method)
    }

    fn key(method: &str, params: &Value) -> CacheKey {
        // serde_json 的 Map 默认按键排序，序列化结果即规范形式
        (method.to_string(), params.to_string())
    }

    /// 查询缓存
    pub async fn get(&self, method: &str, params: &Value) -> Option<Value> {
        if !Self::is_cachable(method) {
            return None;
        }
        let key = Self::key(method, params);
        let entries = self.inner.entries.read().await;
        match entries.get(&key) {
            Some(entry) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                debug!(method, "{}", CACHE_HIT_MARKER);
                Some(entry.value.clone())
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 写入缓存并启动淘汰任务；同一键的后写者覆盖先写者
    pub async fn insert(&self, method: &str, params: &Value, value: Value, owner: &CancelToken) {
        if !Self::is_cachable(method) {
            return;
        }
        let key = Self::key(method, params);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut entries = self.inner.entries.write().await;
            entries.insert(key.clone(), CacheEntry { value, generation });
        }

        let inner = Arc::clone(&self.inner);
        let owner = owner.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = tokio::time::sleep(inner.ttl) => EvictionReason::Timeout,
                _ = owner.cancelled() => EvictionReason::Cancelled,
            };
            let mut entries = inner.entries.write().await;
            // 条目可能已被更新的写入替换，只删除自己负责的那一代
            if entries.get(&key).map(|e| e.generation) == Some(generation) {
                entries.remove(&key);
                debug!(method = %key.0, reason = reason.as_str(), "flushing cache entry");
            }
        });
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hit_after_insert() {
        let cache = ResponseCache::new(Duration::from_secs(5));
        let owner = CancelToken::new();
        let params = json!(["abcd", true]);

        assert!(cache.get("getrawtransaction", &params).await.is_none());
        cache
            .insert("getrawtransaction", &params, json!({"txid": "abcd"}), &owner)
            .await;
        assert_eq!(
            cache.get("getrawtransaction", &params).await,
            Some(json!({"txid": "abcd"}))
        );
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_non_cachable_method_is_ignored() {
        let cache = ResponseCache::default();
        let owner = CancelToken::new();
        cache.insert("getblockcount", &json!([]), json!(100), &owner).await;
        assert!(cache.is_empty().await);
        assert!(cache.get("getblockcount", &json!([])).await.is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        // 测试 TTL 到期后条目被删除
        let cache = ResponseCache::new(Duration::from_millis(50));
        let owner = CancelToken::new();
        let params = json!(["00ff"]);
        cache.insert("getblock", &params, json!({"height": 1}), &owner).await;
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get("getblock", &params).await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_evicts_immediately() {
        // 测试所属令牌取消后条目立即被删除
        let cache = ResponseCache::new(Duration::from_secs(60));
        let owner = CancelToken::new();
        let params = json!(["00ff"]);
        cache.insert("getblock", &params, json!({"height": 1}), &owner).await;

        owner.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_eviction_keeps_newer_entry() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let first_owner = CancelToken::new();
        let second_owner = CancelToken::new();
        let params = json!(["00ff"]);

        cache.insert("getblock", &params, json!({"height": 1}), &first_owner).await;
        cache.insert("getblock", &params, json!({"height": 2}), &second_owner).await;

        first_owner.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            cache.get("getblock", &params).await,
            Some(json!({"height": 2}))
        );
    }
}
