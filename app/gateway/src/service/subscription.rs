//! 日志订阅（eth_subscribe("logs")）
//!
//! 每个订阅一个后台轮询任务：waitforlogs 长轮询拿到新区块后，
//! 用 searchlogs 取出该区块的日志，重新过滤、去重后推送给连接。
//! 节点返回过快时按滚动窗口计为失败并线性退避。

use crate::domain::address::Chain;
use crate::domain::eth_types::EthLog;
use crate::domain::log_filter::LogFilter;
use crate::service::cancel::CancelToken;
use crate::service::chain_detector::ChainDetector;
use crate::service::log_search;
use crate::service::node_api::NodeApi;
use lru::LruCache;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// 失败次数达到该值后退避取最大值
const MAX_BACKOFF_STEPS: u32 = 10;

/// 轮询节奏参数
#[derive(Debug, Clone)]
pub struct PollingPolicy {
    /// 两次调用之间的最小间隔
    pub min_call_interval: Duration,
    pub max_backoff: Duration,
    /// 滚动窗口内允许的调用次数
    pub window_calls: usize,
    pub window: Duration,
    /// 去重窗口容量
    pub dedup_capacity: usize,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            min_call_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(15),
            window_calls: 5,
            window: Duration::from_secs(10),
            dedup_capacity: 4096,
        }
    }
}

/// 线性退避：0 次失败不等待，超过上限取最大值
pub fn backoff(failures: u32, max: Duration) -> Duration {
    match failures {
        0 => Duration::ZERO,
        n if n > MAX_BACKOFF_STEPS => max,
        n => max / MAX_BACKOFF_STEPS * n,
    }
}

/// 记录最近 N 次调用的开始时间
#[derive(Debug)]
pub struct RollingWindow {
    times: VecDeque<Instant>,
    limit: usize,
}

impl RollingWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            times: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, at: Instant) {
        if self.times.len() == self.limit {
            self.times.pop_front();
        }
        self.times.push_back(at);
    }

    /// 窗口已满且最早一次调用距今不足 `window`
    pub fn saturated(&self, window: Duration, now: Instant) -> bool {
        match self.times.front() {
            Some(oldest) if self.times.len() == self.limit => now.duration_since(*oldest) < window,
            _ => false,
        }
    }
}

/// 固定容量的去重窗口；重复命中不刷新位置，淘汰顺序即插入顺序
pub struct DedupWindow {
    seen: LruCache<[u8; 32], ()>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// 首次出现返回 true；超出容量时淘汰最早的哈希
    pub fn insert(&mut self, hash: [u8; 32]) -> bool {
        if self.seen.contains(&hash) {
            return false;
        }
        self.seen.put(hash, ());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn notification_hash(params: &Value) -> [u8; 32] {
    let digest = Keccak256::digest(params.to_string().as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// 构造 eth_subscription 通知
pub fn notification(subscription: &str, log: &EthLog) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "eth_subscription",
        "params": {
            "subscription": subscription,
            "result": log,
        }
    })
}

/// 单个日志订阅
pub struct Subscription {
    id: String,
    filter: LogFilter,
    sink: mpsc::UnboundedSender<Value>,
    node: NodeApi,
    chain: Arc<ChainDetector>,
    policy: PollingPolicy,
    cancel: CancelToken,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 运行轮询循环；同一订阅已在运行时立即返回
    pub async fn run(self: Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(subscription = %self.id, "订阅已在运行");
            return;
        }
        let _guard = RunningGuard(&self.running);
        self.pump().await;
        debug!(subscription = %self.id, "订阅结束");
    }

    async fn pump(&self) {
        let min_confirmations = match self.chain.chain().await {
            Some(Chain::Test) | Some(Chain::Regtest) => Some(0),
            Some(Chain::Main) => None,
            None => return,
        };

        let mut next_block: Option<u64> = None;
        let mut rolling = RollingWindow::new(self.policy.window_calls);
        let mut dedup = DedupWindow::new(self.policy.dedup_capacity);
        let mut failures: u32 = 0;

        loop {
            let started = Instant::now();
            rolling.push(started);
            // 进行中的调用不被打断，返回后再检查取消
            let result = self
                .node
                .wait_for_logs(next_block, &self.filter, min_confirmations)
                .await;
            let elapsed = started.elapsed();

            match result {
                Ok(resp) => {
                    next_block = Some(resp.nextblock);
                    let height = resp.nextblock.saturating_sub(1);
                    let logs = match log_search::search(&self.node, height, height, &self.filter).await {
                        Ok(logs) => logs,
                        Err(e) => {
                            warn!(subscription = %self.id, error = %e, "searchlogs 失败，终止订阅");
                            return;
                        }
                    };
                    for log in &logs {
                        let message = notification(&self.id, log);
                        if !dedup.insert(notification_hash(&message["params"])) {
                            continue;
                        }
                        debug!(subscription = %self.id, "推送日志通知");
                        if self.sink.send(message).is_err() {
                            debug!(subscription = %self.id, "连接已关闭");
                            return;
                        }
                    }
                    if rolling.saturated(self.policy.window, Instant::now()) {
                        failures += 1;
                    } else {
                        failures = 0;
                    }
                }
                Err(e) => {
                    debug!(subscription = %self.id, error = %e, "waitforlogs 失败");
                    failures += 1;
                }
            }

            if self.cancel.is_cancelled() {
                debug!(subscription = %self.id, "订阅已取消");
                return;
            }

            let mut delay = backoff(failures, self.policy.max_backoff);
            if elapsed < self.policy.min_call_interval {
                delay = delay.max(self.policy.min_call_interval - elapsed);
            }
            if failures > 0 {
                debug!(subscription = %self.id, delay_ms = delay.as_millis() as u64, "订阅退避");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(subscription = %self.id, "订阅已取消");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// 订阅管理
pub struct SubscriptionEngine {
    node: NodeApi,
    chain: Arc<ChainDetector>,
    policy: PollingPolicy,
    subscriptions: Arc<RwLock<HashMap<String, Arc<Subscription>>>>,
}

impl SubscriptionEngine {
    pub fn new(node: NodeApi, chain: Arc<ChainDetector>, policy: PollingPolicy) -> Self {
        Self {
            node,
            chain,
            policy,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 创建日志订阅并启动轮询任务，订阅随 `owner` 取消而结束
    pub async fn subscribe(
        &self,
        filter: LogFilter,
        sink: mpsc::UnboundedSender<Value>,
        owner: &CancelToken,
    ) -> String {
        let id = format!("0x{}", Uuid::new_v4().simple());
        let cancel = owner.child();
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            filter,
            sink,
            node: self.node.with_owner(cancel.clone()),
            chain: Arc::clone(&self.chain),
            policy: self.policy.clone(),
            cancel,
            running: AtomicBool::new(false),
        });
        self.subscriptions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&subscription));
        let registry = Arc::clone(&self.subscriptions);
        let finished = id.clone();
        tokio::spawn(async move {
            subscription.run().await;
            // 轮询自行结束时（如 searchlogs 失败）注销订阅
            if registry.write().await.remove(&finished).is_some() {
                debug!(subscription = %finished, "订阅已注销");
            }
        });
        debug!(subscription = %id, "创建日志订阅");
        id
    }

    /// 取消订阅，返回订阅是否存在
    pub async fn unsubscribe(&self, id: &str) -> bool {
        match self.subscriptions.write().await.remove(id) {
            Some(subscription) => {
                subscription.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscriptions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::NodeError;
    use crate::infrastructure::mock_node::MockNode;
    use crate::infrastructure::response_cache::ResponseCache;

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let max = Duration::from_secs(15);
        assert_eq!(backoff(0, max), Duration::ZERO);
        assert_eq!(backoff(1, max), Duration::from_millis(1500));
        assert_eq!(backoff(10, max), max);
        assert_eq!(backoff(11, max), max);
    }

    #[test]
    fn test_rolling_window_saturates_only_when_full() {
        let start = Instant::now();
        let mut window = RollingWindow::new(3);
        window.push(start);
        window.push(start);
        assert!(!window.saturated(Duration::from_secs(10), start));
        window.push(start);
        assert!(window.saturated(Duration::from_secs(10), start));
        assert!(!window.saturated(Duration::from_secs(10), start + Duration::from_secs(11)));
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut dedup = DedupWindow::new(2);
        assert!(dedup.insert([1; 32]));
        assert!(!dedup.insert([1; 32]));
        assert!(dedup.insert([2; 32]));
        assert!(dedup.insert([3; 32]));
        assert_eq!(dedup.len(), 2);
        // 超出窗口后允许重新推送
        assert!(dedup.insert([1; 32]));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_polling() {
        let node = MockNode::new();
        node.set_response("waitforlogs", json!({"entries": [], "count": 0, "nextblock": 5})).await;
        node.set_response("searchlogs", json!([])).await;

        let owner = CancelToken::new();
        let api = NodeApi::new(Arc::new(node.clone()), ResponseCache::default(), owner.clone());
        let chain = ChainDetector::pinned(Chain::Regtest, owner.clone());
        let engine = SubscriptionEngine::new(api, chain, PollingPolicy::default());

        let (tx, _rx) = mpsc::unbounded_channel();
        let id = engine.subscribe(LogFilter::default(), tx, &owner).await;
        assert!(id.starts_with("0x"));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(engine.unsubscribe(&id).await);
        assert!(!engine.unsubscribe(&id).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let settled = node.call_count("waitforlogs").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.call_count("waitforlogs").await, settled);
        assert!(settled >= 2);

        // regtest 下 minconf 为 0
        let calls = node.calls().await;
        let (_, params) = calls.iter().find(|(m, _)| m == "waitforlogs").unwrap();
        assert_eq!(params[2]["minconf"], json!(0));
    }

    #[tokio::test]
    async fn test_failed_search_removes_subscription() {
        // 测试 searchlogs 失败导致轮询结束后，订阅从引擎中注销
        let node = MockNode::new();
        node.set_response("waitforlogs", json!({"entries": [], "count": 0, "nextblock": 5})).await;
        node.set_error("searchlogs", NodeError::Transport("connection reset".to_string())).await;

        let owner = CancelToken::new();
        let api = NodeApi::new(Arc::new(node.clone()), ResponseCache::default(), owner.clone());
        let chain = ChainDetector::pinned(Chain::Regtest, owner.clone());
        let engine = SubscriptionEngine::new(api, chain, PollingPolicy::default());

        let (tx, _rx) = mpsc::unbounded_channel();
        let id = engine.subscribe(LogFilter::default(), tx, &owner).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(node.call_count("searchlogs").await >= 1);
        assert!(engine.is_empty().await);
        assert!(!engine.unsubscribe(&id).await);
        // 不再继续轮询
        let settled = node.call_count("waitforlogs").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(node.call_count("waitforlogs").await, settled);
    }
}
