//! 网络探测
//!
//! 未指定网络时在后台反复查询 getblockchaininfo，直到拿到网络名称。
//! 需要网络信息的调用方等待探测完成或取消信号，不会读到过期值。

use crate::domain::address::Chain;
use crate::service::cancel::CancelToken;
use crate::service::node_api::NodeApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 退避步长
pub const PROBE_BACKOFF_STEP: Duration = Duration::from_millis(250);
/// 退避倍数上限
pub const PROBE_BACKOFF_MAX_STEPS: u32 = 10;

/// 网络探测器
pub struct ChainDetector {
    name: watch::Sender<Option<String>>,
    cancel: CancelToken,
}

impl ChainDetector {
    /// 网络已由配置指定，不启动探测
    pub fn pinned(chain: Chain, cancel: CancelToken) -> Arc<Self> {
        let (name, _rx) = watch::channel(Some(chain.as_str().to_string()));
        Arc::new(Self { name, cancel })
    }

    /// 启动后台探测
    pub fn spawn(node: NodeApi, cancel: CancelToken) -> Arc<Self> {
        let (name, _rx) = watch::channel(None);
        let detector = Arc::new(Self { name, cancel });
        let task = Arc::clone(&detector);
        tokio::spawn(async move { task.probe_loop(node).await });
        detector
    }

    fn backoff(attempt: u32) -> Duration {
        PROBE_BACKOFF_STEP * attempt.min(PROBE_BACKOFF_MAX_STEPS)
    }

    async fn probe_loop(&self, node: NodeApi) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                debug!("网络探测已取消");
                return;
            }
            match node.get_blockchain_info().await {
                Ok(info) => {
                    info!(chain = %info.chain, "检测到节点网络");
                    self.name.send_replace(Some(info.chain));
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = Self::backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "网络探测失败，稍后重试");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            debug!("网络探测已取消");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// 当前已知的网络名称，不等待
    pub fn current_name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    /// 等待探测完成；取消时返回 None
    pub async fn chain_name(&self) -> Option<String> {
        let mut rx = self.name.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// 等待探测完成并解析为已知网络；未知名称按回归测试网处理
    pub async fn chain(&self) -> Option<Chain> {
        let name = self.chain_name().await?;
        match name.parse::<Chain>() {
            Ok(chain) => Some(chain),
            Err(_) => {
                warn!(chain = %name, "未知网络名称，按 regtest 处理");
                Some(Chain::Regtest)
            }
        }
    }

    /// 对外的链 ID：main 81、test 8889、regtest 及未知 8890
    pub async fn chain_id(&self) -> u64 {
        self.chain().await.unwrap_or(Chain::Regtest).chain_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::NodeError;
    use crate::infrastructure::mock_node::MockNode;
    use crate::infrastructure::response_cache::ResponseCache;
    use serde_json::json;

    fn api(node: &MockNode) -> NodeApi {
        NodeApi::new(Arc::new(node.clone()), ResponseCache::default(), CancelToken::new())
    }

    #[tokio::test]
    async fn test_pinned_chain_skips_detection() {
        let node = MockNode::new();
        let detector = ChainDetector::pinned(Chain::Main, CancelToken::new());
        assert_eq!(detector.chain().await, Some(Chain::Main));
        assert_eq!(detector.chain_id().await, 81);
        assert_eq!(node.call_count("getblockchaininfo").await, 0);
    }

    #[tokio::test]
    async fn test_detects_after_failures() {
        // 前两次失败后成功探测
        let node = MockNode::new();
        node.push_reply("getblockchaininfo", Err(NodeError::Transport("refused".into()))).await;
        node.push_reply("getblockchaininfo", Err(NodeError::Transport("refused".into()))).await;
        node.set_response("getblockchaininfo", json!({"chain": "test", "blocks": 10})).await;

        let detector = ChainDetector::spawn(api(&node), CancelToken::new());
        let chain = tokio::time::timeout(Duration::from_secs(3), detector.chain())
            .await
            .expect("网络探测超时");
        assert_eq!(chain, Some(Chain::Test));
        assert_eq!(detector.chain_id().await, 8889);
        assert_eq!(node.call_count("getblockchaininfo").await, 3);
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let node = MockNode::new();
        node.set_error("getblockchaininfo", NodeError::Transport("refused".into())).await;
        let cancel = CancelToken::new();
        let detector = ChainDetector::spawn(api(&node), cancel.clone());

        let waiter = {
            let detector = Arc::clone(&detector);
            tokio::spawn(async move { detector.chain().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("取消后等待者未被释放")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_unknown_chain_maps_to_regtest_id() {
        let node = MockNode::new();
        node.set_response("getblockchaininfo", json!({"chain": "signet"})).await;
        let detector = ChainDetector::spawn(api(&node), CancelToken::new());
        assert_eq!(detector.chain_id().await, 8890);
        assert_eq!(detector.current_name().as_deref(), Some("signet"));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(ChainDetector::backoff(1), Duration::from_millis(250));
        assert_eq!(ChainDetector::backoff(4), Duration::from_millis(1000));
        assert_eq!(ChainDetector::backoff(50), Duration::from_millis(2500));
    }
}
