//! 脚本化的内存节点
//!
//! 用于测试和开发的 `NodeTransport` 实现：按方法或（方法，参数）预置响应，
//! 支持一次性排队响应、人为延迟和调用计数。

use crate::domain::error::{node_codes, NodeError};
use crate::infrastructure::node_client::NodeTransport;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

type Reply = Result<Value, NodeError>;

#[derive(Default)]
struct MockState {
    by_method: HashMap<String, Reply>,
    by_params: HashMap<(String, String), Reply>,
    queued: HashMap<String, VecDeque<Reply>>,
    delays: HashMap<String, Duration>,
    calls: Vec<(String, Value)>,
}

/// 模拟节点（支持 Clone，克隆共享同一状态）
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<RwLock<MockState>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为方法设置默认响应
    pub async fn set_response(&self, method: &str, value: Value) {
        self.state
            .write()
            .await
            .by_method
            .insert(method.to_string(), Ok(value));
    }

    /// 为方法设置默认错误
    pub async fn set_error(&self, method: &str, error: NodeError) {
        self.state
            .write()
            .await
            .by_method
            .insert(method.to_string(), Err(error));
    }

    /// 为特定参数设置响应，优先于方法级响应
    pub async fn set_response_for(&self, method: &str, params: Value, value: Value) {
        self.state
            .write()
            .await
            .by_params
            .insert((method.to_string(), params.to_string()), Ok(value));
    }

    pub async fn set_error_for(&self, method: &str, params: Value, error: NodeError) {
        self.state
            .write()
            .await
            .by_params
            .insert((method.to_string(), params.to_string()), Err(error));
    }

    /// 排队一次性响应，优先级最高
    pub async fn push_reply(&self, method: &str, reply: Result<Value, NodeError>) {
        self.state
            .write()
            .await
            .queued
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    /// 为方法设置响应延迟
    pub async fn set_delay(&self, method: &str, delay: Duration) {
        self.state
            .write()
            .await
            .delays
            .insert(method.to_string(), delay);
    }

    /// 某方法被调用的次数
    pub async fn call_count(&self, method: &str) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// 全部调用记录
    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.state.read().await.calls.clone()
    }
}

#[async_trait]
impl NodeTransport for MockNode {
    async fn request(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let (reply, delay) = {
            let mut state = self.state.write().await;
            state.calls.push((method.to_string(), params.clone()));

            let queued = state
                .queued
                .get_mut(method)
                .and_then(VecDeque::pop_front);
            let reply = match queued {
                Some(reply) => reply,
                None => state
                    .by_params
                    .get(&(method.to_string(), params.to_string()))
                    .or_else(|| state.by_method.get(method))
                    .cloned()
                    .unwrap_or_else(|| {
                        Err(NodeError::rpc(node_codes::METHOD_NOT_FOUND, "Method not found"))
                    }),
            };
            (reply, state.delays.get(method).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_priority() {
        // 排队响应 > 参数级响应 > 方法级响应
        let node = MockNode::new();
        node.set_response("getblockcount", json!(10)).await;
        node.set_response_for("getblockcount", json!([]), json!(20)).await;
        node.push_reply("getblockcount", Ok(json!(30))).await;

        assert_eq!(node.request("getblockcount", json!([])).await.unwrap(), json!(30));
        assert_eq!(node.request("getblockcount", json!([])).await.unwrap(), json!(20));
        assert_eq!(node.request("getblockcount", json!(null)).await.unwrap(), json!(10));
        assert_eq!(node.call_count("getblockcount").await, 3);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let node = MockNode::new();
        let err = node.request("nosuchmethod", json!([])).await.unwrap_err();
        assert!(matches!(err, NodeError::Rpc { code: -32601, .. }));
    }
}
