//! 节点 API
//!
//! 所有节点调用的统一入口：先查响应缓存，再经传输层调用；
//! 钱包类哨兵错误交给错误恢复状态机，恢复成功后重试一次；
//! 读路径上的“队列已满 / 稍后重试”错误按固定间隔有限重试。

use crate::domain::error::{NodeError, NodeErrorKind};
use crate::domain::log_filter::LogFilter;
use crate::domain::native_types::{
    AccountInfo, AddressBalance, BlockchainInfo, CallContractResult, ContractReceipt,
    ContractTxResult, DecodedTransaction, NativeBlock, RawTransaction, WaitForLogsResult,
    WalletTransaction,
};
use crate::infrastructure::node_client::NodeTransport;
use crate::infrastructure::response_cache::ResponseCache;
use crate::service::cancel::CancelToken;
use crate::service::error_recovery::{ErrorRecovery, RecoveryError};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 读路径重试次数
pub const BUSY_RETRY_ATTEMPTS: usize = 5;
/// 读路径重试间隔
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

/// 节点调用成功/失败计数，供健康检查使用
#[derive(Debug, Default)]
pub struct NodeStats {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl NodeStats {
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// getstorage 的返回：槽位哈希 → { 槽位 → 值 }
pub type StorageMap = HashMap<String, HashMap<String, String>>;

/// 节点 API（可克隆，克隆共享缓存、恢复状态与计数）
#[derive(Clone)]
pub struct NodeApi {
    transport: Arc<dyn NodeTransport>,
    cache: ResponseCache,
    recovery: Arc<ErrorRecovery>,
    stats: Arc<NodeStats>,
    /// 缓存条目归属的取消令牌
    owner: CancelToken,
}

impl NodeApi {
    pub fn new(transport: Arc<dyn NodeTransport>, cache: ResponseCache, owner: CancelToken) -> Self {
        let recovery = Arc::new(ErrorRecovery::new(Arc::clone(&transport)));
        Self {
            transport,
            cache,
            recovery,
            stats: Arc::new(NodeStats::default()),
            owner,
        }
    }

    /// 以另一个令牌作为缓存归属，其余状态共享
    pub fn with_owner(&self, owner: CancelToken) -> Self {
        Self {
            owner,
            ..self.clone()
        }
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn recovery(&self) -> &ErrorRecovery {
        &self.recovery
    }

    /// 发起一次节点调用（经过缓存与错误恢复）
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        if let Some(hit) = self.cache.get(method, &params).await {
            return Ok(hit);
        }

        let result = match self.transport.request(method, params.clone()).await {
            Err(err) if self.recovery.procedure_for(&err).is_some() => {
                self.recover_and_retry(method, &params, err).await
            }
            other => other,
        };

        match &result {
            Ok(value) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                self.cache.insert(method, &params, value.clone(), &self.owner).await;
            }
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!(method, error = %err, "节点调用失败");
            }
        }
        result
    }

    async fn recover_and_retry(
        &self,
        method: &str,
        params: &Value,
        original: NodeError,
    ) -> Result<Value, NodeError> {
        match self.recovery.recover(&original).await {
            Ok(outcome) => {
                info!(method, ?outcome, "错误恢复完成，重试请求");
                self.transport.request(method, params.clone()).await
            }
            Err(RecoveryError::AlreadyRunning) => Err(original),
            Err(e) => {
                warn!(method, error = %e, "错误恢复失败");
                Err(original)
            }
        }
    }

    /// 读路径调用：队列已满或节点预热时有限重试
    pub async fn call_with_retry(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let mut attempt = 1;
        loop {
            match self.call(method, params.clone()).await {
                Err(err)
                    if attempt < BUSY_RETRY_ATTEMPTS
                        && matches!(
                            err.kind(),
                            Some(NodeErrorKind::WorkQueueDepth) | Some(NodeErrorKind::TryAgainLater)
                        ) =>
                {
                    debug!(method, attempt, error = %err, "节点繁忙，稍后重试");
                    attempt += 1;
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, NodeError> {
        let value = self.call(method, params).await?;
        decode(method, value)
    }

    async fn call_typed_with_retry<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, NodeError> {
        let value = self.call_with_retry(method, params).await?;
        decode(method, value)
    }

    // ========================================================================
    // 交易与区块
    // ========================================================================

    pub async fn get_transaction(&self, txid: &str) -> Result<WalletTransaction, NodeError> {
        self.call_typed("gettransaction", json!([txid])).await
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, NodeError> {
        self.call_typed("getrawtransaction", json!([txid, true])).await
    }

    pub async fn decode_raw_transaction(&self, hex: &str) -> Result<DecodedTransaction, NodeError> {
        self.call_typed("decoderawtransaction", json!([hex])).await
    }

    pub async fn get_block(&self, hash: &str) -> Result<NativeBlock, NodeError> {
        self.call_typed("getblock", json!([hash])).await
    }

    pub async fn get_block_count(&self) -> Result<u64, NodeError> {
        self.call_typed_with_retry("getblockcount", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, NodeError> {
        self.call_typed_with_retry("getblockhash", json!([height])).await
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, NodeError> {
        self.call_typed_with_retry("getblockchaininfo", json!([])).await
    }

    pub async fn get_transaction_receipt(&self, txid: &str) -> Result<Vec<ContractReceipt>, NodeError> {
        self.call_typed("gettransactionreceipt", json!([txid])).await
    }

    // ========================================================================
    // 日志
    // ========================================================================

    fn log_filter_params(filter: &LogFilter) -> (Value, Value) {
        (
            json!({ "addresses": filter.search_addresses() }),
            json!({ "topics": filter.search_topics() }),
        )
    }

    pub async fn search_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
        min_confirmations: Option<u64>,
    ) -> Result<Vec<ContractReceipt>, NodeError> {
        let (addresses, topics) = Self::log_filter_params(filter);
        let mut params = vec![json!(from), json!(to), addresses, topics];
        if let Some(minconf) = min_confirmations {
            params.push(json!(minconf));
        }
        self.call_typed("searchlogs", Value::Array(params)).await
    }

    pub async fn wait_for_logs(
        &self,
        from: Option<u64>,
        filter: &LogFilter,
        min_confirmations: Option<u64>,
    ) -> Result<WaitForLogsResult, NodeError> {
        let mut filter_obj = json!({
            "addresses": filter.search_addresses(),
            "topics": filter.search_topics(),
        });
        if let Some(minconf) = min_confirmations {
            filter_obj["minconf"] = json!(minconf);
        }
        self.call_typed("waitforlogs", json!([from, Value::Null, filter_obj])).await
    }

    // ========================================================================
    // 合约与账户
    // ========================================================================

    pub async fn call_contract(
        &self,
        contract: &str,
        data: &str,
        sender: Option<&str>,
        gas_limit: Option<u64>,
    ) -> Result<CallContractResult, NodeError> {
        let mut params = vec![json!(contract), json!(data)];
        if sender.is_some() || gas_limit.is_some() {
            params.push(sender.map(Value::from).unwrap_or(Value::Null));
        }
        if let Some(gas) = gas_limit {
            params.push(json!(gas));
        }
        self.call_typed("callcontract", Value::Array(params)).await
    }

    pub async fn get_account_info(&self, hex_address: &str) -> Result<AccountInfo, NodeError> {
        self.call_typed("getaccountinfo", json!([hex_address])).await
    }

    pub async fn get_address_balance(&self, native_address: &str) -> Result<AddressBalance, NodeError> {
        self.call_typed("getaddressbalance", json!([{ "addresses": [native_address] }]))
            .await
    }

    pub async fn get_storage(&self, hex_address: &str, block: Option<u64>) -> Result<StorageMap, NodeError> {
        let params = match block {
            Some(height) => json!([hex_address, height]),
            None => json!([hex_address]),
        };
        self.call_typed("getstorage", params).await
    }

    // ========================================================================
    // 发送交易
    // ========================================================================

    pub async fn send_raw_transaction(&self, hex: &str) -> Result<String, NodeError> {
        self.call_typed("sendrawtransaction", json!([hex])).await
    }

    pub async fn send_to_address(
        &self,
        native_address: &str,
        amount: &str,
        sender: Option<&str>,
    ) -> Result<String, NodeError> {
        let params = match sender {
            // sendtoaddress 的第 10 个参数为 senderaddress，之前的可选参数保持默认
            Some(from) => json!([
                native_address, amount, "", "", false, Value::Null, Value::Null, Value::Null, Value::Null, from, true
            ]),
            None => json!([native_address, amount]),
        };
        self.call_typed("sendtoaddress", params).await
    }

    pub async fn send_to_contract(
        &self,
        contract: &str,
        data: &str,
        amount: &str,
        gas_limit: u64,
        gas_price: &str,
        sender: Option<&str>,
    ) -> Result<ContractTxResult, NodeError> {
        let mut params = vec![json!(contract), json!(data), json!(amount), json!(gas_limit), json!(gas_price)];
        if let Some(from) = sender {
            params.push(json!(from));
        }
        self.call_typed("sendtocontract", Value::Array(params)).await
    }

    pub async fn create_contract(
        &self,
        bytecode: &str,
        gas_limit: u64,
        gas_price: &str,
        sender: Option<&str>,
    ) -> Result<ContractTxResult, NodeError> {
        let mut params = vec![json!(bytecode), json!(gas_limit), json!(gas_price)];
        if let Some(from) = sender {
            params.push(json!(from));
        }
        self.call_typed("createcontract", Value::Array(params)).await
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, NodeError> {
    serde_json::from_value(value).map_err(|e| NodeError::Decode(format!("{}: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock_node::MockNode;

    fn api(node: &MockNode) -> NodeApi {
        NodeApi::new(Arc::new(node.clone()), ResponseCache::default(), CancelToken::new())
    }

    #[tokio::test]
    async fn test_cachable_call_hits_cache() {
        // 可缓存方法的第二次调用不访问节点
        let node = MockNode::new();
        node.set_response("getblock", json!({"hash": "00aa", "height": 7, "tx": []})).await;
        let api = api(&node);

        let first = api.get_block("00aa").await.unwrap();
        let second = api.get_block("00aa").await.unwrap();
        assert_eq!(first.height, 7);
        assert_eq!(second.height, 7);
        assert_eq!(node.call_count("getblock").await, 1);
        assert_eq!(api.cache().hits(), 1);
    }

    #[tokio::test]
    async fn test_cached_response_expires_after_ttl() {
        // 测试缓存条目在有效期后失效，再次调用重新访问节点
        let node = MockNode::new();
        node.set_response("getblock", json!({"hash": "00bb", "height": 1})).await;
        let api = NodeApi::new(
            Arc::new(node.clone()),
            ResponseCache::new(Duration::from_millis(50)),
            CancelToken::new(),
        );

        api.get_block("00bb").await.unwrap();
        api.get_block("00bb").await.unwrap();
        assert_eq!(node.call_count("getblock").await, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(api.get_block("00bb").await.unwrap().height, 1);
        assert_eq!(node.call_count("getblock").await, 2);
    }

    #[tokio::test]
    async fn test_non_cachable_call_goes_upstream() {
        let node = MockNode::new();
        node.set_response("getblockcount", json!(12)).await;
        let api = api(&node);

        assert_eq!(api.get_block_count().await.unwrap(), 12);
        assert_eq!(api.get_block_count().await.unwrap(), 12);
        assert_eq!(node.call_count("getblockcount").await, 2);
        assert_eq!(api.stats().successes(), 2);
    }

    #[tokio::test]
    async fn test_busy_read_is_retried() {
        let node = MockNode::new();
        node.push_reply("getblockcount", Err(NodeError::WorkQueueDepth)).await;
        node.push_reply("getblockcount", Err(NodeError::rpc(-28, "Loading block index..."))).await;
        node.set_response("getblockcount", json!(99)).await;
        let api = api(&node);

        assert_eq!(api.get_block_count().await.unwrap(), 99);
        assert_eq!(node.call_count("getblockcount").await, 3);
        assert_eq!(api.stats().failures(), 2);
    }

    #[tokio::test]
    async fn test_busy_retry_is_bounded() {
        let node = MockNode::new();
        node.set_error("getblockcount", NodeError::WorkQueueDepth).await;
        let api = api(&node);

        assert!(matches!(api.get_block_count().await, Err(NodeError::WorkQueueDepth)));
        assert_eq!(node.call_count("getblockcount").await, BUSY_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_wallet_error_is_recovered_and_retried() {
        // 钱包错误触发恢复，恢复后原请求重试一次
        let node = MockNode::new();
        node.push_reply("gettransaction", Err(NodeError::rpc(-18, "Requested wallet does not exist or is not loaded")))
            .await;
        node.set_response("gettransaction", json!({"txid": "ab", "blockhash": "00"})).await;
        node.set_response("listwallets", json!(["wallet"])).await;
        let api = api(&node);

        let tx = api.get_transaction("ab").await.unwrap();
        assert_eq!(tx.txid, "ab");
        assert_eq!(node.call_count("gettransaction").await, 2);
        assert_eq!(node.call_count("listwallets").await, 1);
    }

    #[tokio::test]
    async fn test_failed_recovery_surfaces_original_error() {
        let node = MockNode::new();
        node.set_error("gettransaction", NodeError::rpc(-19, "Wallet file not specified")).await;
        node.set_error("listwallets", NodeError::Transport("connection refused".into())).await;
        let api = api(&node);

        let err = api.get_transaction("ab").await.unwrap_err();
        assert!(err.is(NodeErrorKind::WalletNotSpecified));
        assert_eq!(node.call_count("gettransaction").await, 1);
    }

    #[tokio::test]
    async fn test_search_logs_params() {
        let node = MockNode::new();
        node.set_response("searchlogs", json!([])).await;
        let api = api(&node);
        let filter = LogFilter::new(vec!["0xAB".to_string()], vec![vec!["0x01".to_string()]]);

        api.search_logs(5, 9, &filter, Some(0)).await.unwrap();
        let calls = node.calls().await;
        assert_eq!(
            calls[0].1,
            json!([5, 9, {"addresses": ["ab"]}, {"topics": ["01"]}, 0])
        );
    }
}
