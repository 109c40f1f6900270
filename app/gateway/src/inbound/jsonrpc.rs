//! 以太坊 JSON-RPC 方法分发
//!
//! 把以太坊方法翻译为节点调用：交易/收据经由交易解析器，
//! 日志与过滤器经由日志检索，订阅经由订阅引擎（仅 WebSocket）。

use crate::domain::address::{self, AddressError, Chain};
use crate::domain::amount::{gas_price_to_native, satoshi_to_wei, AmountError, NativeAmount, WEI_PER_SATOSHI};
use crate::domain::error::{NodeError, NodeErrorKind};
use crate::domain::eth_types::{format_quantity, BlockNumberOrTag, CallRequest};
use crate::domain::log_filter::{FilterParams, LogFilter};
use crate::inbound::json_types::{error_codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::service::cancel::CancelToken;
use crate::service::chain_detector::ChainDetector;
use crate::service::filters::{FilterError, FilterRegistry};
use crate::service::log_search::{self, LogSearchError};
use crate::service::node_api::NodeApi;
use crate::service::subscription::SubscriptionEngine;
use crate::service::transaction_resolver::{ResolveError, TransactionResolver, NON_CONTRACT_VM_GAS};
use ethereum_types::{H160, H256, U256};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// eth_call 允许的最大 gas
pub const MAX_CALL_GAS: u64 = 40_000_000;
/// eth_sendTransaction 未给出 gas 时的默认 gas 限制
pub const DEFAULT_GAS_LIMIT: u64 = 250_000;
/// 空的存储槽
const EMPTY_STORAGE_SLOT: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

// ============================================================================
// WebSocket 会话
// ============================================================================

/// 一个 WebSocket 连接：通知出口、连接级取消令牌与其订阅
pub struct WsSession {
    sink: mpsc::UnboundedSender<Value>,
    owner: CancelToken,
    subscriptions: Mutex<Vec<String>>,
}

impl WsSession {
    pub fn new(sink: mpsc::UnboundedSender<Value>, owner: CancelToken) -> Self {
        Self {
            sink,
            owner,
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

// ============================================================================
// 用例层 - JSON-RPC 方法处理器
// ============================================================================

/// JSON-RPC 主处理器
pub struct EthJsonRpcHandler {
    node: NodeApi,
    chain: Arc<ChainDetector>,
    resolver: TransactionResolver,
    filters: FilterRegistry,
    subscriptions: Arc<SubscriptionEngine>,
    min_gas_price: NativeAmount,
}

impl EthJsonRpcHandler {
    pub fn new(
        node: NodeApi,
        chain: Arc<ChainDetector>,
        subscriptions: Arc<SubscriptionEngine>,
        min_gas_price: NativeAmount,
    ) -> Self {
        Self {
            resolver: TransactionResolver::new(node.clone()),
            filters: FilterRegistry::new(node.clone()),
            node,
            chain,
            subscriptions,
            min_gas_price,
        }
    }

    pub fn node(&self) -> &NodeApi {
        &self.node
    }

    /// 处理一个请求体：单个请求或批量请求，批量结果保持请求顺序
    pub async fn handle_payload(&self, payload: Value, session: Option<&WsSession>) -> Value {
        match payload {
            Value::Array(items) if items.is_empty() => to_json(&JsonRpcResponse::error(
                RequestId::Null,
                JsonRpcError::new(error_codes::INVALID_REQUEST, "空的批量请求"),
            )),
            Value::Array(items) => {
                let responses = join_all(items.into_iter().map(|item| self.handle_value(item, session))).await;
                Value::Array(responses.iter().map(to_json).collect())
            }
            single => to_json(&self.handle_value(single, session).await),
        }
    }

    /// 处理单个 JSON 值；无法解析为请求时返回无效请求错误
    pub async fn handle_value(&self, value: Value, session: Option<&WsSession>) -> JsonRpcResponse {
        let id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
            .unwrap_or_default();
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle(request, session).await,
            Err(e) => JsonRpcResponse::error(
                id,
                JsonRpcError::new(error_codes::INVALID_REQUEST, format!("无效请求: {}", e)),
            ),
        }
    }

    /// JSON-RPC 请求主分发方法
    pub async fn handle(&self, request: JsonRpcRequest, session: Option<&WsSession>) -> JsonRpcResponse {
        let id = request.id.clone();
        match self.execute_method(&request.method, request.params, session).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                debug!(method = %request.method, error = %error, "RPC 方法失败");
                JsonRpcResponse::error(id, self.map_error(error))
            }
        }
    }

    /// 执行特定的 RPC 方法
    async fn execute_method(
        &self,
        method: &str,
        params: Value,
        session: Option<&WsSession>,
    ) -> Result<Value, RpcMethodError> {
        match method {
            // 交易与收据
            "eth_getTransactionByHash" => self.eth_get_transaction_by_hash(params).await,
            "eth_getTransactionReceipt" => self.eth_get_transaction_receipt(params).await,

            // 日志与过滤器
            "eth_getLogs" => self.eth_get_logs(params).await,
            "eth_newFilter" => self.eth_new_filter(params).await,
            "eth_newBlockFilter" => Ok(json!(self.filters.new_block_filter().await?)),
            "eth_getFilterChanges" => self.eth_get_filter_changes(params).await,
            "eth_getFilterLogs" => self.eth_get_filter_logs(params).await,
            "eth_uninstallFilter" => self.eth_uninstall_filter(params).await,

            // 合约执行
            "eth_call" => self.eth_call(params).await,
            "eth_estimateGas" => self.eth_estimate_gas(params).await,

            // 发送交易
            "eth_sendTransaction" => self.eth_send_transaction(params).await,
            "eth_sendRawTransaction" => self.eth_send_raw_transaction(params).await,

            // 状态查询
            "eth_getBalance" => self.eth_get_balance(params).await,
            "eth_getCode" => self.eth_get_code(params).await,
            "eth_getStorageAt" => self.eth_get_storage_at(params).await,

            // 链信息
            "eth_blockNumber" => Ok(json!(format_quantity(self.node.get_block_count().await?))),
            "eth_chainId" => Ok(json!(format_quantity(self.chain.chain_id().await))),
            "net_version" => Ok(json!(format_quantity(self.chain.chain_id().await))),
            "eth_gasPrice" => self.eth_gas_price(),
            "web3_clientVersion" => Ok(json!(format!("gateway/{}", env!("CARGO_PKG_VERSION")))),

            // 订阅
            "eth_subscribe" => self.eth_subscribe(params, session).await,
            "eth_unsubscribe" => self.eth_unsubscribe(params, session).await,

            _ => Err(RpcMethodError::MethodNotFound(method.to_string())),
        }
    }

    async fn chain(&self) -> Result<Chain, RpcMethodError> {
        self.chain
            .chain()
            .await
            .ok_or_else(|| RpcMethodError::Callback("无法确定节点网络".to_string()))
    }

    // ========================================================================
    // 交易与收据
    // ========================================================================

    /// eth_getTransactionByHash - 根据交易哈希返回交易信息
    async fn eth_get_transaction_by_hash(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (hash,): (H256,) = serde_json::from_value(params)?;
        let tx = self.resolver.resolve(hash).await?;
        Ok(serde_json::to_value(tx)?)
    }

    /// eth_getTransactionReceipt - 根据交易哈希返回交易收据
    async fn eth_get_transaction_receipt(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (hash,): (H256,) = serde_json::from_value(params)?;
        let receipt = self.resolver.resolve_receipt(hash).await?;
        Ok(serde_json::to_value(receipt)?)
    }

    // ========================================================================
    // 日志与过滤器
    // ========================================================================

    /// eth_getLogs - 返回匹配过滤器的日志
    async fn eth_get_logs(&self, params: Value) -> Result<Value, RpcMethodError> {
        let filter_params: FilterParams = optional_param(&params, 0)?.unwrap_or_default();
        let from = log_search::resolve_block(&self.node, filter_params.from_block).await?;
        let to = log_search::resolve_block(&self.node, filter_params.to_block).await?;
        let filter = LogFilter::from_params(&filter_params);
        let logs = log_search::search(&self.node, from, to, &filter).await?;
        Ok(serde_json::to_value(logs)?)
    }

    async fn eth_new_filter(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (filter_params,): (FilterParams,) = serde_json::from_value(params)?;
        Ok(json!(self.filters.new_log_filter(&filter_params).await?))
    }

    async fn eth_get_filter_changes(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (id,): (String,) = serde_json::from_value(params)?;
        Ok(serde_json::to_value(self.filters.changes(&id).await?)?)
    }

    async fn eth_get_filter_logs(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (id,): (String,) = serde_json::from_value(params)?;
        Ok(serde_json::to_value(self.filters.logs(&id).await?)?)
    }

    async fn eth_uninstall_filter(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (id,): (String,) = serde_json::from_value(params)?;
        Ok(json!(self.filters.uninstall(&id).await?))
    }

    // ========================================================================
    // 合约执行
    // ========================================================================

    /// eth_call - 执行调用（不创建交易）
    async fn eth_call(&self, params: Value) -> Result<Value, RpcMethodError> {
        let request: CallRequest = required_param(&params, 0)?;
        let to = request
            .to
            .ok_or_else(|| RpcMethodError::InvalidParams("缺少 to 地址".to_string()))?;
        let gas_limit = request.gas.map(u256_to_u64).transpose()?;
        if gas_limit.map_or(false, |gas| gas > MAX_CALL_GAS) {
            debug!(requested = ?gas_limit, "调用 gas 超过上限");
            return Ok(json!("0x"));
        }

        let sender = self.native_sender(request.from).await?;
        let data = hex::encode(request.data.unwrap_or_default());
        let result = match self
            .node
            .call_contract(&address::to_hex(&to), &data, sender.as_deref(), gas_limit)
            .await
        {
            Ok(result) => result,
            Err(e) if e.is(NodeErrorKind::NotRecognized) => return Ok(json!("0x")),
            Err(e) => return Err(e.into()),
        };

        if result.execution_result.output.is_empty() {
            return Err(RpcMethodError::Callback(
                "Revert: executionResult output is empty".to_string(),
            ));
        }
        Ok(json!(format!("0x{}", result.execution_result.output)))
    }

    /// eth_estimateGas - 估算交易的 Gas 消耗
    async fn eth_estimate_gas(&self, params: Value) -> Result<Value, RpcMethodError> {
        let request: CallRequest = required_param(&params, 0)?;
        let data = request.data.unwrap_or_default();
        if data.is_empty() {
            return Ok(json!(format_quantity(NON_CONTRACT_VM_GAS)));
        }
        let to = request
            .to
            .ok_or_else(|| RpcMethodError::InvalidParams("缺少 to 地址".to_string()))?;

        // 不传 gas，让节点返回实际消耗
        let sender = self.native_sender(request.from).await?;
        let result = self
            .node
            .call_contract(&address::to_hex(&to), &hex::encode(&data), sender.as_deref(), None)
            .await?;
        if result.execution_result.excepted != "None" {
            return Err(RpcMethodError::Callback("execution reverted".to_string()));
        }
        // 留 20% 余量
        let gas = result.execution_result.gas_used * 6 / 5;
        Ok(json!(format_quantity(gas)))
    }

    async fn native_sender(&self, from: Option<H160>) -> Result<Option<String>, RpcMethodError> {
        match from {
            Some(from) => Ok(Some(address::encode(&from, self.chain().await?))),
            None => Ok(None),
        }
    }

    // ========================================================================
    // 发送交易
    // ========================================================================

    /// eth_sendTransaction - 按请求内容分为合约创建、转账、合约调用
    async fn eth_send_transaction(&self, params: Value) -> Result<Value, RpcMethodError> {
        let request: CallRequest = required_param(&params, 0)?;
        let data = request.data.clone().unwrap_or_default();
        let sender = self.native_sender(request.from).await?;

        let gas_limit = match request.gas {
            Some(gas) => u256_to_u64(gas)?,
            None => DEFAULT_GAS_LIMIT,
        };
        let gas_price = gas_price_to_native(request.gas_price.unwrap_or_default(), self.min_gas_price)?;

        let txid = match (request.to, data.is_empty()) {
            (None, false) => {
                let result = self
                    .node
                    .create_contract(&hex::encode(&data), gas_limit, &gas_price.to_string(), sender.as_deref())
                    .await?;
                result.txid
            }
            (Some(to), true) if request.value.is_some() => {
                let amount = NativeAmount::from_wei(request.value.unwrap_or_default())?;
                let to = address::encode(&to, self.chain().await?);
                debug!(%amount, "wei 已转换为节点金额");
                self.node
                    .send_to_address(&to, &amount.to_string(), sender.as_deref())
                    .await?
            }
            (Some(to), false) => {
                let amount = NativeAmount::from_wei(request.value.unwrap_or_default())?;
                let result = self
                    .node
                    .send_to_contract(
                        &address::to_hex(&to),
                        &hex::encode(&data),
                        &amount.to_string(),
                        gas_limit,
                        &gas_price.to_string(),
                        sender.as_deref(),
                    )
                    .await?;
                result.txid
            }
            _ => return Err(RpcMethodError::InvalidParams("未知的交易类型".to_string())),
        };
        Ok(json!(format!("0x{}", txid)))
    }

    /// eth_sendRawTransaction - 广播已签名交易；已在链上时返回其交易哈希
    async fn eth_send_raw_transaction(&self, params: Value) -> Result<Value, RpcMethodError> {
        let (raw,): (String,) = serde_json::from_value(params)?;
        let raw = address::strip_hex_prefix(&raw);
        if raw.is_empty() {
            return Err(RpcMethodError::InvalidParams("原始交易为空".to_string()));
        }

        let txid = match self.node.send_raw_transaction(raw).await {
            Ok(txid) => txid,
            Err(e) if e.is(NodeErrorKind::AlreadyInChain) => {
                let decoded = self.node.decode_raw_transaction(raw).await?;
                if decoded.hash.is_empty() {
                    decoded.txid
                } else {
                    decoded.hash
                }
            }
            Err(e) => return Err(e.into()),
        };
        Ok(json!(format!("0x{}", txid)))
    }

    // ========================================================================
    // 状态查询
    // ========================================================================

    /// eth_getBalance - 先按合约查询，再按普通地址查询
    async fn eth_get_balance(&self, params: Value) -> Result<Value, RpcMethodError> {
        let account: H160 = required_param(&params, 0)?;
        let hex_address = address::to_hex(&account);

        match self.node.get_account_info(&hex_address).await {
            Ok(info) => {
                debug!(address = %hex_address, "地址是合约");
                let balance = satoshi_to_wei(U256::from(info.balance))?;
                return Ok(json!(format!("0x{:x}", balance)));
            }
            // 非合约地址，按普通地址查询余额
            Err(e) if e.is(NodeErrorKind::NotRecognized) => {}
            Err(e) => return Err(e.into()),
        }

        let native = address::encode(&account, self.chain().await?);
        let balance = match self.node.get_address_balance(&native).await {
            Ok(balance) => balance,
            Err(e) if e.is(NodeErrorKind::NotRecognized) => return Ok(json!("0x0")),
            Err(e) => return Err(e.into()),
        };
        let wei = U256::from(balance.balance.max(0) as u64) * U256::from(WEI_PER_SATOSHI);
        Ok(json!(format!("0x{:x}", wei)))
    }

    /// eth_getCode - 返回合约代码
    async fn eth_get_code(&self, params: Value) -> Result<Value, RpcMethodError> {
        let account: H160 = required_param(&params, 0)?;
        match self.node.get_account_info(&address::to_hex(&account)).await {
            Ok(info) => Ok(json!(format!("0x{}", info.code))),
            Err(e) if e.is(NodeErrorKind::NotRecognized) => Ok(json!("0x")),
            Err(e) => Err(e.into()),
        }
    }

    /// eth_getStorageAt - 返回指定位置的存储值
    async fn eth_get_storage_at(&self, params: Value) -> Result<Value, RpcMethodError> {
        let account: H160 = required_param(&params, 0)?;
        let slot: String = required_param(&params, 1)?;
        let block = match optional_param::<BlockNumberOrTag>(&params, 2)? {
            Some(BlockNumberOrTag::Number(n)) => Some(n),
            _ => None,
        };

        let slot = format!("{:0>64}", address::strip_hex_prefix(&slot).to_ascii_lowercase());
        let storage = self.node.get_storage(&address::to_hex(&account), block).await?;
        let value = storage
            .values()
            .find_map(|slots| slots.get(&slot))
            .map(|value| format!("0x{}", value))
            .unwrap_or_else(|| EMPTY_STORAGE_SLOT.to_string());
        Ok(json!(value))
    }

    /// eth_gasPrice - 节点最低 gas 价格（wei）
    fn eth_gas_price(&self) -> Result<Value, RpcMethodError> {
        let wei = self.min_gas_price.to_wei()?;
        Ok(json!(format!("0x{:x}", wei)))
    }

    // ========================================================================
    // 订阅
    // ========================================================================

    /// eth_subscribe - 仅支持 logs
    async fn eth_subscribe(&self, params: Value, session: Option<&WsSession>) -> Result<Value, RpcMethodError> {
        let session = session.ok_or_else(|| RpcMethodError::UnsupportedFeature("订阅需要 WebSocket 连接".to_string()))?;
        let kind: String = required_param(&params, 0)?;
        if !kind.eq_ignore_ascii_case("logs") {
            return Err(RpcMethodError::UnsupportedFeature(format!("订阅类型 {}", kind)));
        }
        let filter_params: FilterParams = optional_param(&params, 1)?.unwrap_or_default();
        let filter = LogFilter::from_params(&filter_params);

        let id = self
            .subscriptions
            .subscribe(filter, session.sink.clone(), &session.owner)
            .await;
        session.subscriptions.lock().await.push(id.clone());
        Ok(json!(id))
    }

    /// eth_unsubscribe - 只能取消本连接的订阅
    async fn eth_unsubscribe(&self, params: Value, session: Option<&WsSession>) -> Result<Value, RpcMethodError> {
        let session = session.ok_or_else(|| RpcMethodError::UnsupportedFeature("订阅需要 WebSocket 连接".to_string()))?;
        let (id,): (String,) = serde_json::from_value(params)?;
        let mut owned = session.subscriptions.lock().await;
        let Some(position) = owned.iter().position(|s| *s == id) else {
            return Ok(json!(false));
        };
        owned.remove(position);
        Ok(json!(self.subscriptions.unsubscribe(&id).await))
    }

    /// 连接关闭：取消该连接的全部订阅
    pub async fn close_session(&self, session: &WsSession) {
        let ids: Vec<String> = session.subscriptions.lock().await.drain(..).collect();
        for id in &ids {
            self.subscriptions.unsubscribe(id).await;
        }
        session.owner.cancel();
        debug!(count = ids.len(), "连接关闭，已取消订阅");
    }

    /// 将内部错误映射为 JSON-RPC 错误
    fn map_error(&self, error: RpcMethodError) -> JsonRpcError {
        match error {
            RpcMethodError::MethodNotFound(method) => {
                JsonRpcError::new(error_codes::METHOD_NOT_FOUND, format!("方法未找到: {}", method))
            }
            RpcMethodError::InvalidParams(msg) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, format!("无效参数: {}", msg))
            }
            RpcMethodError::SerializationError(err) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, format!("无效参数: {}", err))
            }
            RpcMethodError::Callback(msg) => JsonRpcError::new(error_codes::SERVER_ERROR, msg),
            RpcMethodError::UnsupportedFeature(feature) => {
                JsonRpcError::new(error_codes::SERVER_ERROR, format!("不支持的功能: {}", feature))
            }
        }
    }
}

fn to_json(response: &JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        json!({
            "jsonrpc": "2.0",
            "error": {"code": error_codes::INTERNAL_ERROR, "message": e.to_string()},
            "id": Value::Null,
        })
    })
}

fn u256_to_u64(value: U256) -> Result<u64, RpcMethodError> {
    if value > U256::from(u64::MAX) {
        return Err(RpcMethodError::InvalidParams(format!("数值过大: {}", value)));
    }
    Ok(value.as_u64())
}

/// 读取位置参数
fn required_param<T: DeserializeOwned>(params: &Value, index: usize) -> Result<T, RpcMethodError> {
    optional_param(params, index)?
        .ok_or_else(|| RpcMethodError::InvalidParams(format!("缺少第 {} 个参数", index + 1)))
}

/// 读取可选位置参数；缺省或 null 返回 None
fn optional_param<T: DeserializeOwned>(params: &Value, index: usize) -> Result<Option<T>, RpcMethodError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
    }
}

/// RPC 方法错误类型
#[derive(Debug, Error)]
pub enum RpcMethodError {
    #[error("方法未找到: {0}")]
    MethodNotFound(String),
    #[error("无效参数: {0}")]
    InvalidParams(String),
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("{0}")]
    Callback(String),
    #[error("不支持的功能: {0}")]
    UnsupportedFeature(String),
}

impl From<NodeError> for RpcMethodError {
    fn from(err: NodeError) -> Self {
        RpcMethodError::Callback(err.to_string())
    }
}

impl From<AddressError> for RpcMethodError {
    fn from(err: AddressError) -> Self {
        RpcMethodError::InvalidParams(err.to_string())
    }
}

impl From<AmountError> for RpcMethodError {
    fn from(err: AmountError) -> Self {
        RpcMethodError::InvalidParams(err.to_string())
    }
}

impl From<ResolveError> for RpcMethodError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidParams(msg) => RpcMethodError::InvalidParams(msg),
            ResolveError::Callback(msg) => RpcMethodError::Callback(msg),
        }
    }
}

impl From<LogSearchError> for RpcMethodError {
    fn from(err: LogSearchError) -> Self {
        RpcMethodError::Callback(err.to_string())
    }
}

impl From<FilterError> for RpcMethodError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::InvalidId(_) => RpcMethodError::InvalidParams(err.to_string()),
            other => RpcMethodError::Callback(other.to_string()),
        }
    }
}

// ============================================================================
// 单元测试
// ============================================================================
