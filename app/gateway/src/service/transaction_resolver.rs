//! 交易解析
//!
//! 把节点交易解析为以太坊交易/收据。查找顺序：
//! 钱包交易 → 奖励交易 → 原始交易；都无法识别时返回 null。

use crate::domain::address;
use crate::domain::amount::{satoshi_to_wei, AmountError};
use crate::domain::error::{NodeError, NodeErrorKind};
use crate::domain::eth_types::{parse_h256, EthReceipt, EthTransaction};
use crate::domain::log_filter::receipt_logs;
use crate::domain::native_types::{ContractReceipt, RawTransaction};
use crate::domain::script::ContractKind;
use crate::service::node_api::NodeApi;
use crate::service::script_inspector::{self, ScriptInspector};
use ethereum_types::{Bloom, H160, H256, U256, U64};
use thiserror::Error;
use tracing::{debug, warn};

/// 非合约交易的固定 gas 消耗
pub const NON_CONTRACT_VM_GAS: u64 = 0x55f0;

/// 交易解析错误
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("无效参数: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Callback(String),
}

impl From<NodeError> for ResolveError {
    fn from(err: NodeError) -> Self {
        ResolveError::Callback(err.to_string())
    }
}

/// 奖励交易的转账结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardTransfer {
    /// 发给第一个接收方的金额（wei）
    pub value: U256,
    pub to: Option<H160>,
}

/// 计算奖励交易的转账金额与接收方，输出少于两个时返回 None
///
/// 输出按地址分为找零（与第一个输入地址相同）和转出两部分，
/// 手续费 max(输入 - 输出, 0) 优先从找零中扣除，没有找零时从转出中扣除。
pub fn reward_transfer(raw: &RawTransaction) -> Result<Option<RewardTransfer>, AmountError> {
    if raw.vout.len() < 2 {
        return Ok(None);
    }
    let from = raw.vin.first().map(|v| v.address.as_str()).unwrap_or("");

    let mut value_in: i128 = 0;
    for input in &raw.vin {
        value_in += input.amount()?.satoshis() as i128;
    }

    let mut value_out: i128 = 0;
    let mut refund: i128 = 0;
    let mut sent: i128 = 0;
    let mut sent_to: i128 = 0;
    let mut to: Option<&str> = None;

    for output in &raw.vout {
        let amount = output.amount()?.satoshis() as i128;
        value_out += amount;
        let first = output.script_pub_key.all_addresses().first().copied();
        if first == Some(from) {
            refund += amount;
            continue;
        }
        if let Some(addr) = first.filter(|a| !a.is_empty()) {
            let recipient = *to.get_or_insert(addr);
            if recipient == addr {
                sent_to += amount;
            }
        }
        sent += amount;
    }

    let fee = (value_in - value_out).max(0);
    if refund == 0 && sent != 0 {
        sent_to -= fee;
    }

    let value = satoshi_to_wei(U256::from(sent_to.max(0) as u128))?;
    let to = to.and_then(|addr| address::decode(addr).ok());
    Ok(Some(RewardTransfer { value, to }))
}

/// 解析过程中交易的来源记录
struct TxSource {
    hex: String,
    blockhash: String,
    block_index: Option<u64>,
    generated: bool,
}

/// 奖励路径预先填好的交易
struct RewardRecord {
    tx: EthTransaction,
    raw: RawTransaction,
    value_set: bool,
}

/// 交易解析器
pub struct TransactionResolver {
    node: NodeApi,
    inspector: ScriptInspector,
}

impl TransactionResolver {
    pub fn new(node: NodeApi) -> Self {
        let inspector = ScriptInspector::new(node.clone());
        Self { node, inspector }
    }

    /// 解析交易；未知或未确认的奖励交易返回 None
    pub async fn resolve(&self, hash: H256) -> Result<Option<EthTransaction>, ResolveError> {
        let txid = hex::encode(hash.as_bytes());
        let mut partial: Option<RewardRecord> = None;

        let source = match self.node.get_transaction(&txid).await {
            Ok(tx) => TxSource {
                hex: tx.hex,
                blockhash: tx.blockhash,
                block_index: tx.blockindex,
                generated: tx.generated,
            },
            Err(err) if err.is(NodeErrorKind::NotRecognized) => {
                match self.resolve_reward(hash, &txid).await {
                    Ok(Some(record)) => {
                        debug!(%txid, "按奖励交易解析");
                        let source = TxSource {
                            hex: record.raw.hex.clone(),
                            blockhash: record.raw.blockhash.clone(),
                            block_index: None,
                            generated: false,
                        };
                        partial = Some(record);
                        source
                    }
                    // 未确认的奖励交易与以太坊客户端一致返回 null
                    Ok(None) => return Ok(None),
                    Err(e) if e.is(NodeErrorKind::NotRecognized) => return Ok(None),
                    Err(e) => {
                        debug!(%txid, error = %e, "奖励交易解析失败，回退到原始交易");
                        match self.node.get_raw_transaction(&txid).await {
                            Ok(raw) => TxSource {
                                hex: raw.hex,
                                blockhash: raw.blockhash,
                                block_index: Some(1),
                                generated: false,
                            },
                            Err(e) if e.is(NodeErrorKind::NotRecognized) => return Ok(None),
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
            Err(err) => {
                debug!(%txid, error = %err, "获取钱包交易失败");
                return Err(err.into());
            }
        };

        let decoded = self
            .node
            .decode_raw_transaction(&source.hex)
            .await
            .map_err(|e| ResolveError::Callback(format!("无法解码原始交易: {}", e)))?;

        let is_reward = partial.is_some();
        let (mut tx, value_set) = match partial {
            Some(record) => (record.tx, record.value_set),
            None => (EthTransaction::placeholder(hash), false),
        };

        if !source.blockhash.is_empty() {
            let block = self
                .node
                .get_block(&source.blockhash)
                .await
                .map_err(|e| ResolveError::Callback(format!("无法按哈希获取区块高度: {}", e)))?;
            tx.block_number = Some(U64::from(block.height));
            tx.block_hash = Some(parse_h256(&source.blockhash).map_err(ResolveError::InvalidParams)?);
            if tx.transaction_index.is_none() {
                tx.transaction_index = Some(U64::from(source.block_index.unwrap_or(0)));
            }
        }

        if !value_set {
            tx.value = decoded
                .amount()
                .and_then(|amount| amount.to_wei())
                .map_err(|e| ResolveError::InvalidParams(format!("无法格式化金额: {}", e)))?;
        }

        if let Some(info) = script_inspector::contract_info(&decoded.vout) {
            tx.input = info.user_input;
            tx.from = match info.from {
                Some(sender) => sender,
                None => self.inspector.sender_address(&txid).await.map_err(|e| {
                    ResolveError::Callback(format!("合约交易缺少发送方，回退解析也失败: {}", e))
                })?,
            };
            tx.to = Some(info.to.unwrap_or_else(H160::zero));
            tx.gas = info.gas_limit;
            tx.gas_price = satoshi_to_wei(info.gas_price)
                .map_err(|e| ResolveError::Callback(format!("无法转换 gas 价格: {}", e)))?;
            return Ok(Some(tx));
        }

        tx.from = if is_reward || source.generated {
            H160::zero()
        } else {
            match self.inspector.sender_address(&txid).await {
                Ok(sender) => sender,
                Err(e) => {
                    // coinbase 交易没有发送方
                    debug!(%txid, error = %e, "无法确定发送方，使用零地址");
                    H160::zero()
                }
            }
        };
        if tx.to.is_none() {
            let receiver = script_inspector::receiver_address(&decoded.vout).unwrap_or_else(|e| {
                debug!(%txid, error = %e, "无法解析接收方地址");
                None
            });
            tx.to = Some(receiver.unwrap_or_else(H160::zero));
        }
        tx.input = hex::decode(&source.hex)
            .map_err(|e| ResolveError::InvalidParams(format!("无效的交易数据: {}", e)))?;

        Ok(Some(tx))
    }

    /// 奖励交易：节点钱包不追踪的交易（如 coinstake）
    async fn resolve_reward(&self, hash: H256, txid: &str) -> Result<Option<RewardRecord>, NodeError> {
        let raw = self.node.get_raw_transaction(txid).await?;
        if raw.is_pending() {
            return Ok(None);
        }

        let block = self.node.get_block(&raw.blockhash).await?;
        let index = block
            .tx
            .iter()
            .position(|t| t == txid)
            .ok_or_else(|| NodeError::Decode(format!("交易 {} 不在区块 {} 中", txid, raw.blockhash)))?;
        let block_hash = parse_h256(&raw.blockhash).map_err(NodeError::Decode)?;

        let mut tx = EthTransaction::placeholder(hash);
        tx.block_hash = Some(block_hash);
        tx.block_number = Some(U64::from(block.height));
        tx.transaction_index = Some(U64::from(index as u64));
        tx.to = Some(H160::zero());

        let mut value_set = !raw.vout.is_empty();
        if let Some(transfer) =
            reward_transfer(&raw).map_err(|e| NodeError::Decode(format!("奖励交易金额无效: {}", e)))?
        {
            tx.value = transfer.value;
            if let Some(to) = transfer.to {
                tx.to = Some(to);
            }
            value_set = true;
        }

        Ok(Some(RewardRecord { tx, raw, value_set }))
    }

    /// 解析交易收据；非合约交易返回固定 gas 的合成收据
    pub async fn resolve_receipt(&self, hash: H256) -> Result<Option<EthReceipt>, ResolveError> {
        let txid = hex::encode(hash.as_bytes());

        let lookup = self.node.get_transaction_receipt(&txid).await;
        let receipt = match lookup {
            Ok(mut receipts) if !receipts.is_empty() => receipts.swap_remove(0),
            other => {
                let lookup_err = other.err();
                return match self.resolve_reward(hash, &txid).await {
                    Ok(Some(record)) => Ok(Some(synthetic_receipt(hash, &record.tx))),
                    // 未确认交易返回 null
                    Ok(None) => Ok(None),
                    Err(reward_err) => match lookup_err {
                        Some(err) if !err.is(NodeErrorKind::NotRecognized) => {
                            warn!(%txid, error = %err, "交易不存在");
                            Err(err.into())
                        }
                        _ => {
                            debug!(%txid, error = %reward_err, "没有收据");
                            Ok(None)
                        }
                    },
                };
            }
        };

        let mut eth_receipt = self.convert_receipt(&receipt)?;

        let raw = self
            .node
            .get_raw_transaction(&receipt.transaction_hash)
            .await
            .map_err(|e| ResolveError::Callback(format!("无法获取交易: {}", e)))?;
        let decoded = self
            .node
            .decode_raw_transaction(&raw.hex)
            .await
            .map_err(|e| ResolveError::Callback(format!("无法解码原始交易: {}", e)))?;

        let is_creation = script_inspector::contract_info(&decoded.vout)
            .map(|info| info.kind == ContractKind::Create)
            .unwrap_or(false);
        if is_creation {
            eth_receipt.to = None;
        } else {
            eth_receipt.contract_address = None;
        }
        Ok(Some(eth_receipt))
    }

    fn convert_receipt(&self, receipt: &ContractReceipt) -> Result<EthReceipt, ResolveError> {
        let invalid = |e: String| ResolveError::InvalidParams(e);
        let optional_address = |s: &str| -> Result<Option<H160>, ResolveError> {
            if s.is_empty() {
                return Ok(None);
            }
            address::parse_hex(s)
                .map(Some)
                .map_err(|e| ResolveError::InvalidParams(e.to_string()))
        };

        let status = if receipt.excepted == "None" {
            1
        } else {
            debug!(tx = %receipt.transaction_hash, excepted = %receipt.excepted, "交易执行异常");
            0
        };
        let logs = receipt_logs(receipt, None).map_err(|e| ResolveError::InvalidParams(e.to_string()))?;

        Ok(EthReceipt {
            transaction_hash: parse_h256(&receipt.transaction_hash).map_err(invalid)?,
            transaction_index: U64::from(receipt.transaction_index),
            block_hash: parse_h256(&receipt.block_hash).map_err(invalid)?,
            block_number: U64::from(receipt.block_number),
            from: optional_address(&receipt.from)?.unwrap_or_else(H160::zero),
            to: optional_address(&receipt.to)?,
            cumulative_gas_used: U256::from(receipt.cumulative_gas_used),
            gas_used: U256::from(receipt.gas_used),
            contract_address: optional_address(&receipt.contract_address)?,
            logs,
            logs_bloom: Bloom::zero(),
            status: U64::from(status),
        })
    }
}

fn synthetic_receipt(hash: H256, tx: &EthTransaction) -> EthReceipt {
    EthReceipt {
        transaction_hash: hash,
        transaction_index: tx.transaction_index.unwrap_or_default(),
        block_hash: tx.block_hash.unwrap_or_default(),
        block_number: tx.block_number.unwrap_or_default(),
        from: tx.from,
        to: tx.to,
        cumulative_gas_used: U256::from(NON_CONTRACT_VM_GAS),
        gas_used: U256::from(NON_CONTRACT_VM_GAS),
        contract_address: None,
        logs: Vec::new(),
        logs_bloom: Bloom::zero(),
        status: U64::one(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::node_codes;
    use crate::infrastructure::mock_node::MockNode;
    use crate::infrastructure::response_cache::ResponseCache;
    use crate::service::cancel::CancelToken;
    use serde_json::json;
    use std::sync::Arc;

    const TXID: &str = "11e97fa5877c5df349934bafc02da6218038a427e8ed081f048626fa6eb523f5";
    const BLOCK: &str = "bba11e1bacc69ba535d478cf1f2e542da3735a517b0b8eebaf7e6bb25eeb48c5";
    const SENDER: &str = "qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW";
    const SENDER_HEX: &str = "7926223070547d2d15b2ef5e7383e541c338ffe9";
    const RECEIVER: &str = "qLn9vqbr2Gx3TsVR9QyTVB5mrMoh4x43Uf";
    const RECEIVER_HEX: &str = "2352be3db3177f0a07efbe6da5857615b8c9901d";

    fn resolver(node: &MockNode) -> TransactionResolver {
        TransactionResolver::new(NodeApi::new(
            Arc::new(node.clone()),
            ResponseCache::default(),
            CancelToken::new(),
        ))
    }

    fn hash() -> H256 {
        parse_h256(TXID).unwrap()
    }

    fn not_recognized() -> NodeError {
        NodeError::rpc(node_codes::INVALID_ADDRESS_OR_KEY, "No such mempool or blockchain transaction")
    }

    #[test]
    fn test_reward_transfer_subtracts_fee_from_refund() {
        // 输入 100，找零 40，转出 59，手续费 1
        let raw: RawTransaction = serde_json::from_value(json!({
            "txid": TXID,
            "vin": [{"txid": "p", "vout": 0, "address": SENDER, "valueSat": 100}],
            "vout": [
                {"value": 0, "valueSat": 40, "n": 0, "scriptPubKey": {"addresses": [SENDER]}},
                {"value": 0, "valueSat": 59, "n": 1, "scriptPubKey": {"addresses": [RECEIVER]}}
            ]
        }))
        .unwrap();

        let transfer = reward_transfer(&raw).unwrap().unwrap();
        assert_eq!(transfer.value, U256::from(59u64) * U256::from(10_000_000_000u64));
        assert_eq!(address::to_hex(&transfer.to.unwrap()), RECEIVER_HEX);
    }

    #[test]
    fn test_reward_transfer_without_refund_subtracts_from_sent() {
        let raw: RawTransaction = serde_json::from_value(json!({
            "txid": TXID,
            "vin": [{"txid": "p", "vout": 0, "address": SENDER, "valueSat": 100}],
            "vout": [
                {"value": 0, "valueSat": 90, "n": 0, "scriptPubKey": {"addresses": [RECEIVER]}},
                {"value": 0, "valueSat": 5, "n": 1, "scriptPubKey": {"asm": "OP_RETURN"}}
            ]
        }))
        .unwrap();

        let transfer = reward_transfer(&raw).unwrap().unwrap();
        assert_eq!(transfer.value, U256::from(85u64) * U256::from(10_000_000_000u64));
    }

    #[test]
    fn test_reward_transfer_needs_two_outputs() {
        let raw: RawTransaction = serde_json::from_value(json!({
            "txid": TXID,
            "vout": [{"value": 1, "n": 0, "scriptPubKey": {"addresses": [RECEIVER]}}]
        }))
        .unwrap();
        assert_eq!(reward_transfer(&raw).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_null() {
        // 测试钱包与原始交易都无法识别时返回 null
        let node = MockNode::new();
        node.set_error("gettransaction", not_recognized()).await;
        node.set_error("getrawtransaction", not_recognized()).await;

        assert_eq!(resolver(&node).resolve(hash()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_reward_is_null() {
        let node = MockNode::new();
        node.set_error("gettransaction", not_recognized()).await;
        node.set_response("getrawtransaction", json!({"txid": TXID, "hex": "00", "vin": [], "vout": []}))
            .await;

        assert_eq!(resolver(&node).resolve(hash()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wallet_transfer() {
        // 测试普通转账：发送方来自输入地址，接收方来自输出地址
        let node = MockNode::new();
        node.set_response("gettransaction", json!({
            "txid": TXID, "amount": 0, "blockhash": BLOCK, "blockindex": 3, "hex": "0200"
        }))
        .await;
        node.set_response("decoderawtransaction", json!({
            "txid": TXID,
            "vout": [{"value": 0.5, "n": 0, "scriptPubKey": {"addresses": [RECEIVER]}}]
        }))
        .await;
        node.set_response("getblock", json!({"hash": BLOCK, "height": 42, "tx": [TXID]})).await;
        node.set_response("getrawtransaction", json!({
            "txid": TXID, "vin": [{"txid": "p", "vout": 0, "address": SENDER}], "vout": []
        }))
        .await;

        let tx = resolver(&node).resolve(hash()).await.unwrap().unwrap();
        assert_eq!(tx.block_number, Some(U64::from(42)));
        assert_eq!(tx.transaction_index, Some(U64::from(3)));
        assert_eq!(tx.value, U256::from(50_000_000u64) * U256::from(10_000_000_000u64));
        assert_eq!(address::to_hex(&tx.from), SENDER_HEX);
        assert_eq!(address::to_hex(&tx.to.unwrap()), RECEIVER_HEX);
        assert_eq!(tx.input, vec![0x02, 0x00]);
    }

    #[tokio::test]
    async fn test_contract_call_with_sender() {
        // 测试带 OP_SENDER 的合约调用
        let node = MockNode::new();
        let asm = format!(
            "1 {} 3045022100aa OP_SENDER 4 250000 40 a9059cbb {} OP_CALL",
            SENDER_HEX, RECEIVER_HEX
        );
        node.set_response("gettransaction", json!({"txid": TXID, "hex": "00"})).await;
        node.set_response("decoderawtransaction", json!({
            "txid": TXID,
            "vout": [{"value": 0, "n": 0, "scriptPubKey": {"asm": asm}}]
        }))
        .await;

        let tx = resolver(&node).resolve(hash()).await.unwrap().unwrap();
        assert_eq!(tx.block_hash, None);
        assert_eq!(address::to_hex(&tx.from), SENDER_HEX);
        assert_eq!(address::to_hex(&tx.to.unwrap()), RECEIVER_HEX);
        assert_eq!(tx.gas, U256::from(250_000u64));
        assert_eq!(tx.gas_price, U256::from(400_000_000_000u64));
        assert_eq!(tx.input, vec![0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(node.call_count("getrawtransaction").await, 0);
    }

    #[tokio::test]
    async fn test_node_failure_is_callback_error() {
        let node = MockNode::new();
        node.set_error("gettransaction", NodeError::Transport("connection refused".into())).await;

        let err = resolver(&node).resolve(hash()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Callback(_)));
    }

    #[tokio::test]
    async fn test_contract_receipt() {
        let node = MockNode::new();
        node.set_response("gettransactionreceipt", json!([{
            "blockHash": BLOCK,
            "blockNumber": 42,
            "transactionHash": TXID,
            "transactionIndex": 1,
            "from": SENDER_HEX,
            "to": RECEIVER_HEX,
            "cumulativeGasUsed": 30000,
            "gasUsed": 30000,
            "contractAddress": RECEIVER_HEX,
            "excepted": "None",
            "log": [{"address": RECEIVER_HEX, "topics": [], "data": "ff"}]
        }]))
        .await;
        node.set_response("getrawtransaction", json!({"txid": TXID, "hex": "00"})).await;
        node.set_response("decoderawtransaction", json!({
            "txid": TXID,
            "vout": [{"value": 0, "n": 0, "scriptPubKey": {"asm": format!("4 250000 40 00 {} OP_CALL", RECEIVER_HEX)}}]
        }))
        .await;

        let receipt = resolver(&node).resolve_receipt(hash()).await.unwrap().unwrap();
        assert_eq!(receipt.status, U64::one());
        assert_eq!(receipt.gas_used, U256::from(30000));
        assert_eq!(receipt.contract_address, None);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].data, vec![0xff]);
    }

    #[tokio::test]
    async fn test_plain_transfer_receipt_is_synthetic() {
        // 测试非合约交易返回固定 gas 的合成收据
        let node = MockNode::new();
        node.set_response("gettransactionreceipt", json!([])).await;
        node.set_response("getrawtransaction", json!({
            "txid": TXID, "hex": "00", "blockhash": BLOCK,
            "vin": [{"txid": "p", "vout": 0, "address": SENDER, "valueSat": 100}],
            "vout": [{"value": 0, "valueSat": 100, "n": 0, "scriptPubKey": {"addresses": [RECEIVER]}}]
        }))
        .await;
        node.set_response("getblock", json!({"hash": BLOCK, "height": 7, "tx": ["aa", TXID]})).await;

        let receipt = resolver(&node).resolve_receipt(hash()).await.unwrap().unwrap();
        assert_eq!(receipt.gas_used, U256::from(NON_CONTRACT_VM_GAS));
        assert_eq!(receipt.transaction_index, U64::from(1));
        assert_eq!(receipt.block_number, U64::from(7));
        assert_eq!(receipt.status, U64::one());
        assert!(receipt.logs.is_empty());
    }
}
