//! 节点 RPC 响应结构
//!
//! 字段名与节点 JSON 保持一致；节点版本之间缺失的字段一律给默认值。

use crate::domain::amount::{AmountError, NativeAmount};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// gettransaction（钱包交易）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub txid: String,
    #[serde(default)]
    pub amount: Value,
    #[serde(default)]
    pub fee: Option<Value>,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub generated: bool,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub blockindex: Option<u64>,
    #[serde(default)]
    pub hex: String,
}

impl WalletTransaction {
    pub fn is_pending(&self) -> bool {
        self.blockhash.is_empty()
    }
}

/// 交易输入中的解锁脚本
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptSig {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
}

/// 交易输入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default, rename = "scriptSig")]
    pub script_sig: Option<ScriptSig>,
    #[serde(default)]
    pub coinbase: Option<String>,
    /// 仅在节点开启地址索引时出现
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, rename = "valueSat")]
    pub value_sat: Option<i64>,
}

impl TxInput {
    /// 输入金额，优先使用聪值
    pub fn amount(&self) -> Result<NativeAmount, AmountError> {
        match (self.value_sat, &self.value) {
            (Some(sats), _) => Ok(NativeAmount::from_satoshis(sats.max(0) as u64)),
            (None, Some(value)) => NativeAmount::from_json(value),
            (None, None) => Ok(NativeAmount::ZERO),
        }
    }

    pub fn script_asm(&self) -> &str {
        self.script_sig.as_ref().map(|s| s.asm.as_str()).unwrap_or("")
    }
}

/// 输出锁定脚本
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
    #[serde(default, rename = "type")]
    pub script_type: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl ScriptPubKey {
    /// 输出暴露的地址（兼容新旧两种字段）
    pub fn all_addresses(&self) -> Vec<&str> {
        match &self.address {
            Some(addr) => vec![addr.as_str()],
            None => self.addresses.iter().map(String::as_str).collect(),
        }
    }

    pub fn first_address(&self) -> Option<&str> {
        self.all_addresses().into_iter().find(|a| !a.is_empty())
    }
}

/// 交易输出
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(default)]
    pub value: Value,
    #[serde(default, rename = "valueSat")]
    pub value_sat: Option<i64>,
    #[serde(default)]
    pub n: u32,
    #[serde(default, rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

impl TxOutput {
    pub fn amount(&self) -> Result<NativeAmount, AmountError> {
        match self.value_sat {
            Some(sats) => Ok(NativeAmount::from_satoshis(sats.max(0) as u64)),
            None => NativeAmount::from_json(&self.value),
        }
    }
}

/// getrawtransaction（verbose）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub confirmations: i64,
}

impl RawTransaction {
    pub fn is_pending(&self) -> bool {
        self.blockhash.is_empty()
    }
}

/// decoderawtransaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub txid: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
}

impl DecodedTransaction {
    /// 所有输出金额之和
    pub fn amount(&self) -> Result<NativeAmount, AmountError> {
        self.vout.iter().try_fold(NativeAmount::ZERO, |acc, out| {
            acc.checked_add(out.amount()?).ok_or(AmountError::Overflow)
        })
    }
}

/// getblock（verbosity = 1）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NativeBlock {
    pub hash: String,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub tx: Vec<String>,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub previousblockhash: Option<String>,
}

/// getblockchaininfo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub bestblockhash: String,
}

/// 合约日志
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// searchlogs / gettransactionreceipt 返回的合约收据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractReceipt {
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_hash: String,
    #[serde(default)]
    pub transaction_index: u64,
    #[serde(default)]
    pub output_index: u64,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cumulative_gas_used: u64,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub excepted: String,
    #[serde(default)]
    pub log: Vec<NativeLog>,
}

/// callcontract 的执行结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub excepted: String,
    #[serde(default)]
    pub excepted_message: String,
    #[serde(default)]
    pub new_address: String,
    #[serde(default)]
    pub output: String,
}

/// callcontract
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContractResult {
    #[serde(default)]
    pub address: String,
    pub execution_result: ExecutionResult,
}

/// getaccountinfo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    #[serde(default)]
    pub balance: u64,
    #[serde(default)]
    pub code: String,
}

/// getaddressbalance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressBalance {
    pub balance: i64,
    #[serde(default)]
    pub received: i64,
}

/// waitforlogs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitForLogsResult {
    #[serde(default)]
    pub entries: Vec<Value>,
    #[serde(default)]
    pub count: u64,
    pub nextblock: u64,
}

/// sendtocontract / createcontract / sendtoaddress 的交易结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractTxResult {
    pub txid: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub hash160: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// listwalletdir 中的钱包条目
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletDirEntry {
    pub name: String,
}

/// listwalletdir
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletDir {
    #[serde(default)]
    pub wallets: Vec<WalletDirEntry>,
}
