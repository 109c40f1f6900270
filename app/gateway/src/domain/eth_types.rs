//! 以太坊侧数据结构（符合 EIP-1474）

use ethereum_types::{Bloom, H160, H256, U256, U64};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// 奖励交易与无签名交易使用的占位签名 r / s
pub const PLACEHOLDER_SIGNATURE_R: &str =
    "0xf000000000000000000000000000000000000000000000000000000000000000";
pub const PLACEHOLDER_SIGNATURE_V: u64 = 0x25;

/// 以太坊交易结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransaction {
    pub hash: H256,                       // 交易哈希
    pub nonce: U256,                      // 发送方交易序号（恒为 0）
    pub block_hash: Option<H256>,         // 所属区块哈希
    pub block_number: Option<U64>,        // 所属区块号
    pub transaction_index: Option<U64>,   // 区块中的交易索引
    pub from: H160,                       // 发送方地址
    pub to: Option<H160>,                 // 接收方地址
    pub value: U256,                      // 转账金额（wei）
    pub gas_price: U256,                  // Gas 价格（wei）
    pub gas: U256,                        // Gas 限制
    #[serde(with = "hex_bytes")]
    pub input: Vec<u8>,                   // 输入数据
    pub v: U64,                           // 签名 v 值
    pub r: U256,                          // 签名 r 值
    pub s: U256,                          // 签名 s 值
}

impl EthTransaction {
    /// 以占位签名创建一个空交易记录
    pub fn placeholder(hash: H256) -> Self {
        let sig = U256::from_big_endian(&placeholder_signature_bytes());
        Self {
            hash,
            nonce: U256::zero(),
            block_hash: None,
            block_number: None,
            transaction_index: None,
            from: H160::zero(),
            to: None,
            value: U256::zero(),
            gas_price: U256::zero(),
            gas: U256::zero(),
            input: Vec::new(),
            v: U64::from(PLACEHOLDER_SIGNATURE_V),
            r: sig,
            s: sig,
        }
    }
}

fn placeholder_signature_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xf0;
    bytes
}

/// 交易收据结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthReceipt {
    pub transaction_hash: H256,
    pub transaction_index: U64,
    pub block_hash: H256,
    pub block_number: U64,
    pub from: H160,
    pub to: Option<H160>,
    pub cumulative_gas_used: U256,
    pub gas_used: U256,
    pub contract_address: Option<H160>,
    pub logs: Vec<EthLog>,
    pub logs_bloom: Bloom,
    pub status: U64,
}

/// 事件日志结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthLog {
    pub removed: bool,
    pub log_index: U64,
    pub transaction_index: U64,
    pub transaction_hash: H256,
    pub block_hash: H256,
    pub block_number: U64,
    pub address: H160,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub topics: Vec<H256>,
}

/// 区块标识：区块号或标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockNumberOrTag {
    Number(u64),
    Latest,
    Earliest,
    Pending,
}

impl BlockNumberOrTag {
    /// 从 JSON 值解析：十六进制字符串、整数或标签
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => match s.as_str() {
                "latest" | "" => Ok(BlockNumberOrTag::Latest),
                "earliest" => Ok(BlockNumberOrTag::Earliest),
                "pending" => Ok(BlockNumberOrTag::Pending),
                other => parse_quantity(other).map(BlockNumberOrTag::Number),
            },
            Value::Number(n) => n
                .as_u64()
                .map(BlockNumberOrTag::Number)
                .ok_or_else(|| format!("无效的区块号: {}", n)),
            Value::Null => Ok(BlockNumberOrTag::Latest),
            other => Err(format!("无效的区块标识: {}", other)),
        }
    }
}

impl<'de> Deserialize<'de> for BlockNumberOrTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        BlockNumberOrTag::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// 解析 0x 前缀的十六进制数量
pub fn parse_quantity(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| format!("缺少 0x 前缀: {}", s))?;
    if digits.is_empty() {
        return Err(format!("空的十六进制数量: {}", s));
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("无效的十六进制数量 {}: {}", s, e))
}

/// 解析 32 字节哈希，0x 前缀可选
pub fn parse_h256(s: &str) -> Result<H256, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() != 64 {
        return Err(format!("无效的哈希长度: {}", s));
    }
    let bytes = hex::decode(digits).map_err(|e| format!("无效的哈希 {}: {}", s, e))?;
    Ok(H256::from_slice(&bytes))
}

/// 格式化十六进制数量（0x 前缀，无前导零）
pub fn format_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

/// 调用/交易参数（eth_call、eth_estimateGas、eth_sendTransaction）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(default)]
    pub from: Option<H160>,
    #[serde(default)]
    pub to: Option<H160>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default, alias = "input", with = "hex_data")]
    pub data: Option<Vec<u8>>,
}

/// 自定义序列化模块：处理十六进制字符串和可选字节数组的转换
pub mod hex_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_str(&format!("0x{}", hex::encode(bytes))),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let s = s.trim_start_matches("0x");
                if s.is_empty() {
                    Ok(Some(vec![]))
                } else {
                    hex::decode(s).map(Some).map_err(serde::de::Error::custom)
                }
            }
            None => Ok(None),
        }
    }
}

/// 自定义序列化模块：处理十六进制字符串和必需字节数组的转换
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(data)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        let s = s.trim_start_matches("0x");
        if s.is_empty() {
            Ok(vec![])
        } else {
            hex::decode(s).map_err(serde::de::Error::custom)
        }
    }
}
