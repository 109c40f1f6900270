//! 地址编解码
//!
//! 在以太坊风格的 20 字节十六进制地址与节点使用的 Base58Check 地址之间转换。
//! Base58Check 布局：1 字节网络前缀 + 20 字节哈希 + 4 字节校验和（双 SHA-256 前 4 字节）。

use ethereum_types::H160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 主网地址前缀
pub const MAIN_ADDRESS_PREFIX: u8 = 0x3a;
/// 测试网与回归测试网地址前缀
pub const TEST_ADDRESS_PREFIX: u8 = 0x78;

const CHECKSUM_LEN: usize = 4;
const MIN_DECODED_LEN: usize = 22;

/// 节点所连接的网络
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Main,
    Test,
    Regtest,
}

impl Chain {
    /// 网络名称（与节点 getblockchaininfo 返回的 chain 字段一致）
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Main => "main",
            Chain::Test => "test",
            Chain::Regtest => "regtest",
        }
    }

    /// 对外暴露的以太坊链 ID
    pub fn chain_id(&self) -> u64 {
        match self {
            Chain::Main => 81,
            Chain::Test => 8889,
            Chain::Regtest => 8890,
        }
    }

    /// Base58Check 地址前缀
    pub fn address_prefix(&self) -> u8 {
        match self {
            Chain::Main => MAIN_ADDRESS_PREFIX,
            Chain::Test | Chain::Regtest => TEST_ADDRESS_PREFIX,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Chain::Main),
            "test" => Ok(Chain::Test),
            "regtest" => Ok(Chain::Regtest),
            other => Err(AddressError::UnknownChain(other.to_string())),
        }
    }
}

/// 地址校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("无效的十六进制地址: {0}")]
    InvalidHex(String),
    #[error("未知网络: {0}")]
    UnknownChain(String),
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

/// 将 20 字节哈希编码为指定网络的 Base58Check 地址
pub fn encode(hash: &H160, chain: Chain) -> String {
    let mut payload = Vec::with_capacity(1 + 20 + CHECKSUM_LEN);
    payload.push(chain.address_prefix());
    payload.extend_from_slice(hash.as_bytes());
    let sum = checksum(&payload);
    payload.extend_from_slice(&sum);
    bs58::encode(payload).into_string()
}

/// 解码 Base58Check 地址，返回其中的 20 字节哈希
pub fn decode(native: &str) -> Result<H160, AddressError> {
    let bytes = bs58::decode(native)
        .into_vec()
        .map_err(|_| AddressError::InvalidAddress(native.to_string()))?;
    if bytes.len() < MIN_DECODED_LEN {
        return Err(AddressError::InvalidAddress(native.to_string()));
    }

    let (payload, sum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if checksum(payload) != sum {
        return Err(AddressError::InvalidAddress(native.to_string()));
    }

    // 去掉网络前缀
    let hash = &payload[1..];
    if hash.len() != 20 {
        return Err(AddressError::InvalidAddress(native.to_string()));
    }
    Ok(H160::from_slice(hash))
}

/// 解析可带 0x 前缀的 40 位十六进制地址
pub fn parse_hex(hex_address: &str) -> Result<H160, AddressError> {
    let trimmed = strip_hex_prefix(hex_address);
    if trimmed.len() != 40 {
        return Err(AddressError::InvalidHex(hex_address.to_string()));
    }
    let bytes = hex::decode(trimmed).map_err(|_| AddressError::InvalidHex(hex_address.to_string()))?;
    Ok(H160::from_slice(&bytes))
}

/// 十六进制地址（小写、不带 0x 前缀），节点 RPC 使用此格式
pub fn to_hex(hash: &H160) -> String {
    hex::encode(hash.as_bytes())
}

/// 去掉 0x / 0X 前缀
pub fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}
