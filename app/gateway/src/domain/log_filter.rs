//! 日志过滤
//!
//! 节点的 searchlogs 只要收据中任意日志命中任意主题就返回整张收据，
//! 因此检索结果必须逐条日志按以太坊的位置语义重新过滤。

use crate::domain::address::strip_hex_prefix;
use crate::domain::address;
use crate::domain::eth_types::{parse_h256, BlockNumberOrTag, EthLog};
use crate::domain::native_types::ContractReceipt;
use ethereum_types::U64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// 单值或数组参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

/// eth_getLogs / eth_newFilter / eth_subscribe("logs") 的过滤参数
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterParams {
    #[serde(default)]
    pub from_block: Option<BlockNumberOrTag>,
    #[serde(default)]
    pub to_block: Option<BlockNumberOrTag>,
    #[serde(default)]
    pub address: Option<OneOrMany<String>>,
    #[serde(default)]
    pub topics: Option<Vec<Option<OneOrMany<String>>>>,
}

/// 归一化后的日志过滤器：地址与主题均为小写、无 0x 前缀
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    addresses: HashSet<String>,
    topics: Vec<Vec<String>>,
}

fn normalize(s: &str) -> String {
    strip_hex_prefix(s).to_ascii_lowercase()
}

impl LogFilter {
    pub fn new<A, T>(addresses: A, topics: T) -> Self
    where
        A: IntoIterator<Item = String>,
        T: IntoIterator<Item = Vec<String>>,
    {
        Self {
            addresses: addresses.into_iter().map(|a| normalize(&a)).collect(),
            topics: topics
                .into_iter()
                .map(|set| set.iter().map(|t| normalize(t)).collect())
                .collect(),
        }
    }

    pub fn from_params(params: &FilterParams) -> Self {
        let addresses = params
            .address
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default();
        let topics = params
            .topics
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|pos| pos.map(OneOrMany::into_vec).unwrap_or_default());
        Self::new(addresses, topics)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.topics.iter().all(Vec::is_empty)
    }

    /// 节点检索使用的地址列表（排序后保证请求参数稳定）
    pub fn search_addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self.addresses.iter().cloned().collect();
        out.sort();
        out
    }

    /// 节点检索使用的按位置主题：单一主题原样下发，多选或通配位置下发 null
    pub fn search_topics(&self) -> Vec<Value> {
        let mut out: Vec<Value> = self
            .topics
            .iter()
            .map(|set| match set.as_slice() {
                [only] => Value::String(only.clone()),
                _ => Value::Null,
            })
            .collect();
        while matches!(out.last(), Some(Value::Null)) {
            out.pop();
        }
        out
    }

    /// 地址集合为空时不过滤地址
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty() || self.addresses.contains(&normalize(address))
    }

    /// 按位置匹配主题；日志在非空过滤位置缺少主题时不匹配
    pub fn matches_topics<S: AsRef<str>>(&self, topics: &[S]) -> bool {
        for (position, wanted) in self.topics.iter().enumerate() {
            if wanted.is_empty() {
                continue;
            }
            match topics.get(position) {
                Some(topic) => {
                    let topic = normalize(topic.as_ref());
                    if !wanted.iter().any(|w| *w == topic) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    pub fn matches<S: AsRef<str>>(&self, address: &str, topics: &[S]) -> bool {
        self.matches_address(address) && self.matches_topics(topics)
    }
}

/// 节点日志转换为以太坊日志时的字段错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("无效的日志字段 {field}: {value}")]
pub struct LogConversionError {
    pub field: &'static str,
    pub value: String,
}

impl LogConversionError {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

/// 将合约收据中的日志转换为以太坊日志
///
/// logIndex 取日志在收据中的位置；给出过滤器时只保留命中的日志。
pub fn receipt_logs(
    receipt: &ContractReceipt,
    filter: Option<&LogFilter>,
) -> Result<Vec<EthLog>, LogConversionError> {
    let transaction_hash = parse_h256(&receipt.transaction_hash)
        .map_err(|_| LogConversionError::new("transactionHash", &receipt.transaction_hash))?;
    let block_hash = parse_h256(&receipt.block_hash)
        .map_err(|_| LogConversionError::new("blockHash", &receipt.block_hash))?;

    let mut logs = Vec::new();
    for (index, log) in receipt.log.iter().enumerate() {
        if let Some(filter) = filter {
            if !filter.matches(&log.address, &log.topics) {
                continue;
            }
        }
        let address = address::parse_hex(&log.address)
            .map_err(|_| LogConversionError::new("address", &log.address))?;
        let topics = log
            .topics
            .iter()
            .map(|t| parse_h256(t).map_err(|_| LogConversionError::new("topics", t)))
            .collect::<Result<Vec<_>, _>>()?;
        let data = hex::decode(address::strip_hex_prefix(&log.data))
            .map_err(|_| LogConversionError::new("data", &log.data))?;

        logs.push(EthLog {
            removed: false,
            log_index: U64::from(index as u64),
            transaction_index: U64::from(receipt.transaction_index),
            transaction_hash,
            block_hash,
            block_number: U64::from(receipt.block_number),
            address,
            data,
            topics,
        });
    }
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(topics: &[&[&str]]) -> LogFilter {
        LogFilter::new(
            Vec::<String>::new(),
            topics
                .iter()
                .map(|set| set.iter().map(|t| t.to_string()).collect::<Vec<_>>()),
        )
    }

    #[test]
    fn test_positional_topic_matching() {
        // 过滤器 [[], [A, B], [C]]
        let f = filter(&[&[], &["A", "B"], &["C"]]);
        assert!(f.matches_topics(&["X", "A", "C"]));
        assert!(f.matches_topics(&["X", "B", "C", "Z"]));
        assert!(!f.matches_topics(&["X", "A", "D"]));
        assert!(!f.matches_topics(&["X"]));
    }

    #[test]
    fn test_topics_case_and_prefix_insensitive() {
        let f = filter(&[&["0xABCDEF"]]);
        assert!(f.matches_topics(&["abcdef"]));
        assert!(f.matches_topics(&["0xabcdef"]));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = LogFilter::default();
        assert!(f.is_empty());
        let none: [&str; 0] = [];
        assert!(f.matches("0x1234", &none));
    }

    #[test]
    fn test_address_filter() {
        let f = LogFilter::new(vec!["0xDB46F738bf32cdAFb9a4a70eB8b44c70646e4da6".to_string()], Vec::new());
        assert!(f.matches_address("db46f738bf32cdafb9a4a70eb8b44c70646e4da6"));
        assert!(!f.matches_address("0000000000000000000000000000000000000000"));
    }

    #[test]
    fn test_params_single_address_and_null_topic() {
        // 单个地址和 null 主题位置
        let params: FilterParams = serde_json::from_value(serde_json::json!({
            "fromBlock": "0x1",
            "address": "0xdb46f738bf32cdafb9a4a70eb8b44c70646e4da6",
            "topics": [null, ["0xaa", "0xbb"], "0xcc"]
        }))
        .unwrap();
        let f = LogFilter::from_params(&params);
        assert_eq!(f.search_addresses(), vec!["db46f738bf32cdafb9a4a70eb8b44c70646e4da6"]);
        assert_eq!(
            f.search_topics(),
            vec![Value::Null, Value::Null, Value::String("cc".into())]
        );
        assert!(f.matches_topics(&["11", "bb", "cc"]));
        assert_eq!(params.from_block, Some(BlockNumberOrTag::Number(1)));
    }

    fn receipt() -> ContractReceipt {
        serde_json::from_value(serde_json::json!({
            "blockHash": "bba11e1bacc69ba535d478cf1f2e542da3735a517b0b8eebaf7e6bb25eeb48c5",
            "blockNumber": 14,
            "transactionHash": "85f32f6a3b7d6c7ee9b1c1e6c1ad47e3e4c9e5ca1d0f1e3b51d7a1b6e1f0a1b2",
            "transactionIndex": 2,
            "log": [
                {"address": "db46f738bf32cdafb9a4a70eb8b44c76646bcaf0", "topics": ["0000000000000000000000000000000000000000000000000000000000000aaa"], "data": "01"},
                {"address": "db46f738bf32cdafb9a4a70eb8b44c76646bcaf0", "topics": ["0000000000000000000000000000000000000000000000000000000000000bbb"], "data": ""}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_receipt_logs_keep_receipt_position() {
        // 测试过滤后 logIndex 仍是日志在收据中的位置
        let filter = LogFilter::new(
            Vec::<String>::new(),
            vec![vec!["0x0000000000000000000000000000000000000000000000000000000000000BBB".to_string()]],
        );
        let logs = receipt_logs(&receipt(), Some(&filter)).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_index, U64::from(1));
        assert_eq!(logs[0].transaction_index, U64::from(2));
        assert_eq!(logs[0].block_number, U64::from(14));
        assert!(logs[0].data.is_empty());

        let all = receipt_logs(&receipt(), None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].data, vec![1]);
    }

    #[test]
    fn test_receipt_logs_reject_bad_topic() {
        let mut bad = receipt();
        bad.log[0].topics = vec!["zz".to_string()];
        let err = receipt_logs(&bad, None).unwrap_err();
        assert_eq!(err.field, "topics");
    }
}
