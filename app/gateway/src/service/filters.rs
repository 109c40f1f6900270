//! 轮询过滤器（eth_newFilter / eth_newBlockFilter / eth_getFilterChanges）
//!
//! 过滤器只保存游标，每次轮询从 游标+1 检索到当前链高并推进游标。

use crate::domain::error::NodeError;
use crate::domain::eth_types::{format_quantity, parse_h256, parse_quantity, BlockNumberOrTag, EthLog};
use crate::domain::log_filter::{FilterParams, LogFilter};
use crate::service::log_search::{self, LogSearchError};
use crate::service::node_api::NodeApi;
use ethereum_types::H256;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// 过滤器错误
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("过滤器不存在: {0}")]
    NotFound(String),
    #[error("无效的过滤器 id: {0}")]
    InvalidId(String),
    #[error("过滤器 {0} 不是日志过滤器")]
    NotLogFilter(String),
    #[error("无效的区块哈希: {0}")]
    InvalidBlockHash(String),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Search(#[from] LogSearchError),
}

/// 过滤器类型
#[derive(Debug, Clone)]
enum FilterKind {
    Block,
    Log {
        filter: LogFilter,
        from: u64,
        /// None 表示跟随链高
        to: Option<u64>,
    },
}

#[derive(Debug, Clone)]
struct FilterEntry {
    kind: FilterKind,
    /// 已返回过的最后一个区块
    cursor: u64,
}

/// eth_getFilterChanges 的结果：区块哈希或日志
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterChanges {
    Hashes(Vec<H256>),
    Logs(Vec<EthLog>),
}

/// 过滤器注册表
pub struct FilterRegistry {
    node: NodeApi,
    next_id: AtomicU64,
    filters: RwLock<HashMap<u64, FilterEntry>>,
}

impl FilterRegistry {
    pub fn new(node: NodeApi) -> Self {
        Self {
            node,
            next_id: AtomicU64::new(1),
            filters: RwLock::new(HashMap::new()),
        }
    }

    async fn install(&self, entry: FilterEntry) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.filters.write().await.insert(id, entry);
        format_quantity(id)
    }

    /// 安装日志过滤器，返回十六进制 id
    pub async fn new_log_filter(&self, params: &FilterParams) -> Result<String, FilterError> {
        let from = log_search::resolve_block(&self.node, params.from_block).await?;
        // 起始区块本身也要返回，包括 latest 解析出的当前链高
        let cursor = from.saturating_sub(1);
        let to = match params.to_block {
            Some(BlockNumberOrTag::Number(n)) => Some(n),
            Some(BlockNumberOrTag::Earliest) => Some(0),
            _ => None,
        };
        let kind = FilterKind::Log {
            filter: LogFilter::from_params(params),
            from,
            to,
        };
        Ok(self.install(FilterEntry { kind, cursor }).await)
    }

    /// 安装区块过滤器，从当前链高开始
    pub async fn new_block_filter(&self) -> Result<String, FilterError> {
        let tip = self.node.get_block_count().await?;
        Ok(self
            .install(FilterEntry {
                kind: FilterKind::Block,
                cursor: tip,
            })
            .await)
    }

    fn parse_id(id: &str) -> Result<u64, FilterError> {
        parse_quantity(id).map_err(|_| FilterError::InvalidId(id.to_string()))
    }

    async fn entry(&self, id: &str) -> Result<(u64, FilterEntry), FilterError> {
        let key = Self::parse_id(id)?;
        let filters = self.filters.read().await;
        filters
            .get(&key)
            .cloned()
            .map(|entry| (key, entry))
            .ok_or_else(|| FilterError::NotFound(id.to_string()))
    }

    /// 返回自上次轮询以来的变化并推进游标
    pub async fn changes(&self, id: &str) -> Result<FilterChanges, FilterError> {
        let (key, entry) = self.entry(id).await?;
        let tip = self.node.get_block_count().await?;

        let (changes, cursor) = match &entry.kind {
            FilterKind::Block => {
                let mut hashes = Vec::new();
                for height in entry.cursor + 1..=tip {
                    let hash = self.node.get_block_hash(height).await?;
                    hashes.push(parse_h256(&hash).map_err(|_| FilterError::InvalidBlockHash(hash.clone()))?);
                }
                (FilterChanges::Hashes(hashes), tip.max(entry.cursor))
            }
            FilterKind::Log { filter, to, .. } => {
                let upper = to.map_or(tip, |to| to.min(tip));
                if upper <= entry.cursor {
                    return Ok(FilterChanges::Logs(Vec::new()));
                }
                let logs = log_search::search(&self.node, entry.cursor + 1, upper, filter).await?;
                (FilterChanges::Logs(logs), upper)
            }
        };

        if let Some(stored) = self.filters.write().await.get_mut(&key) {
            stored.cursor = stored.cursor.max(cursor);
        }
        debug!(filter = %id, cursor, "过滤器游标前移");
        Ok(changes)
    }

    /// 返回日志过滤器原始区间内的全部日志
    pub async fn logs(&self, id: &str) -> Result<Vec<EthLog>, FilterError> {
        let (_, entry) = self.entry(id).await?;
        match entry.kind {
            FilterKind::Log { filter, from, to } => {
                let to = match to {
                    Some(to) => to,
                    None => self.node.get_block_count().await?,
                };
                Ok(log_search::search(&self.node, from, to, &filter).await?)
            }
            FilterKind::Block => Err(FilterError::NotLogFilter(id.to_string())),
        }
    }

    /// 删除过滤器，返回是否存在
    pub async fn uninstall(&self, id: &str) -> Result<bool, FilterError> {
        let key = Self::parse_id(id)?;
        Ok(self.filters.write().await.remove(&key).is_some())
    }
}
