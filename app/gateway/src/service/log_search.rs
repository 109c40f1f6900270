//! 日志检索：区块范围解析、searchlogs 调用与逐条日志重新过滤

use crate::domain::error::NodeError;
use crate::domain::eth_types::{BlockNumberOrTag, EthLog};
use crate::domain::log_filter::{receipt_logs, LogConversionError, LogFilter};
use crate::service::node_api::NodeApi;
use thiserror::Error;

/// 日志检索错误
#[derive(Debug, Error)]
pub enum LogSearchError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Conversion(#[from] LogConversionError),
}

/// 把区块标识解析为具体高度；latest / pending 取当前链高
pub async fn resolve_block(node: &NodeApi, block: Option<BlockNumberOrTag>) -> Result<u64, NodeError> {
    match block.unwrap_or(BlockNumberOrTag::Latest) {
        BlockNumberOrTag::Number(n) => Ok(n),
        BlockNumberOrTag::Earliest => Ok(0),
        BlockNumberOrTag::Latest | BlockNumberOrTag::Pending => node.get_block_count().await,
    }
}

/// 在 [from, to] 区间检索日志并按过滤器重新过滤
pub async fn search(node: &NodeApi, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<EthLog>, LogSearchError> {
    if from > to {
        return Ok(Vec::new());
    }
    let receipts = node.search_logs(from, to, filter, None).await?;
    let mut logs = Vec::new();
    for receipt in &receipts {
        logs.extend(receipt_logs(receipt, Some(filter))?);
    }
    Ok(logs)
}
