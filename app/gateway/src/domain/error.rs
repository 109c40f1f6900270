//! 上游节点错误分类
//!
//! 节点返回的错误按照错误码和错误信息归类为固定的哨兵类别，
//! 供缓存、重试和错误恢复逻辑按类别分派。

use thiserror::Error;

/// 节点哨兵错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeErrorKind {
    /// 地址或交易无法识别（-5）
    NotRecognized,
    /// 交易已在链上（-27）
    AlreadyInChain,
    /// 节点工作队列已满（HTTP 503）
    WorkQueueDepth,
    /// 节点预热中，稍后重试（-28）
    TryAgainLater,
    /// 钱包未找到（-18）
    WalletNotFound,
    /// 未指定钱包（-19）
    WalletNotSpecified,
    /// 节点内部错误（-32603）
    InternalError,
    /// 节点不支持该方法（-32601）
    MethodNotFound,
}

/// 节点 RPC 错误码
pub mod node_codes {
    pub const INVALID_ADDRESS_OR_KEY: i64 = -5;
    pub const WALLET_NOT_FOUND: i64 = -18;
    pub const WALLET_NOT_SPECIFIED: i64 = -19;
    pub const VERIFY_ALREADY_IN_CHAIN: i64 = -27;
    pub const IN_WARMUP: i64 = -28;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// 访问上游节点时产生的错误
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("HTTP 请求失败: {0}")]
    Transport(String),
    #[error("HTTP 错误 {status}: {body}")]
    Http { status: u16, body: String },
    #[error("解析响应失败: {0}")]
    Decode(String),
    #[error("节点 RPC 错误 [{code}]: {message}")]
    Rpc { code: i64, message: String },
    #[error("节点工作队列已满")]
    WorkQueueDepth,
}

impl NodeError {
    /// 构造节点 RPC 错误
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        NodeError::Rpc {
            code,
            message: message.into(),
        }
    }

    /// 将错误映射为哨兵类别，非哨兵错误返回 None
    pub fn kind(&self) -> Option<NodeErrorKind> {
        match self {
            NodeError::WorkQueueDepth => Some(NodeErrorKind::WorkQueueDepth),
            NodeError::Http { status: 503, .. } => Some(NodeErrorKind::WorkQueueDepth),
            NodeError::Rpc { code, message } => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("work queue depth exceeded") {
                    return Some(NodeErrorKind::WorkQueueDepth);
                }
                if lower.contains("no such mempool or blockchain transaction")
                    || lower.contains("invalid or non-wallet transaction id")
                {
                    return Some(NodeErrorKind::NotRecognized);
                }
                match *code {
                    node_codes::INVALID_ADDRESS_OR_KEY => Some(NodeErrorKind::NotRecognized),
                    node_codes::VERIFY_ALREADY_IN_CHAIN => Some(NodeErrorKind::AlreadyInChain),
                    node_codes::IN_WARMUP => Some(NodeErrorKind::TryAgainLater),
                    node_codes::WALLET_NOT_FOUND => Some(NodeErrorKind::WalletNotFound),
                    node_codes::WALLET_NOT_SPECIFIED => Some(NodeErrorKind::WalletNotSpecified),
                    node_codes::INTERNAL_ERROR => Some(NodeErrorKind::InternalError),
                    node_codes::METHOD_NOT_FOUND => Some(NodeErrorKind::MethodNotFound),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// 是否为指定的哨兵类别
    pub fn is(&self, kind: NodeErrorKind) -> bool {
        self.kind() == Some(kind)
    }
}
