//! JSON-RPC 2.0 协议类型定义
//!
//! 参考：https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// JSON-RPC 2.0 核心类型
// ============================================================================

/// JSON-RPC 2.0 请求结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: RequestId,
}

fn default_version() -> String {
    "2.0".to_string()
}

/// HTTP 请求体：单个请求或批量请求
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Single(JsonRpcRequest),
    Batch(Vec<Value>),
}

/// JSON-RPC 2.0 响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Success {
        jsonrpc: String,
        result: Value,
        id: RequestId,
    },
    Error {
        jsonrpc: String,
        error: JsonRpcError,
        id: RequestId,
    },
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        JsonRpcResponse::Success {
            jsonrpc: "2.0".to_string(),
            result,
            id,
        }
    }

    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        JsonRpcResponse::Error {
            jsonrpc: "2.0".to_string(),
            error,
            id,
        }
    }

    pub fn id(&self) -> &RequestId {
        match self {
            JsonRpcResponse::Success { id, .. } | JsonRpcResponse::Error { id, .. } => id,
        }
    }
}

/// 请求 ID（可以是字符串、数字或 null）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
    #[default]
    Null,
}

/// JSON-RPC 错误结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// 标准 JSON-RPC 错误代码（EIP-1474 规范）
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700; // 解析错误
    pub const INVALID_REQUEST: i32 = -32600; // 无效请求
    pub const METHOD_NOT_FOUND: i32 = -32601; // 方法未找到
    pub const INVALID_PARAMS: i32 = -32602; // 无效参数
    pub const INTERNAL_ERROR: i32 = -32603; // 内部错误
    pub const SERVER_ERROR: i32 = -32000; // 回调/服务器错误
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_serialization() {
        // 测试请求 ID 的序列化
        let json = serde_json::to_string(&RequestId::Number(1)).unwrap();
        assert_eq!(json, "1");

        let json = serde_json::to_string(&RequestId::String("test".to_string())).unwrap();
        assert_eq!(json, "\"test\"");

        let json = serde_json::to_string(&RequestId::Null).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn test_request_defaults() {
        // 测试缺省的 params 与 id
        let req: JsonRpcRequest = serde_json::from_value(json!({"method": "eth_chainId"})).unwrap();
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.params, Value::Null);
        assert_eq!(req.id, RequestId::Null);
    }

    #[test]
    fn test_payload_single_and_batch() {
        let single: JsonRpcPayload =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "eth_blockNumber", "id": 1})).unwrap();
        assert!(matches!(single, JsonRpcPayload::Single(_)));

        let batch: JsonRpcPayload = serde_json::from_value(json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "id": 1},
            {"jsonrpc": "2.0", "method": "eth_chainId", "id": "b"}
        ]))
        .unwrap();
        match batch {
            JsonRpcPayload::Batch(items) => assert_eq!(items.len(), 2),
            _ => panic!("应解析为批量请求"),
        }
    }

    #[test]
    fn test_json_rpc_response_error() {
        let response = JsonRpcResponse::error(
            RequestId::Number(1),
            JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "Method not found"),
        );

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], json!(-32601));
        assert!(json.get("result").is_none());
        assert_eq!(response.id(), &RequestId::Number(1));
    }
}
