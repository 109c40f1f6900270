//! 接口层：JSON-RPC 类型、方法分发与 HTTP/WebSocket 服务器

pub mod json_types;
pub mod jsonrpc;
pub mod server;
