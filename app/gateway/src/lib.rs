//! Gateway 节点桥接库
//!
//! 在 UTXO 智能合约节点前提供以太坊兼容的 JSON-RPC 接口

pub mod config;
pub mod domain;
pub mod inbound;
pub mod infrastructure;
pub mod service;
