//! 基础设施层：节点传输、模拟节点与响应缓存

pub mod mock_node;
pub mod node_client;
pub mod response_cache;
