//! 服务层

pub mod cancel;
pub mod chain_detector;
pub mod error_recovery;
pub mod filters;
pub mod log_search;
pub mod node_api;
pub mod script_inspector;
pub mod subscription;
pub mod transaction_resolver;
