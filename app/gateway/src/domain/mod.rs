//! 领域层：地址、金额、脚本、日志过滤与节点/以太坊数据类型

pub mod address;
pub mod amount;
pub mod error;
pub mod eth_types;
pub mod log_filter;
pub mod native_types;
pub mod script;
