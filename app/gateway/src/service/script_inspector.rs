//! 脚本检查
//!
//! 从交易输出中识别合约交互，并解析发送方/接收方地址。
//! 输入引用的前序输出以 OP_SPEND 结尾时，真正的来源不在本交易中，
//! 需要沿前序交易回溯，直到遇到 OP_CREATE / OP_CALL。

use crate::domain::address::{self, AddressError};
use crate::domain::error::NodeError;
use crate::domain::native_types::{RawTransaction, TxOutput};
use crate::domain::script::{self, ContractInfo, ScriptError, OP_CALL, OP_CREATE, OP_SPEND};
use crate::service::node_api::NodeApi;
use ethereum_types::H160;
use thiserror::Error;
use tracing::debug;

/// OP_SPEND 回溯的最大跳数
pub const MAX_SPEND_HOPS: usize = 32;

/// 地址解析错误
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("交易没有输入，无法确定发送方")]
    NoInputs,
    #[error("交易输入中没有 OP_SPEND")]
    NoSpendInput,
    #[error("前序交易 {txid} 中不存在输出 {vout}")]
    OutputMissing { txid: String, vout: u32 },
    #[error("合约创建脚本中没有发送方")]
    NoSender,
    #[error("无法从脚本中确定发送方: {0}")]
    Unresolved(String),
    #[error("OP_SPEND 回溯超过 {0} 跳")]
    TooManyHops(usize),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// 第一个携带合约脚本的输出；无法解析的脚本视为非合约输出
pub fn contract_info(outputs: &[TxOutput]) -> Option<ContractInfo> {
    outputs.iter().find_map(|out| {
        match script::parse_contract_script(&out.script_pub_key.asm) {
            Ok(info) => info,
            Err(e) => {
                debug!(n = out.n, error = %e, "忽略无法解析的合约脚本");
                None
            }
        }
    })
}

/// 第一个暴露非空地址的输出对应的地址
pub fn receiver_address(outputs: &[TxOutput]) -> Result<Option<H160>, AddressError> {
    for out in outputs {
        if let Some(addr) = out.script_pub_key.first_address() {
            return address::decode(addr).map(Some);
        }
    }
    Ok(None)
}

/// 依赖节点查询的脚本检查器
pub struct ScriptInspector {
    node: NodeApi,
}

impl ScriptInspector {
    pub fn new(node: NodeApi) -> Self {
        Self { node }
    }

    /// 非合约交易的发送方：第一个带地址的输入，否则沿 OP_SPEND 回溯
    pub async fn sender_address(&self, txid: &str) -> Result<H160, InspectError> {
        let raw = self.node.get_raw_transaction(txid).await?;
        if raw.vin.is_empty() {
            return Err(InspectError::NoInputs);
        }
        if let Some(input) = raw.vin.iter().find(|i| !i.address.is_empty()) {
            return Ok(address::decode(&input.address)?);
        }
        self.resolve_spend_origin(raw).await
    }

    /// 沿 OP_SPEND 链回溯到合约来源
    pub async fn resolve_spend_origin(&self, start: RawTransaction) -> Result<H160, InspectError> {
        let mut current = start;
        for hop in 0..MAX_SPEND_HOPS {
            let input = current
                .vin
                .iter()
                .find(|i| i.script_asm() == OP_SPEND)
                .ok_or(InspectError::NoSpendInput)?;
            let vout = input.vout.ok_or(InspectError::NoSpendInput)?;
            let prev_txid = input.txid.clone();

            let prev = self.node.get_raw_transaction(&prev_txid).await?;
            let output = prev
                .vout
                .iter()
                .find(|o| o.n == vout)
                .or_else(|| prev.vout.get(vout as usize))
                .ok_or_else(|| InspectError::OutputMissing {
                    txid: prev_txid.clone(),
                    vout,
                })?;

            let tokens = script::tokenize(&output.script_pub_key.asm);
            debug!(hop, txid = %prev_txid, vout, "回溯 OP_SPEND");
            match script::final_opcode(&tokens) {
                Some(OP_SPEND) => {
                    current = prev;
                }
                Some(OP_CREATE) => {
                    // 合约创建的来源是其发送方
                    let info = script::parse_create(&tokens)?;
                    return info.from.ok_or(InspectError::NoSender);
                }
                Some(OP_CALL) => {
                    // 合约调用的来源是被调用的合约
                    let info = script::parse_call(&tokens)?;
                    return info.to.ok_or_else(|| InspectError::Unresolved(output.script_pub_key.asm.clone()));
                }
                _ => return Err(InspectError::Unresolved(output.script_pub_key.asm.clone())),
            }
        }
        Err(InspectError::TooManyHops(MAX_SPEND_HOPS))
    }
}
