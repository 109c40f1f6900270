//! 合约脚本解析
//!
//! 解析交易输出中反汇编后的操作码脚本，识别 OP_CALL / OP_CREATE（可选 OP_SENDER 前缀）。
//!
//! 脚本布局：
//! - `[version] [gasLimit] [gasPrice] [data] [contract] OP_CALL`
//! - `[version] [gasLimit] [gasPrice] [bytecode] OP_CREATE`
//! - 带发送方时前缀为 `[addrType] [sender] [signature] OP_SENDER`

use ethereum_types::{H160, U256};
use thiserror::Error;

pub const OP_CALL: &str = "OP_CALL";
pub const OP_CREATE: &str = "OP_CREATE";
pub const OP_SENDER: &str = "OP_SENDER";
pub const OP_SPEND: &str = "OP_SPEND";

const CALL_TOKENS: usize = 6;
const CREATE_TOKENS: usize = 5;
const SENDER_PREFIX_TOKENS: usize = 4;

/// 合约交互类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    Call,
    Create,
}

/// 从合约脚本中提取的调用信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInfo {
    pub kind: ContractKind,
    /// 仅在存在 OP_SENDER 时有值
    pub from: Option<H160>,
    /// 被调用的合约地址，合约创建时为 None
    pub to: Option<H160>,
    pub gas_limit: U256,
    /// 单位：聪
    pub gas_price: U256,
    /// 调用数据或合约字节码
    pub user_input: Vec<u8>,
}

/// 脚本解析错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("脚本格式错误: {0}")]
    Malformed(String),
    #[error("无效的脚本数值: {0}")]
    InvalidNumber(String),
    #[error("无效的脚本数据: {0}")]
    InvalidData(String),
}

/// 将 asm 文本拆分为操作码/数据片段
pub fn tokenize(asm: &str) -> Vec<&str> {
    asm.split_whitespace().collect()
}

/// 脚本的最后一个操作码
pub fn final_opcode<'a>(tokens: &[&'a str]) -> Option<&'a str> {
    tokens.last().copied()
}

/// 解析合约脚本；末尾不是 OP_CALL / OP_CREATE 时返回 Ok(None)
pub fn parse_contract_script(asm: &str) -> Result<Option<ContractInfo>, ScriptError> {
    let tokens = tokenize(asm);
    match final_opcode(&tokens) {
        Some(OP_CALL) => parse_call(&tokens).map(Some),
        Some(OP_CREATE) => parse_create(&tokens).map(Some),
        _ => Ok(None),
    }
}

/// 解析 OP_CALL 脚本（带或不带 OP_SENDER）
pub fn parse_call(tokens: &[&str]) -> Result<ContractInfo, ScriptError> {
    let (from, body) = split_sender(tokens, CALL_TOKENS)?;
    Ok(ContractInfo {
        kind: ContractKind::Call,
        from,
        to: Some(parse_hash(body[4])?),
        gas_limit: parse_script_number(body[1])?,
        gas_price: parse_script_number(body[2])?,
        user_input: parse_data(body[3])?,
    })
}

/// 解析 OP_CREATE 脚本（带或不带 OP_SENDER）
pub fn parse_create(tokens: &[&str]) -> Result<ContractInfo, ScriptError> {
    let (from, body) = split_sender(tokens, CREATE_TOKENS)?;
    Ok(ContractInfo {
        kind: ContractKind::Create,
        from,
        to: None,
        gas_limit: parse_script_number(body[1])?,
        gas_price: parse_script_number(body[2])?,
        user_input: parse_data(body[3])?,
    })
}

fn split_sender<'a, 'b>(
    tokens: &'b [&'a str],
    body_len: usize,
) -> Result<(Option<H160>, &'b [&'a str]), ScriptError> {
    if tokens.len() == body_len {
        return Ok((None, tokens));
    }
    if tokens.len() == body_len + SENDER_PREFIX_TOKENS && tokens[SENDER_PREFIX_TOKENS - 1] == OP_SENDER {
        let sender = parse_hash(tokens[1])?;
        return Ok((Some(sender), &tokens[SENDER_PREFIX_TOKENS..]));
    }
    Err(ScriptError::Malformed(tokens.join(" ")))
}

fn parse_hash(token: &str) -> Result<H160, ScriptError> {
    let bytes = hex::decode(token).map_err(|_| ScriptError::InvalidData(token.to_string()))?;
    if bytes.len() != 20 {
        return Err(ScriptError::InvalidData(token.to_string()));
    }
    Ok(H160::from_slice(&bytes))
}

fn parse_data(token: &str) -> Result<Vec<u8>, ScriptError> {
    // 空数据被反汇编为 "0"
    if token == "0" {
        return Ok(Vec::new());
    }
    hex::decode(token).map_err(|_| ScriptError::InvalidData(token.to_string()))
}

/// 解析脚本中的数值
///
/// 不超过 4 字节的数值被反汇编为十进制，更长的数值以小端十六进制给出。
pub fn parse_script_number(token: &str) -> Result<U256, ScriptError> {
    if token.len() <= 10 && !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        return U256::from_dec_str(token).map_err(|_| ScriptError::InvalidNumber(token.to_string()));
    }
    let mut bytes = hex::decode(token).map_err(|_| ScriptError::InvalidNumber(token.to_string()))?;
    if bytes.is_empty() || bytes.len() > 32 {
        return Err(ScriptError::InvalidNumber(token.to_string()));
    }
    bytes.reverse();
    Ok(U256::from_big_endian(&bytes))
}
