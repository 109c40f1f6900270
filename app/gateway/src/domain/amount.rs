//! 金额换算
//!
//! 节点金额以币为单位，最小精度为 1e-8（聪）；以太坊金额以 wei 为单位（1e-18）。
//! 内部使用 1e-9 币的定点整数表示，以便精确复现 wei → 币 的两段截断。

use ethereum_types::U256;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// 1 聪 = 1e10 wei
pub const WEI_PER_SATOSHI: u64 = 10_000_000_000;
/// 1 纳币单位 = 1e9 wei
const WEI_PER_NANO: u64 = 1_000_000_000;
const NANOS_PER_COIN: u128 = 1_000_000_000;
const NANOS_PER_SATOSHI: u128 = 10;
const FRACTION_DIGITS: usize = 9;

/// 默认最低 gas 价格（聪），即 0.0000004 币
pub const DEFAULT_MIN_GAS_PRICE_SATOSHI: u64 = 40;

/// 金额换算错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("无法解析金额: {0}")]
    Malformed(String),
    #[error("金额不可精确表示: {0}")]
    NonRepresentable(String),
    #[error("不支持负数金额: {0}")]
    Negative(String),
    #[error("金额溢出")]
    Overflow,
}

/// 节点金额（1e-9 币为单位的定点数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NativeAmount {
    nanos: u128,
}

impl NativeAmount {
    pub const ZERO: NativeAmount = NativeAmount { nanos: 0 };

    pub fn from_satoshis(satoshis: u64) -> Self {
        Self {
            nanos: satoshis as u128 * NANOS_PER_SATOSHI,
        }
    }

    pub fn from_nanos(nanos: u128) -> Self {
        Self { nanos }
    }

    pub fn nanos(&self) -> u128 {
        self.nanos
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// 截断到聪
    pub fn satoshis(&self) -> u128 {
        self.nanos / NANOS_PER_SATOSHI
    }

    /// 解析十进制金额字符串，支持科学计数法（如 "1e-8"）
    ///
    /// 超出 1e-9 精度的非零位数视为不可表示。
    pub fn parse(text: &str) -> Result<Self, AmountError> {
        let s = text.trim();
        if s.is_empty() {
            return Err(AmountError::Malformed(text.to_string()));
        }
        if s.starts_with('-') {
            let rest = s.trim_start_matches('-');
            if rest.chars().all(|c| c == '0' || c == '.') {
                return Ok(Self::ZERO);
            }
            return Err(AmountError::Negative(text.to_string()));
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let (mantissa, exponent) = match s.find(['e', 'E']) {
            Some(pos) => {
                let exp: i32 = s[pos + 1..]
                    .parse()
                    .map_err(|_| AmountError::Malformed(text.to_string()))?;
                (&s[..pos], exp)
            }
            None => (s, 0),
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::Malformed(text.to_string()));
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Malformed(text.to_string()));
        }

        // 去掉尾随零，避免无意义的精度判断
        let frac_part = frac_part.trim_end_matches('0');
        let digits: String = format!("{}{}", int_part, frac_part);
        let digits = digits.trim_start_matches('0');
        let mantissa_value: u128 = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| AmountError::Overflow)?
        };

        // value = mantissa_value * 10^(exponent - frac_len)，换算为纳单位再乘 10^9
        let shift = exponent as i64 - frac_part.len() as i64 + FRACTION_DIGITS as i64;
        let nanos = if shift >= 0 {
            let factor = 10u128
                .checked_pow(u32::try_from(shift).map_err(|_| AmountError::Overflow)?)
                .ok_or(AmountError::Overflow)?;
            mantissa_value.checked_mul(factor).ok_or(AmountError::Overflow)?
        } else if mantissa_value == 0 {
            0
        } else {
            let divisor = u32::try_from(-shift)
                .ok()
                .and_then(|d| 10u128.checked_pow(d))
                .ok_or_else(|| AmountError::NonRepresentable(text.to_string()))?;
            if mantissa_value % divisor != 0 {
                return Err(AmountError::NonRepresentable(text.to_string()));
            }
            mantissa_value / divisor
        };

        Ok(Self { nanos })
    }

    /// 从节点 JSON 数值（或字符串）解析金额
    pub fn from_json(value: &Value) -> Result<Self, AmountError> {
        match value {
            Value::Number(n) => Self::parse(&n.to_string()),
            Value::String(s) => Self::parse(s),
            Value::Null => Ok(Self::ZERO),
            other => Err(AmountError::Malformed(other.to_string())),
        }
    }

    /// 节点金额 → wei，必须精确到聪
    pub fn to_wei(&self) -> Result<U256, AmountError> {
        if self.nanos % NANOS_PER_SATOSHI != 0 {
            return Err(AmountError::NonRepresentable(self.to_string()));
        }
        let sats = U256::from(self.nanos / NANOS_PER_SATOSHI);
        sats.checked_mul(U256::from(WEI_PER_SATOSHI))
            .ok_or(AmountError::Overflow)
    }

    /// wei → 节点金额，两段截断：先 floor(wei * 1e-9)，再乘以 1e-9
    pub fn from_wei(wei: U256) -> Result<Self, AmountError> {
        let stage_one = wei / U256::from(WEI_PER_NANO);
        if stage_one > U256::from(u128::MAX) {
            return Err(AmountError::Overflow);
        }
        Ok(Self {
            nanos: stage_one.as_u128(),
        })
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.nanos.checked_add(other.nanos).map(Self::from_nanos)
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self::from_nanos(self.nanos.saturating_sub(other.nanos))
    }
}

impl fmt::Display for NativeAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.nanos / NANOS_PER_COIN;
        let frac = self.nanos % NANOS_PER_COIN;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:0width$}", frac, width = FRACTION_DIGITS);
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}

/// 聪 → wei
pub fn satoshi_to_wei(satoshis: U256) -> Result<U256, AmountError> {
    satoshis
        .checked_mul(U256::from(WEI_PER_SATOSHI))
        .ok_or(AmountError::Overflow)
}

/// 以太坊 gas 价格（wei）→ 节点 gas 价格，低于下限时取下限
pub fn gas_price_to_native(wei: U256, floor: NativeAmount) -> Result<NativeAmount, AmountError> {
    let converted = NativeAmount::from_wei(wei)?;
    Ok(converted.max(floor))
}
