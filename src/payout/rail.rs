//! Payout rails and per-rail address validation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PayoutParseError;

/// Minimum length of a Tron base58 address.
const TRON_MIN_LEN: usize = 34;
/// `0x` plus 40 hex digits.
const EVM_MIN_LEN: usize = 42;

/// Currency paid out on a rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Trx,
    Usdt,
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trx => "TRX",
            Self::Usdt => "USDT",
        };
        write!(f, "{s}")
    }
}

/// Shape of a destination identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFormat {
    /// Base58 address beginning with `T`.
    Tron,
    /// Hex address beginning with `0x`.
    Evm,
    /// Email-shaped exchange account identifier.
    ExchangeAccount,
}

/// Withdrawal method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutRail {
    /// Native TRX on Tron.
    Trx,
    /// USDT on Tron.
    UsdtTrc20,
    /// USDT on BNB Smart Chain.
    UsdtBep20,
    /// Internal transfer to an exchange account.
    ExchangePay,
}

impl PayoutRail {
    pub fn currency(&self) -> Currency {
        match self {
            Self::Trx => Currency::Trx,
            Self::UsdtTrc20 | Self::UsdtBep20 | Self::ExchangePay => Currency::Usdt,
        }
    }

    pub fn address_format(&self) -> AddressFormat {
        match self {
            Self::Trx | Self::UsdtTrc20 => AddressFormat::Tron,
            Self::UsdtBep20 => AddressFormat::Evm,
            Self::ExchangePay => AddressFormat::ExchangeAccount,
        }
    }

    /// Validate `raw` as a destination on this rail, returning the trimmed
    /// address.
    pub fn validate_address(&self, raw: &str) -> Result<String, PayoutParseError> {
        let address = raw.trim();
        let invalid = |reason: &str| PayoutParseError::InvalidAddress {
            rail: self.to_string(),
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if address.is_empty() {
            return Err(invalid("empty address"));
        }

        match self.address_format() {
            AddressFormat::Tron => {
                if !address.starts_with('T') {
                    return Err(invalid("must start with 'T'"));
                }
                if address.len() < TRON_MIN_LEN {
                    return Err(invalid("too short"));
                }
                if !address.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(invalid("contains non-alphanumeric characters"));
                }
            }
            AddressFormat::Evm => {
                let Some(hex) = address.strip_prefix("0x") else {
                    return Err(invalid("must start with '0x'"));
                };
                if address.len() < EVM_MIN_LEN {
                    return Err(invalid("too short"));
                }
                if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("contains non-hex characters"));
                }
            }
            AddressFormat::ExchangeAccount => {
                if !address.contains('@') || !address.contains('.') {
                    return Err(invalid("must contain '@' and '.'"));
                }
                if address.chars().any(char::is_whitespace) {
                    return Err(invalid("contains whitespace"));
                }
            }
        }

        Ok(address.to_string())
    }
}

impl std::fmt::Display for PayoutRail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trx => "trx",
            Self::UsdtTrc20 => "usdt_trc20",
            Self::UsdtBep20 => "usdt_bep20",
            Self::ExchangePay => "exchange_pay",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PayoutRail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trx" => Ok(Self::Trx),
            "usdt_trc20" | "trc20" => Ok(Self::UsdtTrc20),
            "usdt_bep20" | "bep20" => Ok(Self::UsdtBep20),
            "exchange_pay" | "exchange" => Ok(Self::ExchangePay),
            other => Err(format!("unknown payout rail: {other}")),
        }
    }
}
