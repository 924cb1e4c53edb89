//! Withdrawal input parser.
//!
//! Turns free-form user text into an address, optionally paired with an
//! amount. Accepted shapes, checked in order:
//!
//! 1. Labelled fields (`address: ...`, `amount: ...`), any order, on one
//!    line or several.
//! 2. A bare address on a single line.
//! 3. A bare address followed by a bare amount on the next line.
//!
//! The parser is pure: it never looks at conversation state.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use super::rail::PayoutRail;
use crate::error::PayoutParseError;

/// Currency symbols tolerated in front of an amount.
const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '₮', '₽', '₹'];

static ADDRESS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:address|addr|wallet)\s*[:=]\s*(\S+)").expect("valid address label regex")
});

static AMOUNT_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\b(?:amount|amt|sum)\s*[:=]\s*(.+?)\s*(?:\b(?:address|addr|wallet)\s*[:=]|$)")
        .expect("valid amount label regex")
});

/// A successfully parsed withdrawal submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPayout {
    AddressOnly(String),
    AddressAndAmount(String, Decimal),
}

impl ParsedPayout {
    pub fn address(&self) -> &str {
        match self {
            Self::AddressOnly(addr) | Self::AddressAndAmount(addr, _) => addr,
        }
    }

    pub fn amount(&self) -> Option<Decimal> {
        match self {
            Self::AddressOnly(_) => None,
            Self::AddressAndAmount(_, amount) => Some(*amount),
        }
    }
}

/// Parse a withdrawal submission for `rail`.
pub fn parse(raw: &str, rail: PayoutRail) -> Result<ParsedPayout, PayoutParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(PayoutParseError::Empty);
    }

    if let Some(parsed) = parse_labelled(text, rail)? {
        return Ok(parsed);
    }

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    match lines.as_slice() {
        [address] => Ok(ParsedPayout::AddressOnly(rail.validate_address(address)?)),
        [address, amount] => {
            let address = rail.validate_address(address)?;
            let amount = parse_amount(amount)?;
            Ok(ParsedPayout::AddressAndAmount(address, amount))
        }
        _ => Err(PayoutParseError::Unrecognized),
    }
}

/// Labelled form. Returns `Ok(None)` when no address label is present so the
/// caller can fall through to the bare forms.
fn parse_labelled(text: &str, rail: PayoutRail) -> Result<Option<ParsedPayout>, PayoutParseError> {
    let Some(address) = ADDRESS_LABEL.captures(text).and_then(|c| c.get(1)) else {
        if AMOUNT_LABEL.is_match(text) {
            // An amount without a destination is never enough.
            return Err(PayoutParseError::Unrecognized);
        }
        return Ok(None);
    };
    let address = rail.validate_address(address.as_str())?;

    match AMOUNT_LABEL.captures(text).and_then(|c| c.get(1)) {
        Some(amount) => {
            let amount = parse_amount(amount.as_str())?;
            Ok(Some(ParsedPayout::AddressAndAmount(address, amount)))
        }
        None => Ok(Some(ParsedPayout::AddressOnly(address))),
    }
}

/// Parse a bare amount: optional currency symbol, arbitrary whitespace,
/// strictly positive.
pub fn parse_amount(raw: &str) -> Result<Decimal, PayoutParseError> {
    let invalid = |reason: &str| PayoutParseError::InvalidAmount {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = compact
        .strip_prefix(CURRENCY_SYMBOLS)
        .unwrap_or(compact.as_str());

    if digits.is_empty() {
        return Err(invalid("no number"));
    }
    if !digits
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+')
    {
        return Err(invalid("not a number"));
    }

    let amount = Decimal::from_str(digits).map_err(|_| invalid("not a number"))?;
    if amount <= Decimal::ZERO {
        return Err(invalid("must be positive"));
    }
    Ok(amount)
}
