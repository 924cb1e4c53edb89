//! Inbound events from the presentation layer.

use crate::payout::PayoutRail;

const MIN_CODE_DIGITS: usize = 4;
const MAX_CODE_DIGITS: usize = 8;

/// One user action delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Entry action. `rail` selects the payout rail for withdrawals and is
    /// ignored by the selling flow.
    Start { rail: Option<PayoutRail> },
    Cancel,
    Confirm,
    Text(String),
}

impl Inbound {
    /// Map free-form user text to an inbound event.
    pub fn parse(content: &str) -> Self {
        let trimmed = content.trim();
        let lower = trimmed.to_lowercase();

        match lower.as_str() {
            "/sell" | "/withdraw" | "/start" => Self::Start { rail: None },
            "/cancel" | "cancel" => Self::Cancel,
            "yes" | "confirm" | "/confirm" => Self::Confirm,
            _ => parse_start_with_rail(&lower).unwrap_or_else(|| Self::Text(trimmed.to_string())),
        }
    }
}

/// `/withdraw <rail>`
fn parse_start_with_rail(lower: &str) -> Option<Inbound> {
    let rest = lower.strip_prefix("/withdraw ")?;
    let rail = rest.trim().parse::<PayoutRail>().ok()?;
    Some(Inbound::Start { rail: Some(rail) })
}

/// Normalize a login code: whitespace is dropped and the rest must be
/// 4–8 ASCII digits.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let valid = (MIN_CODE_DIGITS..=MAX_CODE_DIGITS).contains(&code.len())
        && code.chars().all(|c| c.is_ascii_digit());
    valid.then_some(code)
}
