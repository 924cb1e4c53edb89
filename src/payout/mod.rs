//! Withdrawal payouts — rails, input parsing, and the request record.

pub mod parser;
pub mod rail;
pub mod request;

pub use parser::{ParsedPayout, parse, parse_amount};
pub use rail::{AddressFormat, Currency, PayoutRail};
pub use request::{WithdrawalRequest, WithdrawalStatus};
