//! Exact decimal money.
//!
//! spec.md §3: "All monetary amounts are exact decimals with currency; no
//! floating point anywhere in the core." `Decimal` gives us that without
//! hand-rolling a fixed-point scale the way a trading-engine ledger would
//! (ticks/lots don't apply here - payroll amounts are already base-currency
//! decimals).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Amount = Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Usd,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "USD" => Some(Currency::Usd),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_round_trips() {
        assert_eq!(Currency::parse("USD"), Some(Currency::Usd));
        assert_eq!(Currency::parse("EUR"), None);
        assert_eq!(Currency::Usd.code(), "USD");
    }

    #[test]
    fn direction_opposite_is_involutive() {
        assert_eq!(Direction::Debit.opposite(), Direction::Credit);
        assert_eq!(Direction::Credit.opposite().opposite(), Direction::Credit);
    }
}
