//! Per-user account state and reservation arithmetic.
//!
//! `balance` is the user's total money in cents; `reserved` is the slice of
//! it held for standing buy triggers, so the spendable portion is
//! `balance - reserved`. Share positions keep `real` and `reserved` as
//! disjoint pools and move shares between them.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

pub type Money = i64;
pub type Shares = i64;

/// Holding of one stock symbol. `real` shares are sellable; `reserved`
/// shares back a standing sell trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub real: Shares,
    pub reserved: Shares,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: Money,
    pub reserved: Money,
    pub stocks: FxHashMap<String, Position>,
}

impl Account {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: 0,
            reserved: 0,
            stocks: FxHashMap::default(),
        }
    }

    /// Spendable money: total minus outstanding reservations.
    pub fn free_balance(&self) -> Money {
        self.balance - self.reserved
    }

    pub fn deposit(&mut self, amount: Money) {
        self.balance += amount;
    }

    /// Debit spendable money (balance drops, reservations untouched).
    pub fn withdraw(&mut self, amount: Money) -> Result<(), EngineError> {
        if self.free_balance() < amount {
            return Err(EngineError::InsufficientFunds);
        }
        self.balance -= amount;
        Ok(())
    }

    /// Earmark spendable money. The total balance does not change.
    pub fn reserve(&mut self, amount: Money) -> Result<(), EngineError> {
        if self.free_balance() < amount {
            return Err(EngineError::InsufficientFunds);
        }
        self.reserved += amount;
        Ok(())
    }

    /// Return earmarked money to the spendable portion.
    pub fn unreserve(&mut self, amount: Money) -> Result<(), EngineError> {
        if self.reserved < amount {
            return Err(EngineError::InsufficientFunds);
        }
        self.reserved -= amount;
        Ok(())
    }

    pub fn position(&self, symbol: &str) -> Position {
        self.stocks.get(symbol).copied().unwrap_or_default()
    }

    fn position_mut(&mut self, symbol: &str) -> &mut Position {
        self.stocks.entry(symbol.to_string()).or_default()
    }

    pub fn credit_shares(&mut self, symbol: &str, shares: Shares) {
        self.position_mut(symbol).real += shares;
    }

    pub fn debit_shares(&mut self, symbol: &str, shares: Shares) -> Result<(), EngineError> {
        let pos = self.position_mut(symbol);
        if pos.real < shares {
            return Err(EngineError::InsufficientShares);
        }
        pos.real -= shares;
        Ok(())
    }

    /// Move shares from the sellable pool into the reserved pool.
    pub fn reserve_shares(&mut self, symbol: &str, shares: Shares) -> Result<(), EngineError> {
        let pos = self.position_mut(symbol);
        if pos.real < shares {
            return Err(EngineError::InsufficientShares);
        }
        pos.real -= shares;
        pos.reserved += shares;
        Ok(())
    }

    /// Move shares back from the reserved pool into the sellable pool.
    pub fn unreserve_shares(&mut self, symbol: &str, shares: Shares) -> Result<(), EngineError> {
        let pos = self.position_mut(symbol);
        if pos.reserved < shares {
            return Err(EngineError::InsufficientShares);
        }
        pos.reserved -= shares;
        pos.real += shares;
        Ok(())
    }
}
