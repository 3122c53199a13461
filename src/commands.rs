//! Command and Response types shared by the queue, the engine and the
//! workload parser.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::account::{Money, Shares};

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// The fifteen client command kinds, wire codes 0..=14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    Add = 0,
    Quote = 1,
    Buy = 2,
    CommitBuy = 3,
    CancelBuy = 4,
    Sell = 5,
    CommitSell = 6,
    CancelSell = 7,
    SetBuyAmount = 8,
    CancelSetBuy = 9,
    SetBuyTrigger = 10,
    SetSellAmount = 11,
    SetSellTrigger = 12,
    CancelSetSell = 13,
    Dumplog = 14,
}

impl CommandType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use CommandType::*;
        match code {
            0 => Some(Add),
            1 => Some(Quote),
            2 => Some(Buy),
            3 => Some(CommitBuy),
            4 => Some(CancelBuy),
            5 => Some(Sell),
            6 => Some(CommitSell),
            7 => Some(CancelSell),
            8 => Some(SetBuyAmount),
            9 => Some(CancelSetBuy),
            10 => Some(SetBuyTrigger),
            11 => Some(SetSellAmount),
            12 => Some(SetSellTrigger),
            13 => Some(CancelSetSell),
            14 => Some(Dumplog),
            _ => None,
        }
    }

    /// Workload-file spelling of the command.
    pub fn name(self) -> &'static str {
        use CommandType::*;
        match self {
            Add => "ADD",
            Quote => "QUOTE",
            Buy => "BUY",
            CommitBuy => "COMMIT_BUY",
            CancelBuy => "CANCEL_BUY",
            Sell => "SELL",
            CommitSell => "COMMIT_SELL",
            CancelSell => "CANCEL_SELL",
            SetBuyAmount => "SET_BUY_AMOUNT",
            CancelSetBuy => "CANCEL_SET_BUY",
            SetBuyTrigger => "SET_BUY_TRIGGER",
            SetSellAmount => "SET_SELL_AMOUNT",
            SetSellTrigger => "SET_SELL_TRIGGER",
            CancelSetSell => "CANCEL_SET_SELL",
            Dumplog => "DUMPLOG",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use CommandType::*;
        match name {
            "ADD" => Some(Add),
            "QUOTE" => Some(Quote),
            "BUY" => Some(Buy),
            "COMMIT_BUY" => Some(CommitBuy),
            "CANCEL_BUY" => Some(CancelBuy),
            "SELL" => Some(Sell),
            "COMMIT_SELL" => Some(CommitSell),
            "CANCEL_SELL" => Some(CancelSell),
            "SET_BUY_AMOUNT" => Some(SetBuyAmount),
            "CANCEL_SET_BUY" => Some(CancelSetBuy),
            "SET_BUY_TRIGGER" => Some(SetBuyTrigger),
            "SET_SELL_AMOUNT" => Some(SetSellAmount),
            "SET_SELL_TRIGGER" => Some(SetSellTrigger),
            "CANCEL_SET_SELL" => Some(CancelSetSell),
            "DUMPLOG" => Some(Dumplog),
            _ => None,
        }
    }
}

/// One client command. Immutable once enqueued; redelivery hands workers the
/// same value again, so handlers see identical fields on every attempt.
///
/// `amount` is in integer cents for money commands and doubles as the firing
/// price for SET_*_TRIGGER.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub transaction_id: u64,
    pub command_type: CommandType,
    pub user_id: String,
    #[serde(default)]
    pub amount: Money,
    #[serde(default)]
    pub stock_symbol: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl Command {
    pub fn new(transaction_id: u64, command_type: CommandType, user_id: &str) -> Self {
        Self {
            transaction_id,
            command_type,
            user_id: user_id.to_string(),
            amount: 0,
            stock_symbol: String::new(),
            file_name: String::new(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.stock_symbol = symbol.to_string();
        self
    }

    pub fn with_file_name(mut self, file_name: &str) -> Self {
        self.file_name = file_name.to_string();
        self
    }
}

/// Outcome of one command, stored one-shot in the queue's completed map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<Shares>,
    /// Amount the client asked to spend or raise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_amount: Option<Money>,
    /// Whole-share amount the order actually works out to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<u64>,
}

impl Response {
    pub fn ok() -> Self {
        Response { success: true, ..Default::default() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Response { success: false, message: Some(message.into()), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_codes_round_trip() {
        for code in 0..=14u8 {
            let cmd = CommandType::from_code(code).unwrap();
            assert_eq!(cmd.code(), code);
            assert_eq!(CommandType::from_name(cmd.name()), Some(cmd));
        }
        assert_eq!(CommandType::from_code(15), None);
        assert_eq!(CommandType::from_name("HOLD"), None);
    }

    #[test]
    fn test_response_serializes_without_empty_fields() {
        let resp = Response::ok();
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
    }

    #[test]
    fn test_command_builder() {
        let cmd = Command::new(7, CommandType::Buy, "alice")
            .with_amount(10_000)
            .with_symbol("ABC");
        assert_eq!(cmd.transaction_id, 7);
        assert_eq!(cmd.amount, 10_000);
        assert_eq!(cmd.stock_symbol, "ABC");
        assert!(cmd.timestamp_ms > 0);
    }
}
