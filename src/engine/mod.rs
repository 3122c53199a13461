//! Command dispatch and the per-command-type handlers.
//!
//! The engine is stateless: every call corresponds to one dequeued command
//! and may be a redelivery of an earlier attempt. Failures become failure
//! Responses and audit ErrorEvents; nothing propagates across the dispatch
//! boundary as a panic or Err.

pub mod triggers;

use std::sync::Arc;
use std::time::Duration;

use crate::account::Money;
use crate::audit::{audit_now_ms, AuditEvent, AuditLog};
use crate::commands::{now_ms, Command, CommandType, Response};
use crate::errors::EngineError;
use crate::ledger::{Ledger, PendingTransaction, TradeKind, Trigger, TriggerKey};
use crate::quotes::{QuoteData, QuoteSource};

pub struct TransactionEngine {
    ledger: Arc<Ledger>,
    quotes: Arc<dyn QuoteSource>,
    audit: Arc<dyn AuditLog>,
    pending_expiry: Duration,
}

impl TransactionEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        quotes: Arc<dyn QuoteSource>,
        audit: Arc<dyn AuditLog>,
        pending_expiry: Duration,
    ) -> Self {
        Self { ledger, quotes, audit, pending_expiry }
    }

    /// Route one command to its handler and convert errors to responses.
    pub fn dispatch(&self, cmd: &Command) -> Response {
        self.audit.record(AuditEvent::UserCommand {
            transaction_id: cmd.transaction_id,
            command: cmd.command_type.name().to_string(),
            user_id: cmd.user_id.clone(),
            stock_symbol: cmd.stock_symbol.clone(),
            amount: cmd.amount,
            timestamp_ms: audit_now_ms(),
        });

        let result = match cmd.command_type {
            CommandType::Add => self.add(cmd),
            CommandType::Quote => self.quote(cmd),
            CommandType::Buy => self.buy(cmd),
            CommandType::CommitBuy => self.commit_buy(cmd),
            CommandType::CancelBuy => self.cancel_buy(cmd),
            CommandType::Sell => self.sell(cmd),
            CommandType::CommitSell => self.commit_sell(cmd),
            CommandType::CancelSell => self.cancel_sell(cmd),
            CommandType::SetBuyAmount => self.set_buy_amount(cmd),
            CommandType::CancelSetBuy => self.cancel_set_buy(cmd),
            CommandType::SetBuyTrigger => self.set_buy_trigger(cmd),
            CommandType::SetSellAmount => self.set_sell_amount(cmd),
            CommandType::SetSellTrigger => self.set_sell_trigger(cmd),
            CommandType::CancelSetSell => self.cancel_set_sell(cmd),
            CommandType::Dumplog => self.dumplog(cmd),
        };

        match result {
            Ok(response) => response,
            Err(err) => self.fail(cmd, err),
        }
    }

    fn fail(&self, cmd: &Command, err: EngineError) -> Response {
        log::warn!(
            "txn {} {} for {} failed: {}",
            cmd.transaction_id,
            cmd.command_type.name(),
            cmd.user_id,
            err
        );
        self.audit.record(AuditEvent::ErrorEvent {
            transaction_id: cmd.transaction_id,
            command: cmd.command_type.name().to_string(),
            user_id: cmd.user_id.clone(),
            error: err.to_string(),
            timestamp_ms: audit_now_ms(),
        });
        Response::failure(err.to_string())
    }

    fn audit_account(&self, cmd: &Command, action: &str, amount: Money) {
        self.audit.record(AuditEvent::AccountTransaction {
            transaction_id: cmd.transaction_id,
            user_id: cmd.user_id.clone(),
            action: action.to_string(),
            amount,
            timestamp_ms: audit_now_ms(),
        });
    }

    /// Quote with a sane price; a zero or negative price would poison the
    /// share arithmetic downstream.
    fn priced_quote(&self, cmd: &Command) -> Result<QuoteData, EngineError> {
        let quote =
            self.quotes.get_quote(&cmd.stock_symbol, &cmd.user_id, cmd.transaction_id)?;
        if quote.price <= 0 {
            return Err(EngineError::QuoteUnavailable(format!(
                "non-positive price for {}",
                cmd.stock_symbol
            )));
        }
        Ok(quote)
    }

    // ---- Funding and quotes ----

    fn add(&self, cmd: &Command) -> Result<Response, EngineError> {
        self.ledger.add_user_money(&cmd.user_id, cmd.amount)?;
        self.audit_account(cmd, "add", cmd.amount);
        Ok(Response::ok())
    }

    fn quote(&self, cmd: &Command) -> Result<Response, EngineError> {
        let quote = self.priced_quote(cmd)?;
        Ok(Response { quote: Some(quote.price), stock: Some(quote.symbol), ..Response::ok() })
    }

    // ---- Two-phase buy ----

    fn buy(&self, cmd: &Command) -> Result<Response, EngineError> {
        let account = self.ledger.get_user(&cmd.user_id)?;
        if account.free_balance() < cmd.amount {
            return Err(EngineError::InsufficientFunds);
        }

        let quote = self.priced_quote(cmd)?;
        let shares = cmd.amount / quote.price;
        if shares <= 0 {
            return Err(EngineError::AmountTooSmall(format!(
                "{} cents buys no shares at {}",
                cmd.amount, quote.price
            )));
        }
        let cost = shares * quote.price;
        let expiry_ms = now_ms() + self.pending_expiry.as_millis() as u64;

        // The pending record itself is the hold; no funds move until commit.
        self.ledger.push_pending(PendingTransaction {
            user_id: cmd.user_id.clone(),
            kind: TradeKind::Buy,
            stock: quote.symbol.clone(),
            shares,
            price: cost,
            expiry_ms,
        })?;

        Ok(Response {
            req_amount: Some(cmd.amount),
            real_amount: Some(cost),
            shares: Some(shares),
            stock: Some(quote.symbol),
            expiration_ms: Some(expiry_ms),
            ..Response::ok()
        })
    }

    fn commit_buy(&self, cmd: &Command) -> Result<Response, EngineError> {
        let buy = self.ledger.pop_pending(&cmd.user_id, TradeKind::Buy)?;
        self.ledger.commit_buy(&cmd.user_id, &buy.stock, buy.shares, buy.price)?;
        self.audit_account(cmd, "remove", buy.price);

        Ok(Response {
            stock: Some(buy.stock),
            shares: Some(buy.shares),
            paid: Some(buy.price),
            ..Response::ok()
        })
    }

    fn cancel_buy(&self, cmd: &Command) -> Result<Response, EngineError> {
        let buy = self.ledger.pop_pending(&cmd.user_id, TradeKind::Buy)?;
        Ok(Response { stock: Some(buy.stock), shares: Some(buy.shares), ..Response::ok() })
    }

    // ---- Two-phase sell ----

    fn sell(&self, cmd: &Command) -> Result<Response, EngineError> {
        let account = self.ledger.get_user(&cmd.user_id)?;
        let owned = account.position(&cmd.stock_symbol).real;
        if owned <= 0 {
            return Err(EngineError::InsufficientShares);
        }

        let quote = self.priced_quote(cmd)?;
        let desired = cmd.amount / quote.price;
        if desired <= 0 {
            return Err(EngineError::AmountTooSmall(format!(
                "one share of {} is worth more than {} cents",
                cmd.stock_symbol, cmd.amount
            )));
        }
        let shares = desired.min(owned);
        let proceeds = shares * quote.price;
        let expiry_ms = now_ms() + self.pending_expiry.as_millis() as u64;

        self.ledger.push_pending(PendingTransaction {
            user_id: cmd.user_id.clone(),
            kind: TradeKind::Sell,
            stock: quote.symbol.clone(),
            shares,
            price: proceeds,
            expiry_ms,
        })?;

        Ok(Response {
            req_amount: Some(cmd.amount),
            real_amount: Some(proceeds),
            shares: Some(shares),
            stock: Some(quote.symbol),
            expiration_ms: Some(expiry_ms),
            ..Response::ok()
        })
    }

    fn commit_sell(&self, cmd: &Command) -> Result<Response, EngineError> {
        let sell = self.ledger.pop_pending(&cmd.user_id, TradeKind::Sell)?;
        self.ledger.commit_sell(&cmd.user_id, &sell.stock, sell.shares, sell.price)?;
        self.audit_account(cmd, "add", sell.price);

        Ok(Response {
            stock: Some(sell.stock),
            shares: Some(sell.shares),
            received: Some(sell.price),
            ..Response::ok()
        })
    }

    fn cancel_sell(&self, cmd: &Command) -> Result<Response, EngineError> {
        let sell = self.ledger.pop_pending(&cmd.user_id, TradeKind::Sell)?;
        Ok(Response { stock: Some(sell.stock), shares: Some(sell.shares), ..Response::ok() })
    }

    // ---- Standing buy triggers ----

    fn set_buy_amount(&self, cmd: &Command) -> Result<Response, EngineError> {
        let key = TriggerKey {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Buy,
        };

        // A second SET overwrites: release the hold of the order it replaces.
        match self.ledger.cancel_trigger(&key) {
            Ok(previous) => {
                self.ledger.unreserve_money(&cmd.user_id, previous.amount).map_err(|e| {
                    EngineError::internal(format!("replaced trigger but unreserve failed: {}", e))
                })?;
            }
            Err(EngineError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.ledger.reserve_money(&cmd.user_id, cmd.amount)?;

        let trigger = Trigger {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Buy,
            amount: cmd.amount,
            shares: 0,
            fire_at: 0,
        };
        if let Err(err) = self.ledger.upsert_trigger(trigger) {
            if self.ledger.unreserve_money(&cmd.user_id, cmd.amount).is_err() {
                return Err(EngineError::internal(
                    "trigger insert failed and unreserve compensation failed",
                ));
            }
            return Err(EngineError::internal(format!("failed to store trigger: {}", err)));
        }

        self.audit_account(cmd, "reserve", cmd.amount);
        Ok(Response::ok())
    }

    fn cancel_set_buy(&self, cmd: &Command) -> Result<Response, EngineError> {
        let key = TriggerKey {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Buy,
        };
        let trigger = self.ledger.cancel_trigger(&key)?;
        self.ledger.unreserve_money(&cmd.user_id, trigger.amount).map_err(|e| {
            EngineError::internal(format!("trigger removed but unreserve failed: {}", e))
        })?;

        self.audit_account(cmd, "unreserve", trigger.amount);
        Ok(Response { stock: Some(cmd.stock_symbol.clone()), ..Response::ok() })
    }

    fn set_buy_trigger(&self, cmd: &Command) -> Result<Response, EngineError> {
        let key = TriggerKey {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Buy,
        };
        let mut trigger = self
            .ledger
            .get_trigger(&key)
            .map_err(|_| EngineError::not_found("must SET_BUY_AMOUNT first"))?;
        trigger.fire_at = cmd.amount;
        self.ledger.upsert_trigger(trigger)?;
        Ok(Response::ok())
    }

    // ---- Standing sell triggers ----

    fn set_sell_amount(&self, cmd: &Command) -> Result<Response, EngineError> {
        let key = TriggerKey {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Sell,
        };

        match self.ledger.cancel_trigger(&key) {
            Ok(previous) => {
                self.ledger
                    .unreserve_shares(&cmd.user_id, &cmd.stock_symbol, previous.shares)
                    .map_err(|e| {
                        EngineError::internal(format!(
                            "replaced trigger but unreserve failed: {}",
                            e
                        ))
                    })?;
            }
            Err(EngineError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let account = self.ledger.get_user(&cmd.user_id)?;
        let owned = account.position(&cmd.stock_symbol).real;
        if owned <= 0 {
            return Err(EngineError::InsufficientShares);
        }

        let quote = self.priced_quote(cmd)?;
        let desired = cmd.amount / quote.price;
        if desired <= 0 {
            return Err(EngineError::AmountTooSmall(format!(
                "one share of {} is worth more than {} cents",
                cmd.stock_symbol, cmd.amount
            )));
        }
        let shares = desired.min(owned);

        self.ledger.reserve_shares(&cmd.user_id, &cmd.stock_symbol, shares)?;

        let trigger = Trigger {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Sell,
            amount: cmd.amount,
            shares,
            fire_at: 0,
        };
        if let Err(err) = self.ledger.upsert_trigger(trigger) {
            if self.ledger.unreserve_shares(&cmd.user_id, &cmd.stock_symbol, shares).is_err() {
                return Err(EngineError::internal(
                    "trigger insert failed and unreserve compensation failed",
                ));
            }
            return Err(EngineError::internal(format!("failed to store trigger: {}", err)));
        }

        self.audit_account(cmd, "reserve", cmd.amount);
        Ok(Response { shares: Some(shares), ..Response::ok() })
    }

    fn set_sell_trigger(&self, cmd: &Command) -> Result<Response, EngineError> {
        let key = TriggerKey {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Sell,
        };
        let mut trigger = self
            .ledger
            .get_trigger(&key)
            .map_err(|_| EngineError::not_found("must SET_SELL_AMOUNT first"))?;
        trigger.fire_at = cmd.amount;
        self.ledger.upsert_trigger(trigger)?;
        Ok(Response::ok())
    }

    fn cancel_set_sell(&self, cmd: &Command) -> Result<Response, EngineError> {
        let key = TriggerKey {
            user_id: cmd.user_id.clone(),
            stock: cmd.stock_symbol.clone(),
            kind: TradeKind::Sell,
        };
        let trigger = self.ledger.cancel_trigger(&key)?;
        self.ledger
            .unreserve_shares(&cmd.user_id, &cmd.stock_symbol, trigger.shares)
            .map_err(|e| {
                EngineError::internal(format!("trigger removed but unreserve failed: {}", e))
            })?;

        self.audit_account(cmd, "unreserve", trigger.amount);
        Ok(Response { stock: Some(cmd.stock_symbol.clone()), ..Response::ok() })
    }

    // ---- Logging ----

    fn dumplog(&self, cmd: &Command) -> Result<Response, EngineError> {
        self.audit.record(AuditEvent::DumpLog {
            file_name: cmd.file_name.clone(),
            timestamp_ms: audit_now_ms(),
        });
        Ok(Response::ok())
    }
}
