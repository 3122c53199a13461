//! Standing-order evaluation.
//!
//! A fixed-interval poller walks every armed trigger, compares its firing
//! price against the current quote and settles from the trigger's
//! reservation when the condition holds. Firing predicate: a Buy trigger
//! fires when the quote is at or below its price, a Sell trigger when the
//! quote is at or above it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::account::Money;
use crate::audit::{audit_now_ms, AuditEvent, AuditLog};
use crate::errors::EngineError;
use crate::ledger::{Ledger, TradeKind, Trigger};
use crate::quotes::QuoteSource;

pub fn should_fire(trigger: &Trigger, price: Money) -> bool {
    match trigger.kind {
        TradeKind::Buy => price <= trigger.fire_at,
        TradeKind::Sell => price >= trigger.fire_at,
    }
}

pub struct TriggerMan {
    ledger: Arc<Ledger>,
    quotes: Arc<dyn QuoteSource>,
    audit: Arc<dyn AuditLog>,
    poll_interval: Duration,
    shutdown: AtomicBool,
}

impl TriggerMan {
    pub fn new(
        ledger: Arc<Ledger>,
        quotes: Arc<dyn QuoteSource>,
        audit: Arc<dyn AuditLog>,
        poll_interval: Duration,
    ) -> Self {
        Self { ledger, quotes, audit, poll_interval, shutdown: AtomicBool::new(false) }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("trigger-man".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn trigger poller")
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn run(&self) {
        log::info!("trigger poller started (interval {:?})", self.poll_interval);
        while !self.shutdown.load(Ordering::Relaxed) {
            let fired = self.poll_once();
            if fired > 0 {
                log::info!("fired {} triggers this cycle", fired);
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// One evaluation cycle over all armed triggers. Returns how many fired.
    pub fn poll_once(&self) -> usize {
        let mut fired = 0;
        for trigger in self.ledger.armed_triggers() {
            let quote =
                match self.quotes.get_quote(&trigger.stock, &trigger.user_id, 0) {
                    Ok(q) => q,
                    Err(e) => {
                        log::warn!("no quote for {} this cycle: {}", trigger.stock, e);
                        continue;
                    }
                };
            if quote.price <= 0 || !should_fire(&trigger, quote.price) {
                continue;
            }

            match self.fire(&trigger, quote.price) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => log::error!(
                    "trigger {}:{}:{} failed to fire: {}",
                    trigger.user_id,
                    trigger.stock,
                    trigger.kind.as_str(),
                    e
                ),
            }
        }
        fired
    }

    /// Settle one trigger from its reservation. The trigger is claimed
    /// (removed) first so a concurrent CANCEL_SET cannot double-settle; if
    /// settlement then fails the claim is rolled back.
    fn fire(&self, trigger: &Trigger, price: Money) -> Result<bool, EngineError> {
        let claimed = self.ledger.cancel_trigger(&trigger.key())?;

        let settled = match claimed.kind {
            TradeKind::Buy => {
                let shares = claimed.amount / price;
                if shares <= 0 {
                    // Reservation can't cover one share even at this price;
                    // re-arm and wait for a lower quote.
                    self.ledger.upsert_trigger(claimed.clone())?;
                    return Ok(false);
                }
                let cost = shares * price;
                self.ledger
                    .execute_buy_trigger(&claimed.user_id, &claimed.stock, claimed.amount, shares, cost)
                    .map(|_| ("remove", cost))
            }
            TradeKind::Sell => {
                let proceeds = claimed.shares * price;
                self.ledger
                    .execute_sell_trigger(&claimed.user_id, &claimed.stock, claimed.shares, proceeds)
                    .map(|_| ("add", proceeds))
            }
        };

        match settled {
            Ok((action, amount)) => {
                log::info!(
                    "trigger fired: {} {} {} at {} ({} cents)",
                    claimed.user_id,
                    claimed.kind.as_str(),
                    claimed.stock,
                    price,
                    amount
                );
                self.audit.record(AuditEvent::AccountTransaction {
                    transaction_id: 0,
                    user_id: claimed.user_id.clone(),
                    action: action.to_string(),
                    amount,
                    timestamp_ms: audit_now_ms(),
                });
                Ok(true)
            }
            Err(err) => {
                // Put the claim back so the reservation is not stranded.
                if self.ledger.upsert_trigger(claimed).is_err() {
                    return Err(EngineError::internal(format!(
                        "settlement failed and trigger could not be restored: {}",
                        err
                    )));
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullAudit;
    use crate::lock_manager::LockManager;
    use crate::quotes::FixedQuoteSource;

    fn trigger_man(price: Money) -> (Arc<Ledger>, TriggerMan) {
        let locks = Arc::new(LockManager::new(64, Duration::from_millis(200)));
        let ledger = Arc::new(Ledger::in_memory(locks));
        let man = TriggerMan::new(
            Arc::clone(&ledger),
            Arc::new(FixedQuoteSource::new(price)),
            Arc::new(NullAudit),
            Duration::from_millis(50),
        );
        (ledger, man)
    }

    fn buy_trigger(amount: Money, fire_at: Money) -> Trigger {
        Trigger {
            user_id: "alice".to_string(),
            stock: "ABC".to_string(),
            kind: TradeKind::Buy,
            amount,
            shares: 0,
            fire_at,
        }
    }

    #[test]
    fn test_firing_predicate() {
        let mut t = buy_trigger(5_000, 1_200);
        assert!(should_fire(&t, 1_200));
        assert!(should_fire(&t, 1_100));
        assert!(!should_fire(&t, 1_300));

        t.kind = TradeKind::Sell;
        assert!(should_fire(&t, 1_200));
        assert!(should_fire(&t, 1_300));
        assert!(!should_fire(&t, 1_100));
    }

    #[test]
    fn test_buy_trigger_fires_and_settles() {
        // Quote 1255, armed at 1300: fires. 5000 cents buys 3 shares (3765).
        let (ledger, man) = trigger_man(1_255);
        ledger.add_user_money("alice", 10_000).unwrap();
        ledger.reserve_money("alice", 5_000).unwrap();
        ledger.upsert_trigger(buy_trigger(5_000, 1_300)).unwrap();

        assert_eq!(man.poll_once(), 1);

        let account = ledger.get_user("alice").unwrap();
        assert_eq!(account.reserved, 0);
        assert_eq!(account.balance, 6_235);
        assert_eq!(account.position("ABC").real, 3);
        assert!(ledger.armed_triggers().is_empty());
    }

    #[test]
    fn test_buy_trigger_waits_above_price() {
        let (ledger, man) = trigger_man(1_255);
        ledger.add_user_money("alice", 10_000).unwrap();
        ledger.reserve_money("alice", 5_000).unwrap();
        ledger.upsert_trigger(buy_trigger(5_000, 1_000)).unwrap();

        assert_eq!(man.poll_once(), 0);
        assert_eq!(ledger.armed_triggers().len(), 1);
        assert_eq!(ledger.get_user("alice").unwrap().reserved, 5_000);
    }

    #[test]
    fn test_sell_trigger_fires_at_or_above() {
        let (ledger, man) = trigger_man(1_255);
        ledger.add_user_money("bob", 0).unwrap();
        ledger.commit_buy("bob", "XYZ", 5, 0).unwrap();
        ledger.reserve_shares("bob", "XYZ", 5).unwrap();
        ledger
            .upsert_trigger(Trigger {
                user_id: "bob".to_string(),
                stock: "XYZ".to_string(),
                kind: TradeKind::Sell,
                amount: 0,
                shares: 5,
                fire_at: 1_200,
            })
            .unwrap();

        assert_eq!(man.poll_once(), 1);
        let account = ledger.get_user("bob").unwrap();
        assert_eq!(account.balance, 5 * 1_255);
        assert_eq!(account.position("XYZ").real, 0);
        assert_eq!(account.position("XYZ").reserved, 0);
    }

    #[test]
    fn test_unarmed_trigger_never_evaluated() {
        let (ledger, man) = trigger_man(1_255);
        ledger.add_user_money("alice", 10_000).unwrap();
        ledger.reserve_money("alice", 5_000).unwrap();
        // SET_BUY_AMOUNT happened, SET_BUY_TRIGGER did not.
        ledger.upsert_trigger(buy_trigger(5_000, 0)).unwrap();

        assert_eq!(man.poll_once(), 0);
        assert_eq!(ledger.get_user("alice").unwrap().reserved, 5_000);
    }

    #[test]
    fn test_buy_trigger_rearms_when_amount_buys_nothing() {
        let (ledger, man) = trigger_man(1_255);
        ledger.add_user_money("alice", 1_000).unwrap();
        ledger.reserve_money("alice", 500).unwrap();
        ledger.upsert_trigger(buy_trigger(500, 1_300)).unwrap();

        assert_eq!(man.poll_once(), 0);
        // Still armed, reservation intact.
        assert_eq!(ledger.armed_triggers().len(), 1);
        assert_eq!(ledger.get_user("alice").unwrap().reserved, 500);
    }
}
