//! Partitioned in-memory ledger.
//!
//! Three tables: Users, Triggers, PendingTransactions. Every mutator takes
//! the stripe lock for its key's resource class, does the read-modify-write
//! in memory, then enqueues a dirty-bucket marker for the background
//! snapshot writer. There is no transactional database underneath; the
//! reservation arithmetic in `Account` is what conserves money and shares.

pub mod persist;

use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::account::{Account, Money, Shares};
use crate::commands::now_ms;
use crate::errors::EngineError;
use crate::lock_manager::{LockManager, ResourceClass};
use crate::stripes::slot_for;

use self::persist::{DirtyBucket, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeKind {
    Buy,
    Sell,
}

impl TradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeKind::Buy => "BUY",
            TradeKind::Sell => "SELL",
        }
    }
}

/// Composite key for the Triggers table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    pub user_id: String,
    pub stock: String,
    pub kind: TradeKind,
}

/// Composite key for the PendingTransactions table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingKey {
    pub user_id: String,
    pub kind: TradeKind,
}

/// A quoted-but-uncommitted buy or sell, waiting for COMMIT/CANCEL.
/// `price` is the total cost (Buy) or proceeds (Sell) in cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub user_id: String,
    pub kind: TradeKind,
    pub stock: String,
    pub shares: Shares,
    pub price: Money,
    pub expiry_ms: u64,
}

impl PendingTransaction {
    pub fn key(&self) -> PendingKey {
        PendingKey { user_id: self.user_id.clone(), kind: self.kind }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiry_ms
    }
}

/// A standing conditional order. `amount` is the reserved money for Buy
/// triggers, `shares` the reserved shares for Sell triggers. `fire_at == 0`
/// means SET_*_AMOUNT ran but the firing price is not armed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub user_id: String,
    pub stock: String,
    pub kind: TradeKind,
    pub amount: Money,
    pub shares: Shares,
    pub fire_at: Money,
}

impl Trigger {
    pub fn key(&self) -> TriggerKey {
        TriggerKey { user_id: self.user_id.clone(), stock: self.stock.clone(), kind: self.kind }
    }

    pub fn is_armed(&self) -> bool {
        self.fire_at > 0
    }
}

pub struct Ledger {
    users: RwLock<FxHashMap<String, Account>>,
    triggers: RwLock<FxHashMap<TriggerKey, Trigger>>,
    pending: RwLock<FxHashMap<PendingKey, Vec<PendingTransaction>>>,
    locks: Arc<LockManager>,
    dirty: Option<Sender<DirtyBucket>>,
    bucket_count: usize,
}

impl Ledger {
    /// Ledger without persistence. State dies with the process.
    pub fn in_memory(locks: Arc<LockManager>) -> Self {
        Self {
            users: RwLock::new(FxHashMap::default()),
            triggers: RwLock::new(FxHashMap::default()),
            pending: RwLock::new(FxHashMap::default()),
            locks,
            dirty: None,
            bucket_count: 1,
        }
    }

    /// Ledger over previously loaded tables, emitting dirty-bucket markers
    /// to `dirty` for the snapshot writer.
    pub fn restored(
        locks: Arc<LockManager>,
        users: FxHashMap<String, Account>,
        triggers: FxHashMap<TriggerKey, Trigger>,
        pending: FxHashMap<PendingKey, Vec<PendingTransaction>>,
        dirty: Sender<DirtyBucket>,
        bucket_count: usize,
    ) -> Self {
        Self {
            users: RwLock::new(users),
            triggers: RwLock::new(triggers),
            pending: RwLock::new(pending),
            locks,
            dirty: Some(dirty),
            bucket_count: bucket_count.max(1),
        }
    }

    fn mark_dirty<K: std::hash::Hash>(&self, table: Table, key: &K) {
        if let Some(tx) = &self.dirty {
            let bucket = slot_for(key, self.bucket_count);
            let _ = tx.send(DirtyBucket { table, bucket });
        }
    }

    // ---- Users ----

    /// Create the account if absent and add to its balance.
    pub fn add_user_money(&self, user_id: &str, amount: Money) -> Result<Account, EngineError> {
        let _stripe = self.locks.lock(ResourceClass::User, user_id)?;
        let mut users = self.users.write();
        let account = users.entry(user_id.to_string()).or_insert_with(|| Account::new(user_id));
        account.deposit(amount);
        let snapshot = account.clone();
        drop(users);

        self.mark_dirty(Table::Users, &user_id);
        Ok(snapshot)
    }

    /// Snapshot read under the user stripe.
    pub fn get_user(&self, user_id: &str) -> Result<Account, EngineError> {
        let _stripe = self.locks.lock(ResourceClass::User, user_id)?;
        self.users
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("user {}", user_id)))
    }

    pub fn get_reserved_shares(&self, user_id: &str, stock: &str) -> Result<Shares, EngineError> {
        let _stripe = self.locks.lock(ResourceClass::User, user_id)?;
        let users = self.users.read();
        let account = users
            .get(user_id)
            .ok_or_else(|| EngineError::not_found(format!("user {}", user_id)))?;
        Ok(account.position(stock).reserved)
    }

    /// Run `op` against the account under its stripe and mark the bucket
    /// dirty if it succeeds. All money/share mutators funnel through here.
    fn with_account<T>(
        &self,
        user_id: &str,
        op: impl FnOnce(&mut Account) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let _stripe = self.locks.lock(ResourceClass::User, user_id)?;
        let mut users = self.users.write();
        let account = users
            .get_mut(user_id)
            .ok_or_else(|| EngineError::not_found(format!("user {}", user_id)))?;
        let out = op(account)?;
        drop(users);

        self.mark_dirty(Table::Users, &user_id);
        Ok(out)
    }

    pub fn reserve_money(&self, user_id: &str, amount: Money) -> Result<(), EngineError> {
        self.with_account(user_id, |a| a.reserve(amount))
    }

    pub fn unreserve_money(&self, user_id: &str, amount: Money) -> Result<(), EngineError> {
        self.with_account(user_id, |a| a.unreserve(amount))
    }

    pub fn reserve_shares(
        &self,
        user_id: &str,
        stock: &str,
        shares: Shares,
    ) -> Result<(), EngineError> {
        self.with_account(user_id, |a| a.reserve_shares(stock, shares))
    }

    pub fn unreserve_shares(
        &self,
        user_id: &str,
        stock: &str,
        shares: Shares,
    ) -> Result<(), EngineError> {
        self.with_account(user_id, |a| a.unreserve_shares(stock, shares))
    }

    /// Settle a committed buy: the cost leaves the spendable balance, the
    /// shares land in the sellable pool. Fails if the balance moved
    /// underneath since the BUY was quoted.
    pub fn commit_buy(
        &self,
        user_id: &str,
        stock: &str,
        shares: Shares,
        cost: Money,
    ) -> Result<(), EngineError> {
        self.with_account(user_id, |a| {
            a.withdraw(cost)?;
            a.credit_shares(stock, shares);
            Ok(())
        })
    }

    /// Settle a committed sell: shares leave the sellable pool, proceeds are
    /// credited. Fails if the user is now short.
    pub fn commit_sell(
        &self,
        user_id: &str,
        stock: &str,
        shares: Shares,
        proceeds: Money,
    ) -> Result<(), EngineError> {
        self.with_account(user_id, |a| {
            a.debit_shares(stock, shares)?;
            a.deposit(proceeds);
            Ok(())
        })
    }

    /// Fire a buy trigger from its reservation: the full reserved amount is
    /// released, the actual cost is spent, the remainder returns to the
    /// spendable balance.
    pub fn execute_buy_trigger(
        &self,
        user_id: &str,
        stock: &str,
        reserved_amount: Money,
        shares: Shares,
        cost: Money,
    ) -> Result<(), EngineError> {
        self.with_account(user_id, |a| {
            a.unreserve(reserved_amount)?;
            a.withdraw(cost)?;
            a.credit_shares(stock, shares);
            Ok(())
        })
    }

    /// Fire a sell trigger from its share reservation.
    pub fn execute_sell_trigger(
        &self,
        user_id: &str,
        stock: &str,
        shares: Shares,
        proceeds: Money,
    ) -> Result<(), EngineError> {
        self.with_account(user_id, |a| {
            a.unreserve_shares(stock, shares)?;
            a.debit_shares(stock, shares)?;
            a.deposit(proceeds);
            Ok(())
        })
    }

    // ---- PendingTransactions ----

    pub fn push_pending(&self, pending: PendingTransaction) -> Result<(), EngineError> {
        let key = pending.key();
        let _stripe = self.locks.lock(ResourceClass::Transaction, &key)?;
        self.pending.write().entry(key.clone()).or_default().push(pending);
        self.mark_dirty(Table::Pending, &key);
        Ok(())
    }

    /// Pop the most recent live pending transaction for (user, kind).
    /// Expired entries found on the way are discarded.
    pub fn pop_pending(
        &self,
        user_id: &str,
        kind: TradeKind,
    ) -> Result<PendingTransaction, EngineError> {
        let key = PendingKey { user_id: user_id.to_string(), kind };
        let _stripe = self.locks.lock(ResourceClass::Transaction, &key)?;

        let mut pending = self.pending.write();
        let list = pending
            .get_mut(&key)
            .ok_or_else(|| EngineError::not_found(format!("no pending {}", kind.as_str())))?;

        let now = now_ms();
        let mut popped = None;
        while let Some(txn) = list.pop() {
            if txn.is_expired(now) {
                log::debug!("discarding expired pending {} for {}", kind.as_str(), user_id);
                continue;
            }
            popped = Some(txn);
            break;
        }
        drop(pending);

        self.mark_dirty(Table::Pending, &key);
        popped.ok_or_else(|| EngineError::not_found(format!("no pending {}", kind.as_str())))
    }

    /// Drop every expired pending transaction. Called by the background
    /// sweep; popping already skips expired entries, this just reclaims them.
    pub fn sweep_expired_pending(&self) -> usize {
        let now = now_ms();
        let keys: Vec<PendingKey> = self.pending.read().keys().cloned().collect();

        let mut reclaimed = 0;
        for key in keys {
            let Ok(_stripe) = self.locks.lock(ResourceClass::Transaction, &key) else {
                continue;
            };
            let removed = {
                let mut pending = self.pending.write();
                match pending.get_mut(&key) {
                    Some(list) => {
                        let before = list.len();
                        list.retain(|txn| !txn.is_expired(now));
                        before - list.len()
                    }
                    None => 0,
                }
            };
            if removed > 0 {
                reclaimed += removed;
                self.mark_dirty(Table::Pending, &key);
            }
        }
        reclaimed
    }

    // ---- Triggers ----

    /// Insert or overwrite the trigger for its (user, stock, kind) key.
    pub fn upsert_trigger(&self, trigger: Trigger) -> Result<(), EngineError> {
        let key = trigger.key();
        let _stripe = self.locks.lock(ResourceClass::Trigger, &key)?;
        self.triggers.write().insert(key.clone(), trigger);
        self.mark_dirty(Table::Triggers, &key);
        Ok(())
    }

    /// Remove and return the trigger; `NotFound` if absent.
    pub fn cancel_trigger(&self, key: &TriggerKey) -> Result<Trigger, EngineError> {
        let _stripe = self.locks.lock(ResourceClass::Trigger, key)?;
        let removed = self
            .triggers
            .write()
            .remove(key)
            .ok_or_else(|| EngineError::not_found(format!("{} trigger", key.kind.as_str())))?;
        self.mark_dirty(Table::Triggers, key);
        Ok(removed)
    }

    pub fn get_trigger(&self, key: &TriggerKey) -> Result<Trigger, EngineError> {
        let _stripe = self.locks.lock(ResourceClass::Trigger, key)?;
        self.triggers
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("{} trigger", key.kind.as_str())))
    }

    /// Snapshot of every trigger whose firing price is armed, for the poller.
    pub fn armed_triggers(&self) -> Vec<Trigger> {
        self.triggers.read().values().filter(|t| t.is_armed()).cloned().collect()
    }

    // ---- Bucket access for the snapshot writer ----

    pub(crate) fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub(crate) fn users_bucket(&self, bucket: usize) -> FxHashMap<String, Account> {
        self.users
            .read()
            .iter()
            .filter(|(k, _)| slot_for(k.as_str(), self.bucket_count) == bucket)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn triggers_bucket(&self, bucket: usize) -> FxHashMap<TriggerKey, Trigger> {
        self.triggers
            .read()
            .iter()
            .filter(|(k, _)| slot_for(*k, self.bucket_count) == bucket)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn pending_bucket(
        &self,
        bucket: usize,
    ) -> FxHashMap<PendingKey, Vec<PendingTransaction>> {
        self.pending
            .read()
            .iter()
            .filter(|(k, _)| slot_for(*k, self.bucket_count) == bucket)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
