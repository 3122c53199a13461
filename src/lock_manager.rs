//! Striped lock manager.
//!
//! A fixed-size array of mutexes per resource class, selected by hashing the
//! key. Distinct keys can land on the same stripe; that false contention is
//! the accepted cost of bounded memory. Acquisition waits are bounded and
//! independent of the work queue's transaction timeout.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::errors::EngineError;
use crate::stripes::key_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    User,
    Quote,
    Transaction,
    Trigger,
}

/// Holds one stripe. Releasing is dropping the guard; `handle()` exposes the
/// key hash for diagnostic correlation in logs.
pub struct StripeGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    handle: u64,
}

impl StripeGuard<'_> {
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

pub struct LockManager {
    users: Vec<Mutex<()>>,
    quotes: Vec<Mutex<()>>,
    transactions: Vec<Mutex<()>>,
    triggers: Vec<Mutex<()>>,
    wait_bound: Duration,
}

impl LockManager {
    pub fn new(stripes_per_class: usize, wait_bound: Duration) -> Self {
        let stripes = stripes_per_class.max(1);
        let table = |n: usize| (0..n).map(|_| Mutex::new(())).collect::<Vec<_>>();
        Self {
            users: table(stripes),
            quotes: table(stripes),
            transactions: table(stripes),
            triggers: table(stripes),
            wait_bound,
        }
    }

    fn table(&self, class: ResourceClass) -> &[Mutex<()>] {
        match class {
            ResourceClass::User => &self.users,
            ResourceClass::Quote => &self.quotes,
            ResourceClass::Transaction => &self.transactions,
            ResourceClass::Trigger => &self.triggers,
        }
    }

    /// Acquire the stripe for `key` within the wait bound.
    pub fn lock<K: std::hash::Hash + ?Sized>(
        &self,
        class: ResourceClass,
        key: &K,
    ) -> Result<StripeGuard<'_>, EngineError> {
        let table = self.table(class);
        let handle = key_hash(key);
        let stripe = (handle % table.len() as u64) as usize;

        match table[stripe].try_lock_for(self.wait_bound) {
            Some(guard) => Ok(StripeGuard { _guard: guard, handle }),
            None => {
                log::warn!("stripe {}/{:?} not acquired within {:?}", stripe, class, self.wait_bound);
                Err(EngineError::LockTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_and_release_by_drop() {
        let locks = LockManager::new(16, Duration::from_millis(50));
        {
            let guard = locks.lock(ResourceClass::User, "alice").unwrap();
            assert_eq!(guard.handle(), key_hash("alice"));
        }
        // Released on drop, can take it again.
        locks.lock(ResourceClass::User, "alice").unwrap();
    }

    #[test]
    fn test_contended_stripe_times_out() {
        let locks = Arc::new(LockManager::new(16, Duration::from_millis(20)));
        let held = locks.lock(ResourceClass::User, "alice").unwrap();

        let locks2 = Arc::clone(&locks);
        let res = thread::spawn(move || locks2.lock(ResourceClass::User, "alice").map(|_| ()))
            .join()
            .unwrap();
        assert_eq!(res, Err(EngineError::LockTimeout));
        drop(held);
    }

    #[test]
    fn test_classes_do_not_contend() {
        let locks = LockManager::new(16, Duration::from_millis(20));
        let _user = locks.lock(ResourceClass::User, "alice").unwrap();
        // Same key in another class maps to a different table.
        let _trigger = locks.lock(ResourceClass::Trigger, "alice").unwrap();
        let _txn = locks.lock(ResourceClass::Transaction, "alice").unwrap();
        let _quote = locks.lock(ResourceClass::Quote, "alice").unwrap();
    }
}
