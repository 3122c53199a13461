//! Quote source collaborator and its caching decorator.
//!
//! The engine only ever talks to `QuoteSource`; whether quotes come from the
//! legacy quote server or a canned price is invisible to handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::account::Money;
use crate::audit::{audit_now_ms, AuditEvent, AuditLog};
use crate::commands::now_ms;
use crate::errors::EngineError;
use crate::lock_manager::{LockManager, ResourceClass};

#[derive(Debug, Clone)]
pub struct QuoteData {
    pub price: Money,
    pub symbol: String,
    pub user_id: String,
    pub timestamp_ms: u64,
    /// Proof-of-quote token handed back by the quote server.
    pub crypto_key: String,
}

pub trait QuoteSource: Send + Sync {
    fn get_quote(&self, symbol: &str, user_id: &str, txn_id: u64)
        -> Result<QuoteData, EngineError>;
}

/// Constant-price source standing in for the legacy quote server.
pub struct FixedQuoteSource {
    price: Money,
}

impl FixedQuoteSource {
    pub fn new(price: Money) -> Self {
        Self { price }
    }
}

impl QuoteSource for FixedQuoteSource {
    fn get_quote(
        &self,
        symbol: &str,
        user_id: &str,
        txn_id: u64,
    ) -> Result<QuoteData, EngineError> {
        if symbol.is_empty() {
            return Err(EngineError::QuoteUnavailable("empty symbol".to_string()));
        }
        Ok(QuoteData {
            price: self.price,
            symbol: symbol.to_string(),
            user_id: user_id.to_string(),
            timestamp_ms: now_ms(),
            crypto_key: format!("QK{}", txn_id),
        })
    }
}

struct CachedQuote {
    data: QuoteData,
    fetched_at: Instant,
}

/// Per-(symbol, user) quote cache with a fixed TTL. Lookups serialize on the
/// Quote stripe for their key, so one upstream fetch serves concurrent
/// requests for the same pair. Upstream hits are audited.
pub struct QuoteCache {
    source: Arc<dyn QuoteSource>,
    locks: Arc<LockManager>,
    audit: Arc<dyn AuditLog>,
    ttl: Duration,
    entries: Mutex<FxHashMap<(String, String), CachedQuote>>,
}

impl QuoteCache {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        locks: Arc<LockManager>,
        audit: Arc<dyn AuditLog>,
        ttl: Duration,
    ) -> Self {
        Self { source, locks, audit, ttl, entries: Mutex::new(FxHashMap::default()) }
    }
}

impl QuoteSource for QuoteCache {
    fn get_quote(
        &self,
        symbol: &str,
        user_id: &str,
        txn_id: u64,
    ) -> Result<QuoteData, EngineError> {
        let key = (symbol.to_string(), user_id.to_string());
        let _stripe = self.locks.lock(ResourceClass::Quote, &key)?;

        if let Some(cached) = self.entries.lock().get(&key) {
            if cached.fetched_at.elapsed() < self.ttl {
                log::debug!("quote cache hit for {}/{}", symbol, user_id);
                return Ok(cached.data.clone());
            }
        }

        let data = self.source.get_quote(symbol, user_id, txn_id)?;
        self.audit.record(AuditEvent::QuoteServer {
            transaction_id: txn_id,
            user_id: user_id.to_string(),
            stock_symbol: symbol.to_string(),
            price: data.price,
            crypto_key: data.crypto_key.clone(),
            timestamp_ms: audit_now_ms(),
        });

        self.entries
            .lock()
            .insert(key, CachedQuote { data: data.clone(), fetched_at: Instant::now() });
        Ok(data)
    }
}
