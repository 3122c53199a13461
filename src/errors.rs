//! Error taxonomy for the trading engine
//!
//! Handler failures are values, not panics: every error here ends up in a
//! failure `Response` and an audit ErrorEvent, never unwound across the
//! dispatch boundary.

use thiserror::Error;

/// Reasons an engine or ledger operation can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("insufficient shares")]
    InsufficientShares,

    /// The requested amount cannot buy or sell a single share at the
    /// current price.
    #[error("amount too small: {0}")]
    AmountTooSmall(String),

    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),

    /// A stripe lock could not be acquired within the configured wait bound.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// A compensating action itself failed; state may be inconsistent.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        EngineError::InternalError(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(EngineError::InsufficientFunds.to_string(), "insufficient funds");
        assert_eq!(
            EngineError::not_found("no pending BUY").to_string(),
            "not found: no pending BUY"
        );
    }

    #[test]
    fn test_clone_eq() {
        let err = EngineError::LockTimeout;
        assert_eq!(err.clone(), EngineError::LockTimeout);
    }
}
