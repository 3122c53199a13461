pub mod account;
pub mod audit;
pub mod commands;
pub mod configure;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod lock_manager;
pub mod logger;
pub mod quotes;
pub mod stripes;
pub mod work_queue;
pub mod workload;

// Re-exports
pub use account::{Account, Money, Position, Shares};
pub use commands::{Command, CommandType, Response};
pub use engine::triggers::TriggerMan;
pub use engine::TransactionEngine;
pub use errors::EngineError;
pub use ledger::{Ledger, PendingTransaction, TradeKind, Trigger, TriggerKey};
pub use lock_manager::{LockManager, ResourceClass};
pub use quotes::{FixedQuoteSource, QuoteCache, QuoteSource};
pub use work_queue::WorkQueue;
