//! Audit event sink.
//!
//! Handlers report account transactions, user commands and errors here as
//! fire-and-forget notifications. The file-backed sink hands events to a
//! dedicated writer thread over a channel, so a slow disk never blocks a
//! handler.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use serde::Serialize;

use crate::account::Money;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    UserCommand {
        transaction_id: u64,
        command: String,
        user_id: String,
        stock_symbol: String,
        amount: Money,
        timestamp_ms: i64,
    },
    AccountTransaction {
        transaction_id: u64,
        user_id: String,
        /// "add", "remove", "reserve" or "unreserve".
        action: String,
        amount: Money,
        timestamp_ms: i64,
    },
    QuoteServer {
        transaction_id: u64,
        user_id: String,
        stock_symbol: String,
        price: Money,
        crypto_key: String,
        timestamp_ms: i64,
    },
    ErrorEvent {
        transaction_id: u64,
        command: String,
        user_id: String,
        error: String,
        timestamp_ms: i64,
    },
    DumpLog {
        file_name: String,
        timestamp_ms: i64,
    },
}

pub fn audit_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fire-and-forget audit collaborator. Implementations must never block the
/// calling handler on sink failure.
pub trait AuditLog: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Sink that drops everything. Used in tests and when auditing is disabled.
pub struct NullAudit;

impl AuditLog for NullAudit {
    fn record(&self, _event: AuditEvent) {}
}

/// JSON-lines audit trail appended by a background writer thread.
pub struct FileAudit {
    tx: Sender<AuditEvent>,
}

impl FileAudit {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let (tx, rx) = unbounded::<AuditEvent>();
        thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || {
                for event in rx {
                    match serde_json::to_string(&event) {
                        Ok(line) => {
                            if writeln!(writer, "{}", line).and_then(|_| writer.flush()).is_err() {
                                log::error!("audit write failed, event dropped");
                            }
                        }
                        Err(e) => log::error!("audit event not serializable: {}", e),
                    }
                }
            })?;

        Ok(Self { tx })
    }
}

impl AuditLog for FileAudit {
    fn record(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            log::warn!("audit writer gone, event dropped");
        }
    }
}
