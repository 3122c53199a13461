//! Background snapshot persistence.
//!
//! Each table splits into fixed hash buckets; mutations enqueue a
//! `(table, bucket)` marker and one writer thread rewrites the bucket's
//! backing file wholesale from the live in-memory contents. Last write wins;
//! durability is eventual. Files are written to a `.tmp` sibling and renamed
//! into place so a crash mid-write never leaves a torn snapshot.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::account::Account;
use crate::ledger::{Ledger, PendingKey, PendingTransaction, Trigger, TriggerKey};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Triggers,
    Pending,
}

impl Table {
    fn prefix(self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Triggers => "triggers",
            Table::Pending => "pending",
        }
    }

    fn file_name(self, bucket: usize) -> String {
        format!("{}_{:02}.snap", self.prefix(), bucket)
    }
}

/// Marker for one dirtied bucket, queued for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirtyBucket {
    pub table: Table,
    pub bucket: usize,
}

/// Load every bucket file under `dir` into the three table maps. Missing
/// files are fine; this is how a fresh data directory starts.
#[allow(clippy::type_complexity)]
pub fn load_tables(
    dir: &Path,
) -> Result<(
    FxHashMap<String, Account>,
    FxHashMap<TriggerKey, Trigger>,
    FxHashMap<PendingKey, Vec<PendingTransaction>>,
)> {
    fs::create_dir_all(dir)?;

    let mut users = FxHashMap::default();
    let mut triggers = FxHashMap::default();
    let mut pending = FxHashMap::default();

    let mut loaded = 0usize;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("snap") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let file = File::open(&path).with_context(|| format!("open {:?}", path))?;
        let reader = BufReader::new(file);
        if name.starts_with("users_") {
            let bucket: FxHashMap<String, Account> = bincode::deserialize_from(reader)
                .with_context(|| format!("decode {:?}", path))?;
            users.extend(bucket);
        } else if name.starts_with("triggers_") {
            let bucket: FxHashMap<TriggerKey, Trigger> = bincode::deserialize_from(reader)
                .with_context(|| format!("decode {:?}", path))?;
            triggers.extend(bucket);
        } else if name.starts_with("pending_") {
            let bucket: FxHashMap<PendingKey, Vec<PendingTransaction>> =
                bincode::deserialize_from(reader).with_context(|| format!("decode {:?}", path))?;
            pending.extend(bucket);
        } else {
            continue;
        }
        loaded += 1;
    }

    if loaded > 0 {
        log::info!(
            "restored {} bucket files: {} users, {} triggers, {} pending lists",
            loaded,
            users.len(),
            triggers.len(),
            pending.len()
        );
    }
    Ok((users, triggers, pending))
}

/// Rewrite one bucket's file from the ledger's current in-memory contents.
fn write_bucket(ledger: &Ledger, dir: &Path, marker: DirtyBucket) -> Result<()> {
    let final_path = dir.join(marker.table.file_name(marker.bucket));
    let tmp_path = final_path.with_extension("tmp");

    {
        let file = File::create(&tmp_path).with_context(|| format!("create {:?}", tmp_path))?;
        let mut writer = BufWriter::new(file);
        match marker.table {
            Table::Users => {
                bincode::serialize_into(&mut writer, &ledger.users_bucket(marker.bucket))?
            }
            Table::Triggers => {
                bincode::serialize_into(&mut writer, &ledger.triggers_bucket(marker.bucket))?
            }
            Table::Pending => {
                bincode::serialize_into(&mut writer, &ledger.pending_bucket(marker.bucket))?
            }
        }
    }

    fs::rename(&tmp_path, &final_path).with_context(|| format!("rename {:?}", final_path))?;
    log::debug!("snapshot {} rewritten", marker.table.file_name(marker.bucket));
    Ok(())
}

/// Owns the background writer thread draining the dirty-bucket channel.
pub struct SnapshotWriter {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl SnapshotWriter {
    pub fn spawn(ledger: Arc<Ledger>, rx: Receiver<DirtyBucket>, dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("snapshot-writer".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(DRAIN_POLL_INTERVAL) {
                    Ok(first) => {
                        // Coalesce whatever else queued up: one bucket may
                        // have been dirtied many times over.
                        let mut batch = FxHashSet::default();
                        batch.insert(first);
                        while let Ok(more) = rx.try_recv() {
                            batch.insert(more);
                        }
                        for marker in batch {
                            if let Err(e) = write_bucket(&ledger, &dir, marker) {
                                log::error!("snapshot write failed: {:#}", e);
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if stop_flag.load(Ordering::Relaxed) {
                            // Final drain before exit.
                            let mut batch = FxHashSet::default();
                            while let Ok(more) = rx.try_recv() {
                                batch.insert(more);
                            }
                            for marker in batch {
                                if let Err(e) = write_bucket(&ledger, &dir, marker) {
                                    log::error!("snapshot write failed: {:#}", e);
                                }
                            }
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self { handle: Some(handle), stop })
    }

    /// Flush queued markers and join the writer.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
