use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam::channel::unbounded;

use tradeserv::audit::{AuditLog, FileAudit};
use tradeserv::configure::load_config;
use tradeserv::engine::triggers::TriggerMan;
use tradeserv::engine::TransactionEngine;
use tradeserv::ledger::persist::{load_tables, SnapshotWriter};
use tradeserv::ledger::Ledger;
use tradeserv::lock_manager::LockManager;
use tradeserv::logger::setup_logger;
use tradeserv::quotes::{FixedQuoteSource, QuoteCache, QuoteSource};
use tradeserv::work_queue::WorkQueue;
use tradeserv::workload::parse_workload;

#[derive(Parser, Debug)]
#[command(name = "tradeserv", about = "Simulated securities-trading backend")]
struct Args {
    /// Replay a workload file through the queue, wait for every result,
    /// then exit. Without it the server runs until killed.
    #[arg(long)]
    workload: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config().context("loading configuration")?;
    setup_logger(&config).map_err(|e| anyhow!("logger setup failed: {}", e))?;

    log::info!(
        "starting tradeserv: {} partitions, {} workers, {} lock stripes",
        config.queue_partitions,
        config.worker_threads,
        config.lock_stripes
    );

    let locks = Arc::new(LockManager::new(
        config.lock_stripes,
        Duration::from_millis(config.lock_timeout_ms),
    ));

    // Restore ledger state and start the snapshot writer.
    let data_dir = PathBuf::from(&config.data_dir);
    let (users, triggers, pending) = load_tables(&data_dir)?;
    let (dirty_tx, dirty_rx) = unbounded();
    let ledger = Arc::new(Ledger::restored(
        Arc::clone(&locks),
        users,
        triggers,
        pending,
        dirty_tx,
        config.snapshot_buckets,
    ));
    let writer = SnapshotWriter::spawn(Arc::clone(&ledger), dirty_rx, data_dir)?;

    let audit: Arc<dyn AuditLog> = Arc::new(FileAudit::open(Path::new(&config.audit_file))?);
    let source: Arc<dyn QuoteSource> = Arc::new(FixedQuoteSource::new(config.quote_price_cents));
    let quotes: Arc<dyn QuoteSource> = Arc::new(QuoteCache::new(
        source,
        Arc::clone(&locks),
        Arc::clone(&audit),
        Duration::from_secs(config.quote_ttl_secs),
    ));

    let engine = Arc::new(TransactionEngine::new(
        Arc::clone(&ledger),
        Arc::clone(&quotes),
        Arc::clone(&audit),
        Duration::from_secs(config.pending_expiry_secs),
    ));

    let queue = WorkQueue::new(
        config.queue_partitions,
        Duration::from_millis(config.transaction_timeout_ms),
        Duration::from_millis(config.sweep_interval_ms),
    );

    // Every partition needs at least one worker or its commands never drain.
    let worker_count = config.worker_threads.max(config.queue_partitions).max(1);
    let mut workers = Vec::new();
    for i in 0..worker_count {
        let q = Arc::clone(&queue);
        let engine = Arc::clone(&engine);
        let partition = i % config.queue_partitions.max(1);
        let worker = thread::Builder::new().name(format!("worker-{}", i)).spawn(move || {
            while let Some(cmd) = q.get(partition) {
                let response = engine.dispatch(&cmd);
                q.mark_complete(partition, &cmd, response);
            }
        })?;
        workers.push(worker);
    }

    let trigger_man = Arc::new(TriggerMan::new(
        Arc::clone(&ledger),
        Arc::clone(&quotes),
        Arc::clone(&audit),
        Duration::from_millis(config.trigger_poll_interval_ms),
    ));
    let trigger_handle = Arc::clone(&trigger_man).spawn();

    // Expired pending transactions are reclaimed lazily on pop; this sweep
    // just keeps abandoned ones from accumulating.
    {
        let ledger = Arc::clone(&ledger);
        let interval = Duration::from_secs(config.pending_expiry_secs.max(1));
        thread::Builder::new().name("pending-sweep".to_string()).spawn(move || loop {
            thread::sleep(interval);
            let reclaimed = ledger.sweep_expired_pending();
            if reclaimed > 0 {
                log::info!("reclaimed {} expired pending transactions", reclaimed);
            }
        })?;
    }

    if let Some(path) = args.workload {
        let file = File::open(&path).with_context(|| format!("opening {:?}", path))?;
        let commands = parse_workload(BufReader::new(file))?;
        let total = commands.len();

        let mut outstanding = Vec::with_capacity(total);
        for cmd in commands {
            let partition = queue.partition_for(&cmd.user_id);
            outstanding.push((partition, cmd.transaction_id));
            queue.put(partition, cmd);
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while !outstanding.is_empty() {
            outstanding.retain(|&(partition, txn_id)| {
                match queue.get_completed(partition, txn_id) {
                    Some(response) => {
                        if response.success {
                            succeeded += 1;
                        } else {
                            failed += 1;
                            log::debug!(
                                "txn {} failed: {}",
                                txn_id,
                                response.message.as_deref().unwrap_or("-")
                            );
                        }
                        false
                    }
                    None => true,
                }
            });
            thread::sleep(Duration::from_millis(50));
        }
        log::info!("workload done: {}/{} succeeded, {} failed", succeeded, total, failed);

        trigger_man.stop();
        queue.shutdown();
        for worker in workers {
            let _ = worker.join();
        }
        let _ = trigger_handle.join();
        writer.stop();
        return Ok(());
    }

    log::info!("tradeserv ready");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
