//! Partitioned work-distribution queue.
//!
//! Commands route to `hash(user_id) mod partition_count`, so one user's
//! commands land in one FIFO. Workers check items out; a per-partition sweep
//! re-enqueues anything held past the transaction timeout, making delivery
//! at-least-once. Results are stored one-shot and consumed by polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::commands::{Command, Response};
use crate::stripes::slot_for;

const GET_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct InFlight {
    cmd: Command,
    checked_out: Instant,
}

struct Partition {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    in_flight: Mutex<FxHashMap<u64, InFlight>>,
    completed: Mutex<FxHashMap<u64, Response>>,
}

impl Partition {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            in_flight: Mutex::new(FxHashMap::default()),
            completed: Mutex::new(FxHashMap::default()),
        }
    }
}

pub struct WorkQueue {
    partitions: Vec<Partition>,
    txn_timeout: Duration,
    shutdown: AtomicBool,
}

impl WorkQueue {
    /// Build the queue and start one resubmission sweeper per partition.
    pub fn new(partition_count: usize, txn_timeout: Duration, sweep_interval: Duration) -> Arc<Self> {
        let queue = Arc::new(Self {
            partitions: (0..partition_count.max(1)).map(|_| Partition::new()).collect(),
            txn_timeout,
            shutdown: AtomicBool::new(false),
        });

        for partition in 0..queue.partitions.len() {
            let q = Arc::clone(&queue);
            thread::Builder::new()
                .name(format!("queue-sweep-{}", partition))
                .spawn(move || {
                    while !q.shutdown.load(Ordering::Relaxed) {
                        thread::sleep(sweep_interval);
                        q.resubmit_stale(partition);
                    }
                })
                .expect("failed to spawn sweeper thread");
        }

        queue
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition all of one user's commands serialize through.
    pub fn partition_for(&self, user_id: &str) -> usize {
        slot_for(user_id, self.partitions.len())
    }

    /// Enqueue at the tail and acknowledge immediately.
    pub fn put(&self, partition: usize, cmd: Command) -> Response {
        let txn_id = cmd.transaction_id;
        let p = &self.partitions[partition % self.partitions.len()];
        if p.tx.send(cmd).is_err() {
            return Response::failure("queue is shut down");
        }
        Response { message: Some(format!("{} in progress", txn_id)), ..Response::ok() }
    }

    /// Block until an item is available; record its checkout. Returns `None`
    /// once the queue is shut down and the partition has drained.
    pub fn get(&self, partition: usize) -> Option<Command> {
        let p = &self.partitions[partition % self.partitions.len()];
        loop {
            match p.rx.recv_timeout(GET_POLL_INTERVAL) {
                Ok(cmd) => {
                    p.in_flight.lock().insert(
                        cmd.transaction_id,
                        InFlight { cmd: cmd.clone(), checked_out: Instant::now() },
                    );
                    return Some(cmd);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Clear the checkout and store the result. Idempotent: a second call for
    /// the same transaction id keeps the first stored result.
    pub fn mark_complete(&self, partition: usize, cmd: &Command, response: Response) {
        let p = &self.partitions[partition % self.partitions.len()];
        p.in_flight.lock().remove(&cmd.transaction_id);
        p.completed.lock().entry(cmd.transaction_id).or_insert(response);
    }

    /// Consume-once result lookup.
    pub fn get_completed(&self, partition: usize, txn_id: u64) -> Option<Response> {
        let p = &self.partitions[partition % self.partitions.len()];
        p.completed.lock().remove(&txn_id)
    }

    /// Stop sweepers and unblock `get` callers once their partition drains.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Re-enqueue every in-flight item held past the transaction timeout.
    fn resubmit_stale(&self, partition: usize) {
        let p = &self.partitions[partition % self.partitions.len()];

        let stale: Vec<Command> = {
            let mut in_flight = p.in_flight.lock();
            let expired: Vec<u64> = in_flight
                .iter()
                .filter(|(_, item)| item.checked_out.elapsed() >= self.txn_timeout)
                .map(|(&id, _)| id)
                .collect();
            expired.into_iter().filter_map(|id| in_flight.remove(&id)).map(|i| i.cmd).collect()
        };

        for cmd in stale {
            log::warn!(
                "txn {} timed out after {:?}, resubmitting to partition {}",
                cmd.transaction_id,
                self.txn_timeout,
                partition
            );
            let _ = p.tx.send(cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandType;

    fn cmd(txn_id: u64, user: &str) -> Command {
        Command::new(txn_id, CommandType::Add, user).with_amount(100)
    }

    #[test]
    fn test_put_get_complete_round_trip() {
        let q = WorkQueue::new(2, Duration::from_secs(10), Duration::from_millis(50));
        let p = q.partition_for("alice");

        let ack = q.put(p, cmd(1, "alice"));
        assert!(ack.success);

        let got = q.get(p).unwrap();
        assert_eq!(got.transaction_id, 1);

        q.mark_complete(p, &got, Response::ok());
        let result = q.get_completed(p, 1).unwrap();
        assert!(result.success);

        // Consume-once: second poll finds nothing.
        assert!(q.get_completed(p, 1).is_none());
        q.shutdown();
    }

    #[test]
    fn test_same_user_routes_to_same_partition() {
        let q = WorkQueue::new(4, Duration::from_secs(10), Duration::from_millis(50));
        assert_eq!(q.partition_for("alice"), q.partition_for("alice"));
        assert!(q.partition_for("alice") < q.partition_count());
        q.shutdown();
    }

    #[test]
    fn test_mark_complete_is_idempotent() {
        let q = WorkQueue::new(1, Duration::from_secs(10), Duration::from_millis(50));
        let c = cmd(9, "alice");
        q.put(0, c.clone());
        let got = q.get(0).unwrap();

        q.mark_complete(0, &got, Response::failure("first"));
        q.mark_complete(0, &got, Response::ok());

        let stored = q.get_completed(0, 9).unwrap();
        assert!(!stored.success);
        assert_eq!(stored.message.as_deref(), Some("first"));
        q.shutdown();
    }

    #[test]
    fn test_stale_checkout_is_redelivered() {
        let q = WorkQueue::new(1, Duration::from_millis(100), Duration::from_millis(20));
        q.put(0, cmd(5, "alice"));

        let first = q.get(0).unwrap();
        assert_eq!(first.transaction_id, 5);
        // Never completed; the sweeper must bring it back.
        let second = q.get(0).unwrap();
        assert_eq!(second.transaction_id, 5);

        q.mark_complete(0, &second, Response::ok());
        assert!(q.get_completed(0, 5).is_some());
        q.shutdown();
    }

    #[test]
    fn test_completed_item_is_not_redelivered() {
        let q = WorkQueue::new(1, Duration::from_millis(60), Duration::from_millis(20));
        q.put(0, cmd(3, "bob"));
        let got = q.get(0).unwrap();
        q.mark_complete(0, &got, Response::ok());

        thread::sleep(Duration::from_millis(200));
        q.shutdown();
        // Partition drained: nothing came back.
        assert!(q.get(0).is_none());
    }
}
