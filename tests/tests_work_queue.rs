use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tradeserv::audit::NullAudit;
use tradeserv::engine::TransactionEngine;
use tradeserv::ledger::Ledger;
use tradeserv::lock_manager::LockManager;
use tradeserv::quotes::FixedQuoteSource;
use tradeserv::work_queue::WorkQueue;
use tradeserv::workload::parse_workload;
use tradeserv::Response;

fn engine() -> (Arc<Ledger>, Arc<TransactionEngine>) {
    let locks = Arc::new(LockManager::new(128, Duration::from_millis(500)));
    let ledger = Arc::new(Ledger::in_memory(locks));
    let engine = Arc::new(TransactionEngine::new(
        Arc::clone(&ledger),
        Arc::new(FixedQuoteSource::new(1255)),
        Arc::new(NullAudit),
        Duration::from_secs(60),
    ));
    (ledger, engine)
}

/// One worker per partition draining into the engine, the way the server
/// binary wires things up.
fn spawn_workers(
    queue: &Arc<WorkQueue>,
    engine: &Arc<TransactionEngine>,
) -> Vec<thread::JoinHandle<()>> {
    (0..queue.partition_count())
        .map(|partition| {
            let q = Arc::clone(queue);
            let engine = Arc::clone(engine);
            thread::spawn(move || {
                while let Some(cmd) = q.get(partition) {
                    let response = engine.dispatch(&cmd);
                    q.mark_complete(partition, &cmd, response);
                }
            })
        })
        .collect()
}

fn wait_for(queue: &WorkQueue, partition: usize, txn_id: u64) -> Response {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(response) = queue.get_completed(partition, txn_id) {
            return response;
        }
        assert!(Instant::now() < deadline, "txn {} never completed", txn_id);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_workload_runs_end_to_end() {
    let (ledger, engine) = engine();
    let queue = WorkQueue::new(2, Duration::from_secs(10), Duration::from_millis(100));
    let workers = spawn_workers(&queue, &engine);

    let workload = "\
[1] ADD,alice,100.00
[2] QUOTE,alice,ABC
[3] BUY,alice,ABC,100.00
[4] COMMIT_BUY,alice
[5] DUMPLOG,final.log
";
    let commands = parse_workload(workload.as_bytes()).unwrap();
    assert_eq!(commands.len(), 5);

    let mut waiting = Vec::new();
    for cmd in commands {
        let partition = queue.partition_for(&cmd.user_id);
        let ack = queue.put(partition, cmd.clone());
        assert!(ack.success);
        waiting.push((partition, cmd.transaction_id));
    }

    for (partition, txn_id) in waiting {
        let response = wait_for(&queue, partition, txn_id);
        assert!(response.success, "txn {}: {:?}", txn_id, response.message);
    }

    let account = ledger.get_user("alice").unwrap();
    assert_eq!(account.balance, 10_000 - 8_785);
    assert_eq!(account.position("ABC").real, 7);

    queue.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_results_are_consumed_once() {
    let (_ledger, engine) = engine();
    let queue = WorkQueue::new(1, Duration::from_secs(10), Duration::from_millis(100));
    let workers = spawn_workers(&queue, &engine);

    let cmd = parse_workload("[1] ADD,bob,5.00".as_bytes()).unwrap().remove(0);
    let partition = queue.partition_for("bob");
    queue.put(partition, cmd);

    let first = wait_for(&queue, partition, 1);
    assert!(first.success);
    assert!(queue.get_completed(partition, 1).is_none());

    queue.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_users_keep_intra_user_order_across_partitions() {
    let (ledger, engine) = engine();
    let queue = WorkQueue::new(4, Duration::from_secs(10), Duration::from_millis(100));
    let workers = spawn_workers(&queue, &engine);

    // Interleave two users; each user's ADD→BUY→COMMIT must still work
    // because a user's commands serialize through one partition.
    let workload = "\
[1] ADD,alice,100.00
[2] ADD,bob,100.00
[3] BUY,alice,ABC,100.00
[4] BUY,bob,ABC,100.00
[5] COMMIT_BUY,alice
[6] COMMIT_BUY,bob
";
    let commands = parse_workload(workload.as_bytes()).unwrap();
    let mut waiting = Vec::new();
    for cmd in commands {
        let partition = queue.partition_for(&cmd.user_id);
        waiting.push((partition, cmd.transaction_id));
        queue.put(partition, cmd);
    }
    for (partition, txn_id) in waiting {
        let response = wait_for(&queue, partition, txn_id);
        assert!(response.success, "txn {}: {:?}", txn_id, response.message);
    }

    for user in ["alice", "bob"] {
        let account = ledger.get_user(user).unwrap();
        assert_eq!(account.position("ABC").real, 7);
        assert_eq!(account.balance, 1_215);
    }

    queue.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_abandoned_checkout_is_redelivered_to_a_worker() {
    let (ledger, engine) = engine();
    // Short timeout so the sweep redelivers quickly.
    let queue = WorkQueue::new(1, Duration::from_millis(150), Duration::from_millis(30));

    let cmd = parse_workload("[1] ADD,carol,42.00".as_bytes()).unwrap().remove(0);
    queue.put(0, cmd);

    // First checkout is abandoned: no mark_complete.
    let abandoned = queue.get(0).unwrap();
    assert_eq!(abandoned.transaction_id, 1);

    // A (late-starting) worker picks up the redelivery and completes it.
    let workers = spawn_workers(&queue, &engine);
    let response = wait_for(&queue, 0, 1);
    assert!(response.success);
    assert_eq!(ledger.get_user("carol").unwrap().balance, 4_200);

    queue.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
}
