//! Concurrency tests for the ledger and the provisioning gate.
//!
//! No interleaving of concurrent requests may overspend an account:
//! 1. Two provisions that only fit once: exactly one wins.
//! 2. A fan-out of provisions stops exactly when the balance runs out.
//! 3. Independent ledgers over one store are kept honest by the store CAS.
//! 4. Interleaved credits and debits add up.
//! 5. Identical lifecycle requests in flight together apply once.

use futures_util::future::join_all;
use std::sync::Arc;
use vps_proto::{ErrorKind, ResourceBalance, ResourceKind};
use vps_store::{InstanceStore, MemoryStore};
use vps_proto::InstanceStatus;
use vps_tests::{Fault, FaultyStore, Stack, funded_account, spec};

// ─── Test 1: Two requests, room for one ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_concurrent_provisions_one_winner() {
    for round in 0..20 {
        let stack = Arc::new(Stack::new(Arc::new(MemoryStore::new())));
        let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(2, 4, 20))
            .await
            .expect("account");

        let handles: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|name| {
                let stack = Arc::clone(&stack);
                tokio::spawn(async move { stack.gate.provision(alice, &spec(name, 2, 4, 20)).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => winners += 1,
                Err(e) => assert!(
                    matches!(e.kind(), ErrorKind::InsufficientBalance | ErrorKind::ConcurrencyConflict),
                    "round {round}: unexpected {e}"
                ),
            }
        }
        assert_eq!(winners, 1, "round {round}");
        assert!(stack.ledger.balance(alice).await.expect("balance").is_zero());
        assert_eq!(stack.store.list_by_owner(alice).await.expect("list").len(), 1);
    }
}

// ─── Test 2: Fan-out drains the balance exactly ───────────────────────────────

#[tokio::test]
async fn test_fan_out_provisions_stop_at_balance() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(5, 10, 100))
        .await
        .expect("account");

    let requests: Vec<_> = (0..16).map(|i| spec(&format!("worker-{i}"), 1, 2, 20)).collect();
    let results = join_all(requests.iter().map(|s| stack.gate.provision(alice, s))).await;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 5);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    }
    assert!(stack.ledger.balance(alice).await.expect("balance").is_zero());
    assert_eq!(stack.store.list_by_owner(alice).await.expect("list").len(), 5);
}

// ─── Test 3: Separate ledger instances sharing one store ──────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_ledgers_never_overspend() {
    let store = Arc::new(MemoryStore::new());
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(6, 12, 60))
        .await
        .expect("account");

    // Each stack has its own lock table, so only the store CAS serializes them.
    let stacks: Vec<_> = (0..3).map(|_| Arc::new(Stack::new(Arc::clone(&store)))).collect();
    let handles: Vec<_> = (0..24)
        .map(|i| {
            let stack = Arc::clone(&stacks[i % stacks.len()]);
            tokio::spawn(async move { stack.gate.provision(alice, &spec(&format!("vm-{i}"), 1, 2, 10)).await })
        })
        .collect();

    let mut ok = 0u32;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(
                e.kind(),
                ErrorKind::InsufficientBalance | ErrorKind::ConcurrencyConflict
            )),
        }
    }

    assert!(ok <= 6);
    let balance = stacks[0].ledger.balance(alice).await.expect("balance");
    assert_eq!(balance, ResourceBalance::new(6 - ok, 12 - 2 * ok, 60 - 10 * ok));
    assert_eq!(store.list_by_owner(alice).await.expect("list").len(), ok as usize);
}

// ─── Test 4: Interleaved credits and debits ───────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_credits_and_debits_balance_out() {
    let stack = Arc::new(Stack::new(Arc::new(MemoryStore::new())));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(0, 10, 0))
        .await
        .expect("account");

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let stack = Arc::clone(&stack);
            tokio::spawn(async move {
                if i % 2 == 0 {
                    stack.ledger.credit(alice, ResourceKind::Ram, 1).await.map(|_| true)
                } else {
                    stack.ledger.debit(alice, ResourceKind::Ram, 2).await.map(|_| false)
                }
            })
        })
        .collect();

    let (mut credited, mut debited) = (0u32, 0u32);
    for handle in handles {
        match handle.await.expect("join") {
            Ok(true) => credited += 1,
            Ok(false) => debited += 2,
            Err(e) => assert_eq!(e.kind(), ErrorKind::InsufficientBalance),
        }
    }

    assert_eq!(credited, 20);
    let balance = stack.ledger.balance(alice).await.expect("balance");
    assert_eq!(balance.ram_gb, 10 + credited - debited);
}

// ─── Test 5: Concurrent identical transitions ─────────────────────────────────

#[tokio::test]
async fn test_concurrent_starts_apply_once() {
    // Reads on this store yield, so both starts are in flight at once.
    let store = Arc::new(FaultyStore::new(Fault::None));
    let stack = Stack::new(Arc::clone(&store));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(2, 4, 20)).await.expect("account");
    let web = stack.gate.provision(alice, &spec("web-1", 1, 2, 10)).await.expect("provision");

    let (first, second) = tokio::join!(stack.lifecycle.start(alice, web.id), stack.lifecycle.start(alice, web.id));
    let (first, second) = (first.expect("first start"), second.expect("second start"));
    assert_eq!(first.status, InstanceStatus::Running);
    assert_eq!(second.status, InstanceStatus::Running);
    assert_eq!(first.network_address, second.network_address);
    assert_eq!(first.updated_at, second.updated_at);
    assert_eq!(stack.orchestrator.pool().in_use(), 1);

    stack.lifecycle.delete(alice, web.id).await.expect("delete");
    assert_eq!(stack.orchestrator.pool().in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lifecycle_requests_never_leak_addresses() {
    let store = Arc::new(FaultyStore::new(Fault::None));
    let stack = Arc::new(Stack::new(Arc::clone(&store)));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(4, 8, 40)).await.expect("account");
    let mut ids = Vec::new();
    for name in ["a", "b"] {
        ids.push(stack.gate.provision(alice, &spec(name, 1, 2, 10)).await.expect("provision").id);
    }

    let handles: Vec<_> = (0..24)
        .map(|i| {
            let stack = Arc::clone(&stack);
            let id = ids[i % ids.len()];
            tokio::spawn(async move {
                if i % 3 == 2 {
                    stack.lifecycle.restart(alice, id).await
                } else {
                    stack.lifecycle.start(alice, id).await
                }
            })
        })
        .collect();
    for handle in handles {
        match handle.await.expect("join") {
            Ok(instance) => assert_eq!(instance.status, InstanceStatus::Running),
            // A restart that lands before the first start.
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidTransition),
        }
    }
    assert_eq!(stack.orchestrator.pool().in_use(), 2);

    for id in ids {
        stack.lifecycle.delete(alice, id).await.expect("delete");
    }
    assert_eq!(stack.orchestrator.pool().in_use(), 0);
}
