//! End-to-end flows across the ledger, the provisioning gate and the
//! lifecycle manager.
//!
//! - Provision success and rejection with exact balances
//! - Credit/debit symmetry and purchases
//! - No refund on delete
//! - No partial state when the commit fails, races, or cannot be persisted
//! - Owner isolation across the whole instance surface
//! - Address pool and instance table agree after failed lifecycle writes

use std::sync::Arc;
use std::net::Ipv4Addr;
use vps_proto::{ErrorKind, InstanceStatus, ResourceBalance, ResourceKind};
use vps_provision::ProvisionError;
use vps_store::{AccountStore, FileStore, InstanceStore, MemoryStore};
use vps_tests::{Fault, FaultyStore, Stack, funded_account, spec};

// ─── Test 1: Provision debits exactly the requested allocation ────────────────

#[tokio::test]
async fn test_provision_success_debits_balance() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(4, 8, 40))
        .await
        .expect("account");

    let instance = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.expect("provision");
    assert_eq!(instance.status, InstanceStatus::Creating);
    assert_eq!(instance.owner, alice);
    assert!(instance.network_address.is_none());

    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), ResourceBalance::new(2, 4, 20));
    let owned = stack.lifecycle.list(alice).await.expect("list");
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].name, "web-1");
}

// ─── Test 2: Insufficient balance rejects without mutation ────────────────────

#[tokio::test]
async fn test_provision_insufficient_leaves_state() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(2, 4, 20))
        .await
        .expect("account");

    let err = stack.gate.provision(alice, &spec("big", 4, 1, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    let ProvisionError::InsufficientBalance(shortfall) = err else {
        panic!("expected a shortfall");
    };
    assert_eq!(shortfall.kind, ResourceKind::Cpu);
    assert_eq!(shortfall.requested, 4);
    assert_eq!(shortfall.available, 2);

    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), ResourceBalance::new(2, 4, 20));
    assert!(stack.lifecycle.list(alice).await.expect("list").is_empty());
}

// ─── Test 3: Credit then debit is the identity ────────────────────────────────

#[tokio::test]
async fn test_credit_debit_symmetry() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let start = ResourceBalance::new(1, 2, 30);
    let alice = funded_account(stack.store.as_ref(), "alice", start).await.expect("account");

    for kind in ResourceKind::ALL {
        stack.ledger.credit(alice, kind, 4).await.expect("credit");
        stack.ledger.debit(alice, kind, 4).await.expect("debit");
    }
    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), start);
}

// ─── Test 4: Purchased offers fund a provision ────────────────────────────────

#[tokio::test]
async fn test_purchases_fund_provision() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::ZERO).await.expect("account");

    let err = stack.gate.provision(alice, &spec("web", 1, 1, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);

    for offer in ["cpu-upgrade", "ram-boost", "disk-expansion"] {
        stack.ledger.purchase(alice, offer).await.expect("purchase");
    }
    stack.gate.provision(alice, &spec("web", 2, 4, 50)).await.expect("provision");
    assert!(stack.ledger.balance(alice).await.expect("balance").is_zero());
}

// ─── Test 5: Deleting never refunds ───────────────────────────────────────────

#[tokio::test]
async fn test_delete_does_not_refund() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(4, 8, 40))
        .await
        .expect("account");

    let instance = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.expect("provision");
    stack.lifecycle.start(alice, instance.id).await.expect("start");
    stack.lifecycle.stop(alice, instance.id).await.expect("stop");
    let before = stack.ledger.balance(alice).await.expect("balance");

    stack.lifecycle.delete(alice, instance.id).await.expect("delete");
    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), before);
    assert!(stack.store.instance(instance.id).await.expect("get").is_none());
}

// ─── Test 6: Failed commit leaves no partial state ────────────────────────────

#[tokio::test]
async fn test_failed_commit_is_all_or_nothing() {
    let store = Arc::new(FaultyStore::new(Fault::FailCommit));
    let stack = Stack::new(Arc::clone(&store));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(4, 8, 40)).await.expect("account");

    let err = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), ResourceBalance::new(4, 8, 40));
    assert!(stack.lifecycle.list(alice).await.expect("list").is_empty());

    // The store recovers; the same request now goes through once.
    store.set_fault(Fault::None);
    stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.expect("provision");
    assert_eq!(stack.lifecycle.list(alice).await.expect("list").len(), 1);
}

// ─── Test 7: A writer racing the commit causes a conflict, not an overdraft ───

#[tokio::test]
async fn test_racing_writer_yields_conflict() {
    let external = ResourceBalance::new(1, 1, 1);
    let store = Arc::new(FaultyStore::new(Fault::RaceCommit { external_balance: external }));
    let stack = Stack::new(Arc::clone(&store));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(4, 8, 40)).await.expect("account");

    let err = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), external);
    assert!(stack.lifecycle.list(alice).await.expect("list").is_empty());
}

// ─── Test 8: Persist failure on the file store rolls back ─────────────────────

#[tokio::test]
async fn test_file_store_persist_failure_rolls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileStore::open(dir.path()).expect("open"));
    let stack = Stack::new(Arc::clone(&store));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(4, 8, 40)).await.expect("account");

    // Make the snapshot directory unwritable by replacing it with a file.
    let state_dir = dir.path().join("state");
    std::fs::remove_dir_all(&state_dir).expect("remove state dir");
    std::fs::write(&state_dir, "blocked").expect("block");

    let err = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), ResourceBalance::new(4, 8, 40));
    assert!(stack.lifecycle.list(alice).await.expect("list").is_empty());
}

// ─── Test 9: File store keeps balances and instances across reopen ────────────

#[tokio::test]
async fn test_file_store_reopen_preserves_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, instance_id) = {
        let stack = Stack::new(Arc::new(FileStore::open(dir.path()).expect("open")));
        let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(4, 8, 40))
            .await
            .expect("account");
        let instance = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.expect("provision");
        stack.lifecycle.start(alice, instance.id).await.expect("start");
        (alice, instance.id)
    };

    let stack = Stack::new(Arc::new(FileStore::open(dir.path()).expect("reopen")));
    assert_eq!(stack.ledger.balance(alice).await.expect("balance"), ResourceBalance::new(2, 4, 20));
    let instance = stack.store.instance(instance_id).await.expect("get").expect("present");
    assert_eq!(instance.status, InstanceStatus::Running);
    assert!(instance.network_address.is_some());
}

// ─── Test 10: Instances are invisible to other accounts ───────────────────────

#[tokio::test]
async fn test_owner_isolation() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(4, 8, 40))
        .await
        .expect("account");
    let bob = funded_account(stack.store.as_ref(), "bob", ResourceBalance::new(4, 8, 40)).await.expect("account");

    let instance = stack.gate.provision(alice, &spec("web-1", 2, 4, 20)).await.expect("provision");

    assert!(stack.lifecycle.list(bob).await.expect("list").is_empty());
    for result in [
        stack.lifecycle.start(bob, instance.id).await,
        stack.lifecycle.stop(bob, instance.id).await,
        stack.lifecycle.restart(bob, instance.id).await,
        stack.lifecycle.delete(bob, instance.id).await,
    ] {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }
    assert_eq!(stack.lifecycle.get(alice, instance.id).await.expect("owner sees it").status, InstanceStatus::Creating);
}

// ─── Test 11: Lifecycle walk with no-ops and invalid transitions ──────────────

#[tokio::test]
async fn test_lifecycle_walk() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(8, 16, 100))
        .await
        .expect("account");
    let id = stack.gate.provision(alice, &spec("db-1", 2, 4, 40)).await.expect("provision").id;

    let err = stack.lifecycle.restart(alice, id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    let running = stack.lifecycle.start(alice, id).await.expect("start");
    let address = running.network_address.expect("address on first start");
    assert_eq!(stack.lifecycle.start(alice, id).await.expect("no-op").updated_at, running.updated_at);

    assert_eq!(stack.lifecycle.stop(alice, id).await.expect("stop").status, InstanceStatus::Stopped);
    assert_eq!(stack.lifecycle.stop(alice, id).await.expect("no-op").status, InstanceStatus::Stopped);

    let restarted = stack.lifecycle.restart(alice, id).await.expect("restart");
    assert_eq!(restarted.status, InstanceStatus::Running);
    assert_eq!(restarted.network_address, Some(address));

    let summary = stack.lifecycle.summary(alice).await.expect("summary");
    assert_eq!(summary.instance_count, 1);
    assert_eq!(summary.running, 1);
    assert_eq!(summary.allocated, ResourceBalance::new(2, 4, 40));
    assert_eq!(summary.balance, ResourceBalance::new(6, 12, 60));
}

// ─── Test 12: Balance never goes negative over a mixed sequence ───────────────

#[tokio::test]
async fn test_balance_never_negative_over_mixed_operations() {
    let stack = Stack::new(Arc::new(MemoryStore::new()));
    let alice = funded_account(stack.store.as_ref(), "alice", ResourceBalance::new(3, 6, 30))
        .await
        .expect("account");

    // Deterministic pseudo-random walk.
    let mut seed: u32 = 0x2545_f491;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    let mut expected = ResourceBalance::new(3, 6, 30);
    for step in 0..200 {
        let r = next();
        let kind = ResourceKind::ALL[(r % 3) as usize];
        let amount = (r >> 8) % 5 + 1;
        match (r >> 4) % 3 {
            0 => {
                expected = stack.ledger.credit(alice, kind, amount).await.expect("credit");
            }
            1 => match stack.ledger.debit(alice, kind, amount).await {
                Ok(balance) => expected = balance,
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::InsufficientBalance, "step {step}");
                    assert!(expected.get(kind) < amount, "step {step}");
                }
            },
            _ => {
                let request = spec(&format!("vm-{step}"), amount, 1, amount);
                match stack.gate.provision(alice, &request).await {
                    Ok(_) => {
                        expected = expected.checked_sub(&request.allocation()).expect("covered");
                    }
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::InsufficientBalance, "step {step}");
                        assert!(expected.covers(&request.allocation()).is_err(), "step {step}");
                    }
                }
            }
        }
        assert_eq!(stack.ledger.balance(alice).await.expect("balance"), expected, "step {step}");
    }
}

// ─── Test 13: A failed status write hands the new address back ────────────────

#[tokio::test]
async fn test_failed_status_write_releases_address() {
    let store = Arc::new(FaultyStore::new(Fault::None));
    let stack = Stack::new(Arc::clone(&store));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(4, 8, 40)).await.expect("account");
    let web = stack.gate.provision(alice, &spec("web-1", 1, 2, 10)).await.expect("provision");

    store.set_fault(Fault::FailInstanceWrites);
    let err = stack.lifecycle.start(alice, web.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(stack.orchestrator.pool().in_use(), 0);
    let stored = store.instance(web.id).await.expect("get").expect("present");
    assert_eq!(stored.status, InstanceStatus::Creating);
    assert!(stored.network_address.is_none());

    store.set_fault(Fault::None);
    let running = stack.lifecycle.start(alice, web.id).await.expect("start");
    assert_eq!(running.network_address, Some(Ipv4Addr::new(10, 20, 0, 1)));
    assert_eq!(stack.orchestrator.pool().in_use(), 1);
}

// ─── Test 14: A failed delete keeps the address with the live instance ────────

#[tokio::test]
async fn test_failed_delete_keeps_address_reserved() {
    let store = Arc::new(FaultyStore::new(Fault::None));
    let stack = Stack::new(Arc::clone(&store));
    let alice = funded_account(store.as_ref(), "alice", ResourceBalance::new(4, 8, 40)).await.expect("account");
    let a = stack.gate.provision(alice, &spec("a", 1, 2, 10)).await.expect("provision a");
    let b = stack.gate.provision(alice, &spec("b", 1, 2, 10)).await.expect("provision b");
    let a = stack.lifecycle.start(alice, a.id).await.expect("start a");

    store.set_fault(Fault::FailInstanceWrites);
    let err = stack.lifecycle.delete(alice, a.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(store.instance(a.id).await.expect("get").is_some());
    assert_eq!(stack.orchestrator.pool().in_use(), 1);

    store.set_fault(Fault::None);
    let b = stack.lifecycle.start(alice, b.id).await.expect("start b");
    assert!(a.network_address.is_some());
    assert_ne!(a.network_address, b.network_address);

    stack.lifecycle.delete(alice, a.id).await.expect("delete a");
    assert_eq!(stack.orchestrator.pool().in_use(), 1);
}
