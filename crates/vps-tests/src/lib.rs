//! Shared fixtures for the cross-crate tests.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use vps_ledger::Ledger;
use vps_lifecycle::{AddressPool, AssertedOrchestrator, LifecycleManager, Orchestrator};
use vps_proto::{
    Account, AccountId, InstanceId, InstanceSpec, InstanceStatus, ResourceBalance, ServerInstance,
    SpecLimits,
};
use vps_provision::ProvisioningGate;
use vps_store::{
    AccountStore, BalanceWrite, InstanceStore, MemoryStore, ProvisioningStore, StoreError,
    StoreResult,
};

pub fn spec(name: &str, cpu_cores: u32, ram_gb: u32, storage_gb: u32) -> InstanceSpec {
    InstanceSpec {
        name: name.to_string(),
        cpu_cores,
        ram_gb,
        storage_gb,
        os: "ubuntu-22.04".to_string(),
        datacenter: "us-east-1".to_string(),
    }
}

pub async fn funded_account<S: AccountStore + ?Sized>(
    store: &S,
    name: &str,
    balance: ResourceBalance,
) -> StoreResult<AccountId> {
    let account = Account::new(name, format!("auth|{name}"), false).with_balance(balance);
    let id = account.id;
    store.create_account(account).await?;
    Ok(id)
}

/// Ledger, gate and lifecycle manager over one store.
pub struct Stack<S: ProvisioningStore + ?Sized> {
    pub store: Arc<S>,
    pub ledger: Arc<Ledger<S>>,
    pub gate: ProvisioningGate<S>,
    pub orchestrator: Arc<AssertedOrchestrator>,
    pub lifecycle: LifecycleManager<S>,
}

impl<S: ProvisioningStore + 'static> Stack<S> {
    pub fn new(store: Arc<S>) -> Self {
        let ledger = Arc::new(Ledger::new(Arc::clone(&store)));
        let gate = ProvisioningGate::new(Arc::clone(&ledger), SpecLimits::default());
        let pool = AddressPool::new(Ipv4Addr::new(10, 20, 0, 0), 16);
        let orchestrator = Arc::new(AssertedOrchestrator::new(pool));
        let lifecycle = LifecycleManager::new(Arc::clone(&store), orchestrator.clone() as Arc<dyn Orchestrator>);
        Self { store, ledger, gate, orchestrator, lifecycle }
    }
}

// ─── Fault injection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// `commit_provision` fails as if the backing store went away.
    FailCommit,
    /// Another writer changes the balance just before `commit_provision` runs.
    RaceCommit { external_balance: ResourceBalance },
    /// `update_status` and `delete_instance` fail without touching the table.
    FailInstanceWrites,
}

/// A [`MemoryStore`] that misbehaves on demand.
///
/// Instance reads always yield once, so concurrent callers on one task
/// interleave between their read and their write.
pub struct FaultyStore {
    inner: MemoryStore,
    fault: Mutex<Fault>,
}

impl FaultyStore {
    pub fn new(fault: Fault) -> Self {
        Self { inner: MemoryStore::new(), fault: Mutex::new(fault) }
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    fn instance_writes_fail(&self) -> bool {
        *self.fault.lock() == Fault::FailInstanceWrites
    }
}

#[async_trait]
impl AccountStore for FaultyStore {
    async fn create_account(&self, account: Account) -> StoreResult<()> {
        self.inner.create_account(account).await
    }

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        self.inner.account(id).await
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn compare_and_set_balance(
        &self,
        id: AccountId,
        expected: ResourceBalance,
        new: ResourceBalance,
    ) -> StoreResult<BalanceWrite> {
        self.inner.compare_and_set_balance(id, expected, new).await
    }
}

#[async_trait]
impl InstanceStore for FaultyStore {
    async fn instance(&self, id: InstanceId) -> StoreResult<Option<ServerInstance>> {
        tokio::task::yield_now().await;
        self.inner.instance(id).await
    }

    async fn list_by_owner(&self, owner: AccountId) -> StoreResult<Vec<ServerInstance>> {
        self.inner.list_by_owner(owner).await
    }

    async fn update_status(
        &self,
        id: InstanceId,
        status: InstanceStatus,
        network_address: Option<Ipv4Addr>,
    ) -> StoreResult<Option<ServerInstance>> {
        if self.instance_writes_fail() {
            return Err(StoreError::Unavailable("injected status write failure".to_string()));
        }
        self.inner.update_status(id, status, network_address).await
    }

    async fn delete_instance(&self, id: InstanceId) -> StoreResult<Option<ServerInstance>> {
        if self.instance_writes_fail() {
            return Err(StoreError::Unavailable("injected delete failure".to_string()));
        }
        self.inner.delete_instance(id).await
    }
}

#[async_trait]
impl ProvisioningStore for FaultyStore {
    async fn commit_provision(
        &self,
        expected: ResourceBalance,
        new: ResourceBalance,
        instance: ServerInstance,
    ) -> StoreResult<BalanceWrite> {
        let fault = *self.fault.lock();
        match fault {
            Fault::None | Fault::FailInstanceWrites => {}
            Fault::FailCommit => return Err(StoreError::Unavailable("injected commit failure".to_string())),
            Fault::RaceCommit { external_balance } => {
                self.inner.compare_and_set_balance(instance.owner, expected, external_balance).await?;
            }
        }
        self.inner.commit_provision(expected, new, instance).await
    }
}
