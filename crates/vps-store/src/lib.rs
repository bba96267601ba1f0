//! Account and instance tables behind the ledger and provisioning gate.
//!
//! The ledger only talks to the store through [`AccountStore`],
//! [`InstanceStore`] and [`ProvisioningStore`]. Two implementations ship here:
//! [`MemoryStore`] and [`FileStore`], the latter snapshotting every committed
//! write through [`vps_persist::JsonStore`].

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info};
use vps_persist::{JsonStore, PersistError};
use vps_proto::{
    Account, AccountId, ErrorKind, InstanceId, InstanceStatus, ResourceBalance, ServerInstance,
};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} already exists")]
    AccountExists(AccountId),

    #[error("instance {0} already exists")]
    InstanceExists(InstanceId),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountExists(_) | Self::InstanceExists(_) => ErrorKind::InvalidSpec,
            Self::Persist(_) | Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditional balance write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceWrite {
    /// The stored balance matched `expected` and was replaced.
    Applied,
    /// The stored balance no longer matches `expected`; nothing was written.
    Conflict { current: ResourceBalance },
    /// No such account.
    Missing,
}

// ─── Interfaces ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_account(&self, account: Account) -> StoreResult<()>;

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Replace the balance only if it still equals `expected`, in one step.
    async fn compare_and_set_balance(
        &self,
        id: AccountId,
        expected: ResourceBalance,
        new: ResourceBalance,
    ) -> StoreResult<BalanceWrite>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn instance(&self, id: InstanceId) -> StoreResult<Option<ServerInstance>>;

    /// Instances owned by `owner`, newest first.
    async fn list_by_owner(&self, owner: AccountId) -> StoreResult<Vec<ServerInstance>>;

    /// Set the status. A `Some` address replaces the stored one; `None` keeps it.
    async fn update_status(
        &self,
        id: InstanceId,
        status: InstanceStatus,
        network_address: Option<Ipv4Addr>,
    ) -> StoreResult<Option<ServerInstance>>;

    async fn delete_instance(&self, id: InstanceId) -> StoreResult<Option<ServerInstance>>;
}

#[async_trait]
pub trait ProvisioningStore: AccountStore + InstanceStore {
    /// Debit the owner and insert `instance` as one write.
    ///
    /// Applies only if the owner's balance still equals `expected`. On any
    /// outcome other than [`BalanceWrite::Applied`] neither the balance nor the
    /// instance table is changed.
    async fn commit_provision(
        &self,
        expected: ResourceBalance,
        new: ResourceBalance,
        instance: ServerInstance,
    ) -> StoreResult<BalanceWrite>;
}

// ─── Tables ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    instances: BTreeMap<InstanceId, ServerInstance>,
}

/// On-disk form of [`Tables`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    accounts: Vec<Account>,
    instances: Vec<ServerInstance>,
}

impl From<Snapshot> for Tables {
    fn from(s: Snapshot) -> Self {
        Self {
            accounts: s.accounts.into_iter().map(|a| (a.id, a)).collect(),
            instances: s.instances.into_iter().map(|i| (i.id, i)).collect(),
        }
    }
}

impl From<&Tables> for Snapshot {
    fn from(t: &Tables) -> Self {
        Self {
            accounts: t.accounts.values().cloned().collect(),
            instances: t.instances.values().cloned().collect(),
        }
    }
}

impl Tables {
    fn set_balance_if(
        &mut self,
        id: AccountId,
        expected: ResourceBalance,
        new: ResourceBalance,
    ) -> BalanceWrite {
        let Some(account) = self.accounts.get_mut(&id) else {
            return BalanceWrite::Missing;
        };
        if account.balance != expected {
            return BalanceWrite::Conflict { current: account.balance };
        }
        account.balance = new;
        account.updated_at = Utc::now();
        BalanceWrite::Applied
    }
}

// ─── Durability ───────────────────────────────────────────────────────────────

/// Where committed tables go after each write.
pub trait Durability: Send + Sync {
    fn persist(&self, tables: &Tables) -> StoreResult<()>;
}

/// Keeps nothing beyond process memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct Volatile;

impl Durability for Volatile {
    fn persist(&self, _tables: &Tables) -> StoreResult<()> {
        Ok(())
    }
}

impl Durability for JsonStore {
    fn persist(&self, tables: &Tables) -> StoreResult<()> {
        self.save(&Snapshot::from(tables)).map_err(StoreError::from)
    }
}

// ─── TableStore ───────────────────────────────────────────────────────────────

/// Account and instance tables guarded by one mutex.
///
/// Every write is applied to a draft copy, handed to the durability layer, and
/// only then published. A failed persist leaves the published tables exactly
/// as they were.
pub struct TableStore<D: Durability> {
    tables: Mutex<Tables>,
    durability: D,
}

pub type MemoryStore = TableStore<Volatile>;
pub type FileStore = TableStore<JsonStore>;

impl TableStore<Volatile> {
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()), durability: Volatile }
    }
}

impl Default for TableStore<Volatile> {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore<JsonStore> {
    /// Open (or create) the ledger snapshot under `state_path`.
    pub fn open(state_path: &Path) -> StoreResult<Self> {
        let store = JsonStore::new(state_path, "ledger");
        let tables: Tables = store.load::<Snapshot>()?.unwrap_or_default().into();
        info!(
            path = %store.path().display(),
            accounts = tables.accounts.len(),
            instances = tables.instances.len(),
            "opened ledger state"
        );
        Ok(Self { tables: Mutex::new(tables), durability: store })
    }
}

impl<D: Durability> TableStore<D> {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.lock())
    }

    /// Run `f` on a draft. The draft is persisted and published only when `f`
    /// reports that it changed something.
    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<(R, bool)>) -> StoreResult<R> {
        let mut tables = self.tables.lock();
        let mut draft = tables.clone();
        let (result, changed) = f(&mut draft)?;
        if changed {
            if let Err(e) = self.durability.persist(&draft) {
                error!(error = %e, "failed to persist ledger state, write discarded");
                return Err(e);
            }
            *tables = draft;
        }
        Ok(result)
    }
}

#[async_trait]
impl<D: Durability> AccountStore for TableStore<D> {
    async fn create_account(&self, account: Account) -> StoreResult<()> {
        let id = account.id;
        self.write(|t| {
            if t.accounts.contains_key(&id) {
                return Err(StoreError::AccountExists(id));
            }
            t.accounts.insert(id, account);
            Ok(((), true))
        })?;
        debug!(account_id = %id, "account row inserted");
        Ok(())
    }

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.read(|t| t.accounts.get(&id).cloned()))
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut accounts = self.read(|t| t.accounts.values().cloned().collect::<Vec<_>>());
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(accounts)
    }

    async fn compare_and_set_balance(
        &self,
        id: AccountId,
        expected: ResourceBalance,
        new: ResourceBalance,
    ) -> StoreResult<BalanceWrite> {
        self.write(|t| {
            let outcome = t.set_balance_if(id, expected, new);
            let changed = outcome == BalanceWrite::Applied;
            Ok((outcome, changed))
        })
    }
}

#[async_trait]
impl<D: Durability> InstanceStore for TableStore<D> {
    async fn instance(&self, id: InstanceId) -> StoreResult<Option<ServerInstance>> {
        Ok(self.read(|t| t.instances.get(&id).cloned()))
    }

    async fn list_by_owner(&self, owner: AccountId) -> StoreResult<Vec<ServerInstance>> {
        let mut owned = self.read(|t| {
            t.instances
                .values()
                .filter(|i| i.owner == owner)
                .cloned()
                .collect::<Vec<_>>()
        });
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn update_status(
        &self,
        id: InstanceId,
        status: InstanceStatus,
        network_address: Option<Ipv4Addr>,
    ) -> StoreResult<Option<ServerInstance>> {
        self.write(|t| {
            let Some(instance) = t.instances.get_mut(&id) else {
                return Ok((None, false));
            };
            instance.status = status;
            if network_address.is_some() {
                instance.network_address = network_address;
            }
            instance.updated_at = Utc::now();
            Ok((Some(instance.clone()), true))
        })
    }

    async fn delete_instance(&self, id: InstanceId) -> StoreResult<Option<ServerInstance>> {
        self.write(|t| {
            let removed = t.instances.remove(&id);
            let changed = removed.is_some();
            Ok((removed, changed))
        })
    }
}

#[async_trait]
impl<D: Durability> ProvisioningStore for TableStore<D> {
    async fn commit_provision(
        &self,
        expected: ResourceBalance,
        new: ResourceBalance,
        instance: ServerInstance,
    ) -> StoreResult<BalanceWrite> {
        self.write(|t| {
            if t.instances.contains_key(&instance.id) {
                return Err(StoreError::InstanceExists(instance.id));
            }
            let outcome = t.set_balance_if(instance.owner, expected, new);
            if outcome != BalanceWrite::Applied {
                return Ok((outcome, false));
            }
            t.instances.insert(instance.id, instance);
            Ok((BalanceWrite::Applied, true))
        })
    }
}
