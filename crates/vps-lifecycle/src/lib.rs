//! Instance lifecycle: owner-issued start/stop/restart/delete.
//!
//! Status changes are planned by [`plan_transition`], carried out by an
//! [`Orchestrator`], and then written to the instance store. Requests from one
//! account are serialized, and the status is read under that lock, so a
//! transition repeated while the first is in flight is a no-op.
//! Deleting an instance never refunds the owner's balance.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use vps_ledger::AccountLocks;
use vps_proto::{
    AccountId, ErrorKind, InstanceId, InstanceStatus, ResourceBalance, ServerInstance,
};
use vps_store::{AccountStore, InstanceStore, StoreError};

// ─── Actions & transitions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// What applying an action to a status amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already there (or on the way); nothing to do.
    NoOp,
    /// Ask the orchestrator to move the instance toward `target`.
    Apply { target: InstanceStatus },
    /// The action makes no sense from this status.
    Invalid,
}

pub fn plan_transition(from: InstanceStatus, action: LifecycleAction) -> Transition {
    use InstanceStatus::*;
    use LifecycleAction::*;

    match (from, action) {
        (Running, Start) | (Starting, Start) => Transition::NoOp,
        (Stopped, Stop) | (Stopping, Stop) => Transition::NoOp,
        (Starting, Restart) => Transition::NoOp,

        (Creating, Start) | (Stopped, Start) | (Stopping, Start) => {
            Transition::Apply { target: Running }
        }
        (Running, Stop) | (Starting, Stop) => Transition::Apply { target: Stopped },
        (Running, Restart) | (Stopped, Restart) | (Stopping, Restart) => {
            Transition::Apply { target: Running }
        }

        (Creating, Stop) | (Creating, Restart) => Transition::Invalid,
    }
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("address pool exhausted")]
    AddressPoolExhausted,

    #[error("orchestrator rejected {action} for instance {instance}: {reason}")]
    Rejected { instance: InstanceId, action: String, reason: String },

    #[error("orchestrator unreachable: {0}")]
    Unreachable(String),
}

/// Result of a power action as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerReport {
    pub status: InstanceStatus,
    /// Address to record, if the orchestrator assigned one.
    pub network_address: Option<Ipv4Addr>,
}

/// The component that actually powers instances on and off.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, instance: &ServerInstance) -> Result<PowerReport, OrchestrationError>;
    async fn stop(&self, instance: &ServerInstance) -> Result<PowerReport, OrchestrationError>;
    async fn restart(&self, instance: &ServerInstance) -> Result<PowerReport, OrchestrationError>;
    async fn destroy(&self, instance: &ServerInstance) -> Result<(), OrchestrationError>;

    /// Return an address assigned by this orchestrator once no stored
    /// instance holds it.
    fn release_address(&self, _address: Ipv4Addr) {}
}

/// Hands out IPv4 addresses from one CIDR block.
///
/// The network and broadcast addresses and any host ending in `.0` or `.255`
/// are never handed out.
pub struct AddressPool {
    base: u32,
    size: u32,
    used: Mutex<BTreeSet<u32>>,
}

impl AddressPool {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.clamp(8, 30);
        let size = 1u32 << (32 - u32::from(prefix_len));
        let base = u32::from(network) & !(size - 1);
        Self { base, size, used: Mutex::new(BTreeSet::new()) }
    }

    fn usable(&self, offset: u32) -> bool {
        let last_octet = (self.base + offset) & 0xff;
        offset != 0 && offset != self.size - 1 && last_octet != 0 && last_octet != 255
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr).wrapping_sub(self.base) < self.size
    }

    /// Mark an address handed out earlier (e.g. loaded from the store) as used.
    pub fn reserve(&self, addr: Ipv4Addr) {
        if self.contains(addr) {
            self.used.lock().insert(u32::from(addr) - self.base);
        }
    }

    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut used = self.used.lock();
        let offset = (1..self.size).find(|o| self.usable(*o) && !used.contains(o))?;
        used.insert(offset);
        Some(Ipv4Addr::from(self.base + offset))
    }

    pub fn release(&self, addr: Ipv4Addr) {
        if self.contains(addr) {
            self.used.lock().remove(&(u32::from(addr) - self.base));
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().len()
    }
}

/// Orchestrator with no hypervisor behind it: the requested status is taken
/// as the outcome, and an address is assigned on first start.
pub struct AssertedOrchestrator {
    pool: AddressPool,
}

impl AssertedOrchestrator {
    pub fn new(pool: AddressPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    fn power_on(&self, instance: &ServerInstance) -> Result<PowerReport, OrchestrationError> {
        let network_address = match instance.network_address {
            Some(_) => None,
            None => Some(self.pool.allocate().ok_or(OrchestrationError::AddressPoolExhausted)?),
        };
        Ok(PowerReport { status: InstanceStatus::Running, network_address })
    }
}

#[async_trait]
impl Orchestrator for AssertedOrchestrator {
    fn name(&self) -> &str {
        "asserted"
    }

    async fn start(&self, instance: &ServerInstance) -> Result<PowerReport, OrchestrationError> {
        self.power_on(instance)
    }

    async fn stop(&self, _instance: &ServerInstance) -> Result<PowerReport, OrchestrationError> {
        Ok(PowerReport { status: InstanceStatus::Stopped, network_address: None })
    }

    async fn restart(&self, instance: &ServerInstance) -> Result<PowerReport, OrchestrationError> {
        self.power_on(instance)
    }

    async fn destroy(&self, instance: &ServerInstance) -> Result<(), OrchestrationError> {
        debug!(instance_id = %instance.id, "instance destroyed");
        Ok(())
    }

    fn release_address(&self, address: Ipv4Addr) {
        self.pool.release(address);
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("cannot {action} an instance that is {from}")]
    InvalidTransition { from: InstanceStatus, action: LifecycleAction },

    #[error("orchestration failed: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InstanceNotFound(_) | Self::AccountNotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Orchestration(_) | Self::Store(_) => ErrorKind::Unavailable,
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

// ─── Summary ──────────────────────────────────────────────────────────────────

/// Dashboard view of one account: balance plus what its instances hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: AccountId,
    pub balance: ResourceBalance,
    pub instance_count: usize,
    pub creating: usize,
    pub running: usize,
    pub stopped: usize,
    pub transitioning: usize,
    pub allocated: ResourceBalance,
}

impl AccountSummary {
    pub fn from_instances(account_id: AccountId, balance: ResourceBalance, instances: &[ServerInstance]) -> Self {
        let mut summary = Self {
            account_id,
            balance,
            instance_count: instances.len(),
            creating: 0,
            running: 0,
            stopped: 0,
            transitioning: 0,
            allocated: ResourceBalance::ZERO,
        };
        for instance in instances {
            match instance.status {
                InstanceStatus::Creating => summary.creating += 1,
                InstanceStatus::Running => summary.running += 1,
                InstanceStatus::Stopped => summary.stopped += 1,
                InstanceStatus::Starting | InstanceStatus::Stopping => summary.transitioning += 1,
            }
            summary.allocated = summary.allocated.saturating_add(&instance.allocation);
        }
        summary
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct LifecycleManager<S: AccountStore + InstanceStore + ?Sized> {
    store: Arc<S>,
    orchestrator: Arc<dyn Orchestrator>,
    locks: AccountLocks,
}

impl<S: AccountStore + InstanceStore + ?Sized> LifecycleManager<S> {
    pub fn new(store: Arc<S>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { store, orchestrator, locks: AccountLocks::new() }
    }

    /// Fetch an instance, treating instances of other accounts as absent.
    pub async fn get(&self, account: AccountId, id: InstanceId) -> LifecycleResult<ServerInstance> {
        match self.store.instance(id).await? {
            Some(instance) if instance.owner == account => Ok(instance),
            Some(_) => {
                warn!(account_id = %account, instance_id = %id, "instance requested by non-owner");
                Err(LifecycleError::InstanceNotFound(id))
            }
            None => Err(LifecycleError::InstanceNotFound(id)),
        }
    }

    pub async fn list(&self, account: AccountId) -> LifecycleResult<Vec<ServerInstance>> {
        Ok(self.store.list_by_owner(account).await?)
    }

    pub async fn summary(&self, account: AccountId) -> LifecycleResult<AccountSummary> {
        let balance = self
            .store
            .account(account)
            .await?
            .ok_or(LifecycleError::AccountNotFound(account))?
            .balance;
        let instances = self.store.list_by_owner(account).await?;
        Ok(AccountSummary::from_instances(account, balance, &instances))
    }

    pub async fn start(&self, account: AccountId, id: InstanceId) -> LifecycleResult<ServerInstance> {
        self.apply(account, id, LifecycleAction::Start).await
    }

    pub async fn stop(&self, account: AccountId, id: InstanceId) -> LifecycleResult<ServerInstance> {
        self.apply(account, id, LifecycleAction::Stop).await
    }

    pub async fn restart(&self, account: AccountId, id: InstanceId) -> LifecycleResult<ServerInstance> {
        self.apply(account, id, LifecycleAction::Restart).await
    }

    pub async fn apply(
        &self,
        account: AccountId,
        id: InstanceId,
        action: LifecycleAction,
    ) -> LifecycleResult<ServerInstance> {
        let _guard = self.locks.acquire(account).await;
        let instance = self.get(account, id).await?;
        let from = instance.status;

        match plan_transition(from, action) {
            Transition::NoOp => {
                debug!(instance_id = %id, %action, status = %from, "transition is a no-op");
                Ok(instance)
            }
            Transition::Invalid => Err(LifecycleError::InvalidTransition { from, action }),
            Transition::Apply { target } => {
                let report = match action {
                    LifecycleAction::Start => self.orchestrator.start(&instance).await,
                    LifecycleAction::Stop => self.orchestrator.stop(&instance).await,
                    LifecycleAction::Restart => self.orchestrator.restart(&instance).await,
                }
                .inspect_err(|e| {
                    warn!(instance_id = %id, %action, orchestrator = self.orchestrator.name(), error = %e, "orchestration failed");
                })?;

                let updated = match self.store.update_status(id, report.status, report.network_address).await {
                    Ok(Some(updated)) => updated,
                    outcome => {
                        // The new address was never recorded; hand it back.
                        if let Some(addr) = report.network_address {
                            self.orchestrator.release_address(addr);
                        }
                        warn!(instance_id = %id, %action, "status write failed after orchestration");
                        return Err(match outcome {
                            Err(e) => e.into(),
                            Ok(_) => LifecycleError::InstanceNotFound(id),
                        });
                    }
                };
                info!(
                    instance_id = %id,
                    %action,
                    from = %from,
                    to = %updated.status,
                    requested = %target,
                    "instance transitioned"
                );
                Ok(updated)
            }
        }
    }

    /// Remove the instance. The owner's balance is left as it is.
    ///
    /// The address goes back to the orchestrator only after the store has
    /// dropped the instance.
    pub async fn delete(&self, account: AccountId, id: InstanceId) -> LifecycleResult<ServerInstance> {
        let _guard = self.locks.acquire(account).await;
        let instance = self.get(account, id).await?;
        self.orchestrator.destroy(&instance).await?;
        let removed = self
            .store
            .delete_instance(id)
            .await?
            .ok_or(LifecycleError::InstanceNotFound(id))?;
        if let Some(addr) = removed.network_address {
            self.orchestrator.release_address(addr);
        }
        info!(account_id = %account, instance_id = %id, status = %removed.status, "instance deleted");
        Ok(removed)
    }
}
