//! Provisioning gate: decides whether an account may create a server instance.
//!
//! A request is validated, checked against the owner's balance, and then the
//! debit and the instance insert are committed together through
//! [`ProvisioningStore::commit_provision`]. The owner's ledger lock is held
//! from the balance read until the commit returns.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use vps_ledger::{Ledger, LedgerError};
use vps_proto::{
    AccountId, ErrorKind, InstanceSpec, ResourceBalance, ServerInstance, Shortfall, SpecLimits,
    SpecViolation,
};
use vps_store::{BalanceWrite, ProvisioningStore, StoreError};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid instance spec: {0}")]
    InvalidSpec(#[from] SpecViolation),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(Shortfall),

    #[error("balance of account {0} changed concurrently; retry the operation")]
    ConcurrencyConflict(AccountId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(LedgerError),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::AccountNotFound(_) => ErrorKind::NotFound,
            Self::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::Store(_) => ErrorKind::Unavailable,
            Self::Ledger(e) => e.kind(),
        }
    }
}

impl From<LedgerError> for ProvisionError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => Self::AccountNotFound(id),
            LedgerError::InsufficientBalance(s) => Self::InsufficientBalance(s),
            LedgerError::ConcurrencyConflict(id) => Self::ConcurrencyConflict(id),
            LedgerError::Store(e) => Self::Store(e),
            other => Self::Ledger(other),
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

// ─── Gate ─────────────────────────────────────────────────────────────────────

pub struct ProvisioningGate<S: ProvisioningStore + ?Sized> {
    ledger: Arc<Ledger<S>>,
    limits: SpecLimits,
}

impl<S: ProvisioningStore + ?Sized> ProvisioningGate<S> {
    pub fn new(ledger: Arc<Ledger<S>>, limits: SpecLimits) -> Self {
        Self { ledger, limits }
    }

    pub fn limits(&self) -> &SpecLimits {
        &self.limits
    }

    pub fn ledger(&self) -> &Arc<Ledger<S>> {
        &self.ledger
    }

    /// Create an instance for `account` if its balance covers `spec`.
    ///
    /// On success the balance has been debited by exactly the requested
    /// allocation and one new instance in `creating` state exists. On any
    /// error neither has happened.
    pub async fn provision(
        &self,
        account: AccountId,
        spec: &InstanceSpec,
    ) -> ProvisionResult<ServerInstance> {
        spec.validate(&self.limits).inspect_err(|violation| {
            warn!(account_id = %account, %violation, "provision rejected: invalid spec");
        })?;

        let guard = self.ledger.lock_account(account).await;
        let balance = self.ledger.balance_held(&guard).await?;
        let allocation = spec.allocation();
        let remaining = balance.checked_sub(&allocation).map_err(|shortfall| {
            warn!(account_id = %account, %shortfall, "provision rejected: insufficient balance");
            ProvisionError::InsufficientBalance(shortfall)
        })?;

        let instance = ServerInstance::creating(account, spec);
        let outcome = self
            .ledger
            .store()
            .commit_provision(balance, remaining, instance.clone())
            .await?;
        drop(guard);

        match outcome {
            BalanceWrite::Applied => {
                info!(
                    account_id = %account,
                    instance_id = %instance.id,
                    name = %instance.name,
                    allocation = %allocation,
                    balance = %remaining,
                    "instance provisioned"
                );
                Ok(instance)
            }
            BalanceWrite::Missing => Err(ProvisionError::AccountNotFound(account)),
            BalanceWrite::Conflict { current } => {
                warn!(account_id = %account, expected = %balance, %current, "provision lost a balance race");
                Err(ProvisionError::ConcurrencyConflict(account))
            }
        }
    }
}

// ─── Price estimate ───────────────────────────────────────────────────────────

/// Monthly list price shown next to a request, in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyEstimate {
    pub base_cents: u64,
    pub storage_cents: u64,
}

impl MonthlyEstimate {
    /// $8 for 1 core / 2 GB, +$2 per extra core, ±$1.50 per GB of RAM
    /// around 2 GB, +$0.10 per GB of storage above 20 GB.
    pub fn for_allocation(allocation: &ResourceBalance) -> Self {
        let cpu = i64::from(allocation.cpu_cores);
        let ram = i64::from(allocation.ram_gb);
        let base = 800 + (cpu - 1) * 200 + (ram - 2) * 150;
        let storage = u64::from(allocation.storage_gb.saturating_sub(20)) * 10;
        Self { base_cents: base.max(0) as u64, storage_cents: storage }
    }

    pub fn total_cents(&self) -> u64 {
        self.base_cents + self.storage_cents
    }
}
