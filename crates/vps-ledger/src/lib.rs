//! Resource ledger: the current cpu/ram/storage balance of each account.
//!
//! Every mutation runs under a per-account async lock and lands as a
//! compare-and-swap on the store, so two debits can never both spend the same
//! units. Only the current balance is durable; no credit/debit history is kept.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use vps_proto::{AccountId, ErrorKind, ResourceBalance, ResourceKind, ResourceOffer, Shortfall};
use vps_store::{AccountStore, BalanceWrite, StoreError};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("offer '{0}' not found")]
    OfferNotFound(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(Shortfall),

    #[error("balance of account {0} changed concurrently; retry the operation")]
    ConcurrencyConflict(AccountId),

    #[error("account {0} is not an administrator")]
    PermissionDenied(AccountId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountNotFound(_) | Self::OfferNotFound(_) => ErrorKind::NotFound,
            Self::InvalidAmount(_) => ErrorKind::InvalidSpec,
            Self::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Store(_) => ErrorKind::Unavailable,
        }
    }

    pub fn shortfall(&self) -> Option<Shortfall> {
        match self {
            Self::InsufficientBalance(s) => Some(*s),
            _ => None,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// ─── Per-account locks ────────────────────────────────────────────────────────

/// Lock map pruning kicks in once this many accounts have entries.
const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per account, created on first use.
#[derive(Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `account`. Released when the guard drops.
    pub async fn acquire(&self, account: AccountId) -> AccountGuard {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() >= PRUNE_THRESHOLD {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(account).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        AccountGuard { account, _guard: guard }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof that the holder has exclusive access to one account's balance.
pub struct AccountGuard {
    account: AccountId,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    pub fn account(&self) -> AccountId {
        self.account
    }
}

// ─── Purchases ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub account_id: AccountId,
    pub offer: ResourceOffer,
    pub balance: ResourceBalance,
    pub purchased_at: DateTime<Utc>,
}

// ─── Administrative adjustments ───────────────────────────────────────────────

/// How an administrator rewrites another account's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BalanceAdjustment {
    /// Replace the balance outright.
    Set { balance: ResourceBalance },
    /// Add or remove units per kind; negative values remove.
    Delta { cpu_cores: i64, ram_gb: i64, storage_gb: i64 },
}

impl BalanceAdjustment {
    /// The balance `current` becomes under this adjustment.
    pub fn apply_to(&self, current: ResourceBalance) -> LedgerResult<ResourceBalance> {
        match *self {
            Self::Set { balance } => Ok(balance),
            Self::Delta { cpu_cores: 0, ram_gb: 0, storage_gb: 0 } => {
                Err(LedgerError::InvalidAmount("adjustment must change at least one resource".to_string()))
            }
            Self::Delta { cpu_cores, ram_gb, storage_gb } => Ok(ResourceBalance::new(
                shift(ResourceKind::Cpu, current.cpu_cores, cpu_cores)?,
                shift(ResourceKind::Ram, current.ram_gb, ram_gb)?,
                shift(ResourceKind::Storage, current.storage_gb, storage_gb)?,
            )),
        }
    }
}

fn shift(kind: ResourceKind, available: u32, delta: i64) -> LedgerResult<u32> {
    let target = i64::from(available) + delta;
    if target < 0 {
        let requested = u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX);
        return Err(LedgerError::InsufficientBalance(Shortfall { kind, requested, available }));
    }
    u32::try_from(target)
        .map_err(|_| LedgerError::InvalidAmount(format!("adjusting {kind} by {delta} would overflow the balance")))
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

pub struct Ledger<S: AccountStore + ?Sized> {
    store: Arc<S>,
    locks: AccountLocks,
    offers: Vec<ResourceOffer>,
}

impl<S: AccountStore + ?Sized> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_offers(store, ResourceOffer::default_catalog())
    }

    pub fn with_offers(store: Arc<S>, offers: Vec<ResourceOffer>) -> Self {
        Self { store, locks: AccountLocks::new(), offers }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn offers(&self) -> &[ResourceOffer] {
        &self.offers
    }

    pub fn offer(&self, offer_id: &str) -> Option<&ResourceOffer> {
        self.offers.iter().find(|o| o.id == offer_id)
    }

    /// Take the account's lock. Hold it across any multi-step update.
    pub async fn lock_account(&self, account: AccountId) -> AccountGuard {
        self.locks.acquire(account).await
    }

    pub async fn balance(&self, account: AccountId) -> LedgerResult<ResourceBalance> {
        let balance = self
            .store
            .account(account)
            .await?
            .map(|a| a.balance)
            .ok_or(LedgerError::AccountNotFound(account))?;
        debug!(account_id = %account, %balance, "balance read");
        Ok(balance)
    }

    /// Add `amount` units of `kind`.
    pub async fn credit(
        &self,
        account: AccountId,
        kind: ResourceKind,
        amount: u32,
    ) -> LedgerResult<ResourceBalance> {
        self.credit_bundle(account, &ResourceBalance::single(kind, amount)).await
    }

    /// Remove `amount` units of `kind`, failing if the balance does not cover it.
    pub async fn debit(
        &self,
        account: AccountId,
        kind: ResourceKind,
        amount: u32,
    ) -> LedgerResult<ResourceBalance> {
        self.debit_bundle(account, &ResourceBalance::single(kind, amount)).await
    }

    pub async fn credit_bundle(
        &self,
        account: AccountId,
        bundle: &ResourceBalance,
    ) -> LedgerResult<ResourceBalance> {
        let guard = self.lock_account(account).await;
        self.credit_held(&guard, bundle).await
    }

    pub async fn debit_bundle(
        &self,
        account: AccountId,
        bundle: &ResourceBalance,
    ) -> LedgerResult<ResourceBalance> {
        let guard = self.lock_account(account).await;
        self.debit_held(&guard, bundle).await
    }

    /// Credit the bundle of `offer_id`. Payment is settled by the caller.
    pub async fn purchase(&self, account: AccountId, offer_id: &str) -> LedgerResult<PurchaseReceipt> {
        let offer = self
            .offer(offer_id)
            .cloned()
            .ok_or_else(|| LedgerError::OfferNotFound(offer_id.to_string()))?;
        let balance = self.credit_bundle(account, &offer.bundle()).await?;
        info!(account_id = %account, offer = %offer.id, price = %offer.price_display(), "offer purchased");
        Ok(PurchaseReceipt { account_id: account, offer, balance, purchased_at: Utc::now() })
    }

    /// Rewrite `account`'s balance on behalf of the administrator `admin`.
    ///
    /// Unknown requesters are refused the same way as non-administrators.
    pub async fn adjust(
        &self,
        admin: AccountId,
        account: AccountId,
        adjustment: &BalanceAdjustment,
    ) -> LedgerResult<ResourceBalance> {
        let is_admin = self.store.account(admin).await?.is_some_and(|a| a.is_admin);
        if !is_admin {
            warn!(admin_id = %admin, account_id = %account, "balance adjustment refused");
            return Err(LedgerError::PermissionDenied(admin));
        }

        let guard = self.lock_account(account).await;
        let current = self.balance_held(&guard).await?;
        let new = adjustment.apply_to(current)?;
        self.write(account, current, new).await?;
        info!(admin_id = %admin, account_id = %account, from = %current, to = %new, "balance adjusted");
        Ok(new)
    }

    /// Read the balance of the locked account.
    pub async fn balance_held(&self, guard: &AccountGuard) -> LedgerResult<ResourceBalance> {
        self.balance(guard.account()).await
    }

    pub async fn credit_held(
        &self,
        guard: &AccountGuard,
        bundle: &ResourceBalance,
    ) -> LedgerResult<ResourceBalance> {
        if bundle.is_zero() {
            return Err(LedgerError::InvalidAmount("credit amount must be greater than zero".to_string()));
        }
        let account = guard.account();
        let current = self.balance(account).await?;
        let new = current
            .checked_add(bundle)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("crediting {bundle} would overflow the balance")))?;
        self.write(account, current, new).await?;
        info!(account_id = %account, credited = %bundle, balance = %new, "balance credited");
        Ok(new)
    }

    pub async fn debit_held(
        &self,
        guard: &AccountGuard,
        bundle: &ResourceBalance,
    ) -> LedgerResult<ResourceBalance> {
        if bundle.is_zero() {
            return Err(LedgerError::InvalidAmount("debit amount must be greater than zero".to_string()));
        }
        let account = guard.account();
        let current = self.balance(account).await?;
        let new = current.checked_sub(bundle).map_err(|shortfall| {
            warn!(account_id = %account, %shortfall, "debit rejected");
            LedgerError::InsufficientBalance(shortfall)
        })?;
        self.write(account, current, new).await?;
        info!(account_id = %account, debited = %bundle, balance = %new, "balance debited");
        Ok(new)
    }

    async fn write(
        &self,
        account: AccountId,
        expected: ResourceBalance,
        new: ResourceBalance,
    ) -> LedgerResult<()> {
        match self.store.compare_and_set_balance(account, expected, new).await? {
            BalanceWrite::Applied => Ok(()),
            BalanceWrite::Missing => Err(LedgerError::AccountNotFound(account)),
            BalanceWrite::Conflict { current } => {
                warn!(account_id = %account, %expected, %current, "balance changed under the ledger");
                Err(LedgerError::ConcurrencyConflict(account))
            }
        }
    }
}
