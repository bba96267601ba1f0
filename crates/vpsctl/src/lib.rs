//! vpsctl: operator host for the VPS resource gate
//!
//! Wires the file-backed store, the ledger, the provisioning gate and the
//! lifecycle manager together from a [`GateConfig`], and dispatches named
//! commands with JSON parameters against them.

#![forbid(unsafe_code)]

pub mod commands;
pub mod error;

use std::sync::Arc;
use tracing::debug;
use vps_config::GateConfig;
use vps_ledger::Ledger;
use vps_lifecycle::{AddressPool, AssertedOrchestrator, LifecycleManager};
use vps_provision::ProvisioningGate;
use vps_store::{AccountStore, FileStore, InstanceStore};

pub use commands::{handle_command, CommandRequest};
pub use error::{CliError, CliResult};

// ─── Host ─────────────────────────────────────────────────────────────────────

/// Everything a command handler needs, built once per invocation.
pub struct Host {
    pub config: GateConfig,
    pub store: Arc<FileStore>,
    pub ledger: Arc<Ledger<FileStore>>,
    pub gate: ProvisioningGate<FileStore>,
    pub lifecycle: LifecycleManager<FileStore>,
}

impl Host {
    pub async fn open(config: GateConfig) -> CliResult<Self> {
        config.validate()?;
        let store = Arc::new(FileStore::open(&config.state_path)?);
        let ledger = Arc::new(Ledger::with_offers(Arc::clone(&store), config.offers.clone()));
        let gate = ProvisioningGate::new(Arc::clone(&ledger), config.limits);

        let pool = AddressPool::new(config.address_pool.network, config.address_pool.prefix_len);
        for account in store.list_accounts().await? {
            for instance in store.list_by_owner(account.id).await? {
                if let Some(addr) = instance.network_address {
                    pool.reserve(addr);
                }
            }
        }
        debug!(in_use = pool.in_use(), "address pool seeded from state");

        let orchestrator = Arc::new(AssertedOrchestrator::new(pool));
        let lifecycle = LifecycleManager::new(Arc::clone(&store), orchestrator);

        Ok(Self { config, store, ledger, gate, lifecycle })
    }
}
