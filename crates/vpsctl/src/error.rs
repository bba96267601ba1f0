//! Host error types

use thiserror::Error;
use vps_config::ConfigError;
use vps_ledger::LedgerError;
use vps_lifecycle::LifecycleError;
use vps_proto::ErrorKind;
use vps_provision::ProvisionError;
use vps_store::StoreError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid params for {command}: {reason}")]
    InvalidParams { command: String, reason: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl CliError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ledger(e) => e.kind(),
            Self::Provision(e) => e.kind(),
            Self::Lifecycle(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Config(_) => ErrorKind::Unavailable,
            Self::InvalidParams { .. } => ErrorKind::InvalidSpec,
            Self::UnknownCommand(_) => ErrorKind::NotFound,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
