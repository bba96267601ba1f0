//! Host configuration for the resource gate.
//!
//! A single JSON file read by `vpsctl`. Every field has a default, so an
//! empty object `{}` is a valid configuration.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use vps_proto::{ResourceOffer, SpecLimits};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// IPv4 block the asserted orchestrator assigns instance addresses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPoolConfig {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Default for AddressPoolConfig {
    fn default() -> Self {
        Self { network: Ipv4Addr::new(10, 20, 0, 0), prefix_len: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Directory holding `state/ledger.json`.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    #[serde(default)]
    pub limits: SpecLimits,

    /// Resource offer catalog.
    #[serde(default = "ResourceOffer::default_catalog")]
    pub offers: Vec<ResourceOffer>,

    #[serde(default)]
    pub address_pool: AddressPoolConfig,

    /// Default `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/vps-gate")
}

fn default_log_filter() -> String {
    "vpsctl=info,vps_ledger=info,vps_provision=info,vps_lifecycle=info".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            limits: SpecLimits::default(),
            offers: ResourceOffer::default_catalog(),
            address_pool: AddressPoolConfig::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl GateConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        debug!(path = %path.display(), offers = config.offers.len(), "loaded config");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let write_err = |source| ConfigError::Write { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        std::fs::write(path, data).map_err(write_err)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for offer in &self.offers {
            if !seen.insert(offer.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate offer id '{}'", offer.id)));
            }
            if offer.quantity == 0 {
                return Err(ConfigError::Invalid(format!("offer '{}' grants nothing", offer.id)));
            }
        }
        if !(8..=30).contains(&self.address_pool.prefix_len) {
            return Err(ConfigError::Invalid(format!(
                "address pool prefix /{} outside /8../30",
                self.address_pool.prefix_len
            )));
        }
        if self.limits.max_name_len == 0 {
            return Err(ConfigError::Invalid("max_name_len must be at least 1".to_string()));
        }
        Ok(())
    }
}
