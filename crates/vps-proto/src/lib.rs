//! Domain types shared by the VPS ledger, provisioning gate and lifecycle crates.
//!
//! Accounts hold a three-dimensional resource balance (cores, memory, storage).
//! Server instances are created against that balance and then driven through
//! their lifecycle by their owner.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ─── Identifiers ──────────────────────────────────────────────────────────────

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a registered dashboard account.
    AccountId
}

uuid_id! {
    /// Identifier of a provisioned server instance.
    InstanceId
}

// ─── Resources ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Ram,
    #[serde(alias = "disk")]
    Storage,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Cpu, Self::Ram, Self::Storage];

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Cpu => "cores",
            Self::Ram | Self::Storage => "GB",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Ram => write!(f, "ram"),
            Self::Storage => write!(f, "storage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource kind '{0}' (expected cpu, ram or storage)")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "cores" => Ok(Self::Cpu),
            "ram" | "memory" => Ok(Self::Ram),
            "storage" | "disk" => Ok(Self::Storage),
            other => Err(UnknownResourceKind(other.to_string())),
        }
    }
}

/// The missing quantity of the first resource kind that could not be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub kind: ResourceKind,
    pub requested: u32,
    pub available: u32,
}

impl Shortfall {
    pub fn missing(&self) -> u32 {
        self.requested.saturating_sub(self.available)
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} short by {} {} (requested {}, available {})",
            self.kind,
            self.missing(),
            self.kind.unit(),
            self.requested,
            self.available
        )
    }
}

/// Quantities of each resource kind.
///
/// Used both for an account's balance and for the allocation an instance
/// requests. All quantities are unsigned: a balance cannot go negative, and
/// every subtraction goes through [`ResourceBalance::checked_sub`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceBalance {
    pub cpu_cores: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
}

impl ResourceBalance {
    pub const ZERO: ResourceBalance = ResourceBalance { cpu_cores: 0, ram_gb: 0, storage_gb: 0 };

    pub fn new(cpu_cores: u32, ram_gb: u32, storage_gb: u32) -> Self {
        Self { cpu_cores, ram_gb, storage_gb }
    }

    /// A balance holding `amount` of one kind and nothing else.
    pub fn single(kind: ResourceKind, amount: u32) -> Self {
        let mut b = Self::ZERO;
        *b.get_mut(kind) = amount;
        b
    }

    pub fn get(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Cpu => self.cpu_cores,
            ResourceKind::Ram => self.ram_gb,
            ResourceKind::Storage => self.storage_gb,
        }
    }

    fn get_mut(&mut self, kind: ResourceKind) -> &mut u32 {
        match kind {
            ResourceKind::Cpu => &mut self.cpu_cores,
            ResourceKind::Ram => &mut self.ram_gb,
            ResourceKind::Storage => &mut self.storage_gb,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Check that `self` covers `request` in every dimension.
    pub fn covers(&self, request: &ResourceBalance) -> Result<(), Shortfall> {
        for kind in ResourceKind::ALL {
            let available = self.get(kind);
            let requested = request.get(kind);
            if available < requested {
                return Err(Shortfall { kind, requested, available });
            }
        }
        Ok(())
    }

    pub fn checked_sub(&self, request: &ResourceBalance) -> Result<ResourceBalance, Shortfall> {
        self.covers(request)?;
        Ok(Self {
            cpu_cores: self.cpu_cores - request.cpu_cores,
            ram_gb: self.ram_gb - request.ram_gb,
            storage_gb: self.storage_gb - request.storage_gb,
        })
    }

    /// Returns `None` on counter overflow.
    pub fn checked_add(&self, other: &ResourceBalance) -> Option<ResourceBalance> {
        Some(Self {
            cpu_cores: self.cpu_cores.checked_add(other.cpu_cores)?,
            ram_gb: self.ram_gb.checked_add(other.ram_gb)?,
            storage_gb: self.storage_gb.checked_add(other.storage_gb)?,
        })
    }

    pub fn saturating_add(&self, other: &ResourceBalance) -> ResourceBalance {
        Self {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            ram_gb: self.ram_gb.saturating_add(other.ram_gb),
            storage_gb: self.storage_gb.saturating_add(other.storage_gb),
        }
    }
}

impl fmt::Display for ResourceBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cores / {} GB RAM / {} GB storage",
            self.cpu_cores, self.ram_gb, self.storage_gb
        )
    }
}

// ─── Accounts & offers ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    /// Opaque reference into the external authentication provider.
    pub auth_ref: String,
    pub is_admin: bool,
    pub balance: ResourceBalance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly signed-up account with an empty balance.
    pub fn new(display_name: impl Into<String>, auth_ref: impl Into<String>, is_admin: bool) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            display_name: display_name.into(),
            auth_ref: auth_ref.into(),
            is_admin,
            balance: ResourceBalance::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_balance(mut self, balance: ResourceBalance) -> Self {
        self.balance = balance;
        self
    }
}

/// A purchasable bundle of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub quantity: u32,
    pub price_cents: u32,
}

impl ResourceOffer {
    /// The store catalog shipped by default.
    pub fn default_catalog() -> Vec<ResourceOffer> {
        vec![
            ResourceOffer { id: "ram-boost".to_string(), name: "RAM Boost".to_string(), kind: ResourceKind::Ram, quantity: 4, price_cents: 500 },
            ResourceOffer { id: "disk-expansion".to_string(), name: "Disk Expansion".to_string(), kind: ResourceKind::Storage, quantity: 50, price_cents: 1000 },
            ResourceOffer { id: "cpu-upgrade".to_string(), name: "CPU Upgrade".to_string(), kind: ResourceKind::Cpu, quantity: 2, price_cents: 800 },
        ]
    }

    pub fn bundle(&self) -> ResourceBalance {
        ResourceBalance::single(self.kind, self.quantity)
    }

    pub fn price_display(&self) -> String {
        format!("${}.{:02}", self.price_cents / 100, self.price_cents % 100)
    }
}

// ─── Instance spec ────────────────────────────────────────────────────────────

/// What a caller asks the provisioning gate for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub cpu_cores: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
    pub os: String,
    pub datacenter: String,
}

impl InstanceSpec {
    pub fn allocation(&self) -> ResourceBalance {
        ResourceBalance::new(self.cpu_cores, self.ram_gb, self.storage_gb)
    }

    pub fn validate(&self, limits: &SpecLimits) -> Result<(), SpecViolation> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SpecViolation::EmptyName);
        }
        if name.chars().count() > limits.max_name_len {
            return Err(SpecViolation::NameTooLong { max: limits.max_name_len });
        }
        let minimums = [
            (ResourceKind::Cpu, self.cpu_cores, limits.min_cpu_cores),
            (ResourceKind::Ram, self.ram_gb, limits.min_ram_gb),
            (ResourceKind::Storage, self.storage_gb, limits.min_storage_gb),
        ];
        for (kind, value, min) in minimums {
            if value < min {
                return Err(SpecViolation::BelowMinimum { kind, value, min });
            }
        }
        if self.os.trim().is_empty() {
            return Err(SpecViolation::MissingLabel("os"));
        }
        if self.datacenter.trim().is_empty() {
            return Err(SpecViolation::MissingLabel("datacenter"));
        }
        Ok(())
    }
}

/// Minimum allocation and naming rules applied before any balance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecLimits {
    pub min_cpu_cores: u32,
    pub min_ram_gb: u32,
    pub min_storage_gb: u32,
    pub max_name_len: usize,
}

impl Default for SpecLimits {
    fn default() -> Self {
        Self { min_cpu_cores: 1, min_ram_gb: 1, min_storage_gb: 1, max_name_len: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecViolation {
    #[error("name must not be empty")]
    EmptyName,

    #[error("name must be at most {max} characters")]
    NameTooLong { max: usize },

    #[error("{kind} must be at least {min} {unit} (got {value})", unit = .kind.unit())]
    BelowMinimum { kind: ResourceKind, value: u32, min: u32 },

    #[error("{0} must not be empty")]
    MissingLabel(&'static str),
}

// ─── Instances ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Starting,
    Stopping,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 5] =
        [Self::Creating, Self::Running, Self::Stopped, Self::Starting, Self::Stopping];
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: InstanceId,
    pub owner: AccountId,
    pub name: String,
    pub status: InstanceStatus,
    pub allocation: ResourceBalance,
    pub os: String,
    pub datacenter: String,
    pub network_address: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerInstance {
    /// A new record in `creating` state with no address yet.
    pub fn creating(owner: AccountId, spec: &InstanceSpec) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            owner,
            name: spec.name.trim().to_string(),
            status: InstanceStatus::Creating,
            allocation: spec.allocation(),
            os: spec.os.clone(),
            datacenter: spec.datacenter.clone(),
            network_address: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Error classification ────────────────────────────────────────────────────

/// Coarse error classes surfaced to callers, independent of which crate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidSpec,
    InsufficientBalance,
    ConcurrencyConflict,
    InvalidTransition,
    PermissionDenied,
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::InvalidSpec => "invalid_spec",
            Self::InsufficientBalance => "insufficient_balance",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::InvalidTransition => "invalid_transition",
            Self::PermissionDenied => "permission_denied",
            Self::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}
