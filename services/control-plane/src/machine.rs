//! Machine data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud provider backend tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Hetzner,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hetzner => "hetzner",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side lifecycle of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Creating,
    Running,
    Stopped,
    Error,
    Deleted,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Result of the remote health check against the machine agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineHealth {
    Healthy,
    Unhealthy,
    NoAddress,
    #[default]
    Unknown,
}

impl std::fmt::Display for MachineHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::NoAddress => "no-address",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A provisioned machine as observed from its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Provider-assigned id.
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub instance_type: String,
    /// Public address, assigned asynchronously by the provider.
    #[serde(default)]
    pub address: Option<String>,
    pub status: MachineStatus,
    #[serde(default)]
    pub health: MachineHealth,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Machine {
    /// Running, healthy, and reachable.
    pub fn is_schedulable(&self) -> bool {
        self.status == MachineStatus::Running
            && self.health == MachineHealth::Healthy
            && self.address.is_some()
    }
}

/// One desired machine from the fleet configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub provider: ProviderKind,
    pub name: String,
    pub region: String,
    pub instance_type: String,
}
