//! Configuration.
//!
//! Two sources:
//!
//! - [`FleetConfig`]: the JSON fleet file (`~/.cloudagent/config.json` by
//!   default) shared with the CLI. It declares the shared machine key, the
//!   provider credentials and the desired machines.
//! - [`ServiceConfig`]: control-plane process settings from `CA_*`
//!   environment variables.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cloudagent_reconcile::{RetryBudget, DEFAULT_RETRY_DELAY, DEFAULT_SCHEDULING_WINDOW};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::machine::{InstanceSpec, ProviderKind};

/// Current fleet file version.
pub const CONFIG_VERSION: &str = "1";

const CONFIG_DIR: &str = ".cloudagent";
const CONFIG_FILE: &str = "config.json";
const STORE_FILE: &str = "db.json";

/// The fleet file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    pub version: String,
    pub vm: VmConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    /// Shared key presented to every machine agent.
    pub api_key: String,

    /// Provider-side SSH key names attached to new machines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,

    /// Bootstrap script passed to new machines as user data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_file: Option<PathBuf>,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

/// Provider credentials, tagged by provider name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "config", rename_all = "lowercase")]
pub enum ProviderConfig {
    Hetzner(HetznerConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Hetzner(_) => ProviderKind::Hetzner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HetznerConfig {
    pub token: String,
}

/// Settings applied to every machine a provider creates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionDefaults {
    pub ssh_keys: Vec<String>,
    pub user_data: Option<String>,
}

/// Generates a fresh shared machine key: `sk_` followed by 32 random bytes in hex.
pub fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("sk_{}", hex::encode(bytes))
}

fn home_dir() -> Result<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .context("Could not determine home directory")
}

impl FleetConfig {
    /// A config with a fresh key, no providers and no instances.
    pub fn generate() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            vm: VmConfig {
                api_key: generate_api_key(),
                ssh_keys: Vec::new(),
                user_data_file: None,
                providers: Vec::new(),
                instances: Vec::new(),
            },
        }
    }

    /// `CA_CONFIG`, or `~/.cloudagent/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CA_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Ok(home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fleet config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config atomically with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to set permissions on {}", tmp_path.display()))?;
        }

        fs::rename(&tmp_path, path).with_context(|| {
            format!("Failed to rename {} -> {}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }

    /// Structural checks. Provider coverage of instances is checked at sync
    /// time, where it is a fatal configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.vm.api_key.trim().is_empty() {
            anyhow::bail!("vm.apiKey must not be empty");
        }

        let mut seen_providers = HashSet::new();
        for provider in &self.vm.providers {
            if !seen_providers.insert(provider.kind()) {
                anyhow::bail!("provider '{}' is configured twice", provider.kind());
            }
            match provider {
                ProviderConfig::Hetzner(cfg) if cfg.token.trim().is_empty() => {
                    anyhow::bail!("hetzner provider token must not be empty")
                }
                ProviderConfig::Hetzner(_) => {}
            }
        }

        let mut names = HashSet::new();
        for instance in &self.vm.instances {
            for (field, value) in [
                ("name", &instance.name),
                ("region", &instance.region),
                ("instanceType", &instance.instance_type),
            ] {
                if value.trim().is_empty() {
                    anyhow::bail!("instance {field} must not be empty");
                }
            }
            if !names.insert(instance.name.as_str()) {
                anyhow::bail!("instance name '{}' is declared twice", instance.name);
            }
        }
        Ok(())
    }

    /// Reads the user-data file, if any.
    pub fn provision_defaults(&self) -> Result<ProvisionDefaults> {
        let user_data = match &self.vm.user_data_file {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("Failed to read user data: {}", path.display()))?,
            ),
            None => None,
        };
        Ok(ProvisionDefaults {
            ssh_keys: self.vm.ssh_keys.clone(),
            user_data,
        })
    }
}

/// Control-plane process configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub fleet_config_path: PathBuf,
    pub store_path: PathBuf,
    pub log_level: String,
    pub dispatch_interval: Duration,
    pub status_interval: Duration,
    pub budget: RetryBudget,
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("{name} must be a number of seconds")),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CA_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("CA_LISTEN_ADDR is not a socket address")?;

        let fleet_config_path = FleetConfig::default_path()?;

        let store_path = match std::env::var("CA_STORE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => home_dir()?.join(CONFIG_DIR).join(STORE_FILE),
        };

        let log_level = std::env::var("CA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let budget = RetryBudget::new(
            env_secs("CA_SCHEDULING_BUDGET_SECS", DEFAULT_SCHEDULING_WINDOW)?,
            env_secs("CA_RETRY_DELAY_SECS", DEFAULT_RETRY_DELAY)?,
        );

        Ok(Self {
            listen_addr,
            fleet_config_path,
            store_path,
            log_level,
            dispatch_interval: env_secs("CA_DISPATCH_INTERVAL_SECS", Duration::from_secs(5))?,
            status_interval: env_secs("CA_STATUS_INTERVAL_SECS", Duration::from_secs(10))?,
            budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "1",
        "vm": {
            "apiKey": "sk_abc",
            "providers": [{ "name": "hetzner", "config": { "token": "tok" } }],
            "instances": [
                { "provider": "hetzner", "name": "a", "region": "fsn1", "instanceType": "cpx21" }
            ]
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config: FleetConfig = serde_json::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.vm.providers[0],
            ProviderConfig::Hetzner(HetznerConfig {
                token: "tok".to_string()
            })
        );
        assert_eq!(config.vm.instances[0].instance_type, "cpx21");
        assert!(config.vm.ssh_keys.is_empty());
    }

    #[test]
    fn test_generated_key_format() {
        let key = generate_api_key();
        assert!(key.starts_with("sk_"));
        assert_eq!(key.len(), 3 + 64);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_duplicate_instance_names_rejected() {
        let mut config: FleetConfig = serde_json::from_str(SAMPLE).unwrap();
        let dup = config.vm.instances[0].clone();
        config.vm.instances.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut config = FleetConfig::generate();
        config.vm.api_key = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = FleetConfig::generate();
        config.save(&path).unwrap();
        assert_eq!(FleetConfig::load(&path).unwrap(), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
