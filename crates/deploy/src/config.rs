//! Tool configuration, layered from built-in defaults, a TOML file and the environment.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::{Address, U256, address, utils::parse_ether};
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ConfirmationPolicy, DeploymentGraph, EtherscanConfig, VerifierConfig};

/// The default name for the keystone configuration file.
pub const CONFIG_FILENAME: &str = "Keystone.toml";

/// Prefix of environment variables overriding the configuration. `__` separates nested keys,
/// e.g. `KEYSTONE_NETWORK__RPC_URL`.
pub const ENV_PREFIX: &str = "KEYSTONE_";

/// First account of the default Anvil/Hardhat mnemonic.
const DEV_ACCOUNT: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

/// Node connection and signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub rpc_url: Url,
    /// Account every transaction is sent from. Must be unlocked on the node.
    pub from: Address,
    /// Expected chain id, checked before deploying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub probe_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: Url::parse("http://localhost:8545").expect("default RPC URL is valid"),
            from: DEV_ACCOUNT,
            chain_id: None,
            probe_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    pub confirmations: u64,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        let policy = ConfirmationPolicy::default();
        Self {
            confirmations: policy.confirmations,
            poll_interval_secs: policy.poll_interval.as_secs(),
            max_attempts: policy.max_attempts,
        }
    }
}

impl ConfirmationConfig {
    pub fn policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            confirmations: self.confirmations,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    /// Minimum balance of the sender, in ether.
    pub min_balance: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub max_soft_failures: u32,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            min_balance: "0.1".to_string(),
            poll_interval_secs: 5,
            timeout_secs: 600,
            max_soft_failures: crate::funding::DEFAULT_MAX_SOFT_FAILURES,
        }
    }
}

impl FundingConfig {
    pub fn min_balance_wei(&self) -> Result<U256> {
        parse_ether(&self.min_balance)
            .with_context(|| format!("Invalid funding.min_balance `{}`", self.min_balance))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub api_url: Url,
    pub api_key: String,
    /// Chain the explorer indexes. Defaults to the chain of the RPC endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub compiler_version: String,
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub concurrency: usize,
    pub status_poll_interval_secs: u64,
    pub status_poll_attempts: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        let verifier = VerifierConfig::default();
        Self {
            enabled: false,
            api_url: Url::parse("https://api.etherscan.io/v2/api")
                .expect("default explorer URL is valid"),
            api_key: String::new(),
            chain_id: None,
            compiler_version: "v0.8.24+commit.e11b9ed9".to_string(),
            retries: verifier.retries,
            base_delay_ms: verifier.base_delay.as_millis() as u64,
            max_delay_ms: verifier.max_delay.as_millis() as u64,
            concurrency: verifier.concurrency,
            status_poll_interval_secs: 5,
            status_poll_attempts: 12,
        }
    }
}

impl VerificationConfig {
    pub fn verifier(&self) -> VerifierConfig {
        VerifierConfig {
            retries: self.retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            concurrency: self.concurrency,
        }
    }

    /// Explorer settings, falling back to `network_chain_id` when no chain is configured here.
    pub fn etherscan(&self, network_chain_id: u64, base_dir: &Path) -> EtherscanConfig {
        EtherscanConfig {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            chain_id: self.chain_id.unwrap_or(network_chain_id),
            compiler_version: self.compiler_version.clone(),
            status_poll_interval: Duration::from_secs(self.status_poll_interval_secs),
            status_poll_attempts: self.status_poll_attempts,
            base_dir: base_dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Deployment record location.
    pub record: PathBuf,
    /// Env-style address table rewritten after a complete deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_table: Option<PathBuf>,
    /// Prefix of every address table key.
    pub key_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            record: PathBuf::from("deployments/record.json"),
            address_table: None,
            key_prefix: String::new(),
        }
    }
}

/// Complete keystone configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoneConfig {
    /// Directory artifact and source paths are resolved against.
    pub artifacts_dir: PathBuf,
    pub network: NetworkConfig,
    pub confirmation: ConfirmationConfig,
    pub funding: FundingConfig,
    pub verification: VerificationConfig,
    pub output: OutputConfig,
    /// Contracts and ownership edges. The standard topology when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<DeploymentGraph>,
}

impl KeystoneConfig {
    /// Load the configuration from `path` (a file, or a directory holding [`CONFIG_FILENAME`])
    /// layered over the defaults, then apply `KEYSTONE_*` environment overrides.
    ///
    /// A missing file is not an error: defaults and the environment still apply.
    pub fn load(path: &Path) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No configuration file, using defaults");
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

        if let Some(graph) = &config.graph {
            graph
                .validate()
                .context("Invalid deployment graph in configuration")?;
        }

        tracing::debug!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;
        crate::fs::write_atomic(path, content.as_bytes())
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// The configured graph, or the standard topology.
    pub fn graph(&self) -> DeploymentGraph {
        self.graph.clone().unwrap_or_else(DeploymentGraph::standard)
    }
}
