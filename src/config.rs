//! Configuration management for the governance relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The resulting [`Settings`] value is built once at startup and handed to each
//! component; nothing reads configuration from global state afterwards.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub cache: CacheConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub main: ChainConfig,
    pub secondaries: HashMap<String, ChainConfig>,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Attempts per write before the error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between write attempts, multiplied by the attempt number
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound on any single RPC request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Upper bound on waiting for a submitted write to be mined
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Mirror / status reconciliation sweep
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Ended-proposal finalization sweep
    #[serde(default = "default_process_interval_secs")]
    pub process_interval_secs: u64,
    /// Log polling interval for chains without a WebSocket endpoint
    #[serde(default = "default_event_poll_interval_ms")]
    pub event_poll_interval_ms: u64,
    #[serde(default = "default_trigger_channel_capacity")]
    pub trigger_channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    pub governance_address: String,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_gas_price_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the signer's private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2_000
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_confirmation_timeout_secs() -> u64 {
    120
}
fn default_health_check_interval_secs() -> u64 {
    60
}
fn default_reconnect_max_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_sync_interval_secs() -> u64 {
    3_600
}
fn default_process_interval_secs() -> u64 {
    120
}
fn default_event_poll_interval_ms() -> u64 {
    2_000
}
fn default_trigger_channel_capacity() -> usize {
    1_024
}
fn default_confirmation_blocks() -> u64 {
    1
}
fn default_gas_price_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}
fn default_max_gas_price_gwei() -> u64 {
    500
}
fn default_enabled() -> bool {
    true
}
fn default_private_key_env() -> String {
    "RELAYER_PRIVATE_KEY".to_string()
}

impl RelayerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("GOVERNANCE_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.drop_blank_urls();
        settings.validate()?;

        Ok(settings)
    }

    /// Unset `${VAR}` references leave empty strings behind
    fn drop_blank_urls(&mut self) {
        for chain in std::iter::once(&mut self.main).chain(self.secondaries.values_mut()) {
            chain.rpc_urls.retain(|url| !url.trim().is_empty());
            if chain.ws_url.as_deref().map_or(false, |url| url.trim().is_empty()) {
                chain.ws_url = None;
            }
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if !self.main.enabled {
            anyhow::bail!("The main chain cannot be disabled");
        }

        if self.enabled_secondaries().is_empty() {
            anyhow::bail!("At least one secondary chain must be enabled");
        }

        let mut seen = HashSet::new();
        for chain in self.all_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
            if chain.governance_address.is_empty() {
                anyhow::bail!("Chain {} has no governance address configured", chain.name);
            }
            if !seen.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} is configured more than once", chain.chain_id);
            }
            if chain.ws_url.is_none() {
                tracing::warn!(
                    "Chain {} has no WebSocket URL - events will be polled",
                    chain.name
                );
            }
        }

        if self.relayer.max_retries == 0 {
            anyhow::bail!("relayer.max_retries must be at least 1");
        }
        if self.relayer.reconnect_max_attempts == 0 {
            anyhow::bail!("relayer.reconnect_max_attempts must be at least 1");
        }

        Ok(())
    }

    /// Get list of enabled secondary chains, ordered by chain id
    pub fn enabled_secondaries(&self) -> Vec<&ChainConfig> {
        let mut chains: Vec<_> = self.secondaries.values().filter(|c| c.enabled).collect();
        chains.sort_by_key(|c| c.chain_id);
        chains
    }

    /// Main chain followed by every enabled secondary
    pub fn all_chains(&self) -> Vec<&ChainConfig> {
        let mut chains = vec![&self.main];
        chains.extend(self.enabled_secondaries());
        chains
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
