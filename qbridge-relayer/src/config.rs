//! Relayer configuration.
//!
//! Loaded either from plain `QBRIDGE_*` environment variables
//! ([`RelayerConfig::from_env`]) or from a TOML file layered under
//! `QBRIDGE__*` overrides ([`RelayerConfig::load`]).

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use k256::ecdsa::SigningKey;
use qbridge_core::{address_of, signing_key_from_hex, Address, ChainId};
use serde::{Deserialize, Serialize};

use crate::error::{RelayerError, Result};
use crate::retry::RetryPolicy;

/// Which proof a leader submits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofMode {
    /// Always the signature quorum.
    #[default]
    Quorum,
    /// The inclusion proof when the event carries one, otherwise the quorum.
    PreferInclusion,
}

impl FromStr for ProofMode {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quorum" => Ok(ProofMode::Quorum),
            "prefer_inclusion" | "inclusion" => Ok(ProofMode::PreferInclusion),
            other => Err(RelayerError::Config(format!("unknown proof mode: {other}"))),
        }
    }
}

/// RPC endpoint and bridge contract for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: ChainId,
    pub rpc_url: String,
    pub bridge_address: Option<String>,
    /// First block the log source scans.
    #[serde(default)]
    pub start_block: u64,
}

/// Relayer configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    /// Hex secp256k1 key; also the relayer identity.
    pub relayer_key: String,
    /// Shared state directory for pool, lease, lock and failure records.
    pub state_dir: PathBuf,
    /// Chains watched for events.
    pub source_chains: Vec<ChainId>,
    /// Chains this process may submit to.
    pub destination_chains: Vec<ChainId>,
    pub chains: Vec<ChainEndpoint>,
    pub poll_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub lease_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    /// Pool records older than this are dropped.
    pub pending_ttl_secs: u64,
    /// Digests that exhausted their retries are left alone this long.
    pub failure_cooldown_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub proof_mode: ProofMode,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            relayer_key: String::new(),
            state_dir: PathBuf::from("./qbridge-state"),
            source_chains: Vec::new(),
            destination_chains: Vec::new(),
            chains: Vec::new(),
            poll_interval_ms: 5_000,
            sweep_interval_ms: 2_000,
            lease_ttl_secs: 30,
            lock_ttl_secs: 120,
            pending_ttl_secs: 24 * 60 * 60,
            failure_cooldown_secs: 300,
            max_retries: 5,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            jitter_min_ms: 100,
            jitter_max_ms: 500,
            proof_mode: ProofMode::Quorum,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayerError::Config(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_list<T>(name: &str, raw: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|e| RelayerError::Config(format!("{name}: {e}"))))
        .collect()
}

fn env_list<T>(name: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => parse_list(name, &raw),
        Err(_) => Ok(Vec::new()),
    }
}

/// Environment entries whose name and value are both valid UTF-8. Anything
/// else cannot be a `QBRIDGE_*` setting.
fn utf8_vars(vars: impl Iterator<Item = (OsString, OsString)>) -> impl Iterator<Item = (String, String)> {
    vars.filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

impl RelayerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(utf8_vars(env::vars_os()))?.with_env_scalars()
    }

    fn with_env_scalars(mut self) -> Result<Self> {
        let defaults = RelayerConfig::default();
        self.relayer_key = env::var("QBRIDGE_RELAYER_KEY")
            .map_err(|_| RelayerError::Config("QBRIDGE_RELAYER_KEY must be set".into()))?;
        self.state_dir = env::var("QBRIDGE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        self.source_chains = env_list("QBRIDGE_SOURCE_CHAINS")?;
        self.destination_chains = env_list("QBRIDGE_DESTINATION_CHAINS")?;
        self.poll_interval_ms = env_parse("QBRIDGE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?;
        self.sweep_interval_ms = env_parse("QBRIDGE_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms)?;
        self.lease_ttl_secs = env_parse("QBRIDGE_LEASE_TTL_SECS", defaults.lease_ttl_secs)?;
        self.lock_ttl_secs = env_parse("QBRIDGE_LOCK_TTL_SECS", defaults.lock_ttl_secs)?;
        self.pending_ttl_secs = env_parse("QBRIDGE_PENDING_TTL_SECS", defaults.pending_ttl_secs)?;
        self.failure_cooldown_secs =
            env_parse("QBRIDGE_FAILURE_COOLDOWN_SECS", defaults.failure_cooldown_secs)?;
        self.max_retries = env_parse("QBRIDGE_MAX_RETRIES", defaults.max_retries)?;
        self.retry_base_ms = env_parse("QBRIDGE_RETRY_BASE_MS", defaults.retry_base_ms)?;
        self.retry_max_ms = env_parse("QBRIDGE_RETRY_MAX_MS", defaults.retry_max_ms)?;
        self.jitter_min_ms = env_parse("QBRIDGE_JITTER_MIN_MS", defaults.jitter_min_ms)?;
        self.jitter_max_ms = env_parse("QBRIDGE_JITTER_MAX_MS", defaults.jitter_max_ms)?;
        self.proof_mode = env_parse("QBRIDGE_PROOF_MODE", defaults.proof_mode)?;
        Ok(self)
    }

    /// Collect `QBRIDGE_RPC_<chain>` and `QBRIDGE_BRIDGE_<chain>` endpoints.
    fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Result<Self> {
        let mut rpc: BTreeMap<ChainId, String> = BTreeMap::new();
        let mut bridges: BTreeMap<ChainId, String> = BTreeMap::new();
        let mut start_blocks: BTreeMap<ChainId, u64> = BTreeMap::new();

        for (key, value) in vars {
            if let Some(chain) = key.strip_prefix("QBRIDGE_RPC_") {
                rpc.insert(chain.parse()?, value);
            } else if let Some(chain) = key.strip_prefix("QBRIDGE_BRIDGE_") {
                bridges.insert(chain.parse()?, value);
            } else if let Some(chain) = key.strip_prefix("QBRIDGE_START_BLOCK_") {
                let block = value
                    .trim()
                    .parse()
                    .map_err(|e| RelayerError::Config(format!("{key}: {e}")))?;
                start_blocks.insert(chain.parse()?, block);
            }
        }

        let chains = rpc
            .into_iter()
            .map(|(chain_id, rpc_url)| ChainEndpoint {
                chain_id,
                rpc_url,
                bridge_address: bridges.remove(&chain_id),
                start_block: start_blocks.get(&chain_id).copied().unwrap_or(0),
            })
            .collect();

        Ok(Self {
            chains,
            ..Self::default()
        })
    }

    /// Load from an optional TOML file, then `QBRIDGE__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("QBRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("source_chains")
                    .with_list_parse_key("destination_chains"),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.signing_key()?;
        if self.destination_chains.is_empty() {
            return Err(RelayerError::Config("no destination chains".into()));
        }
        if self.max_retries == 0 {
            return Err(RelayerError::Config("max_retries must be at least 1".into()));
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(RelayerError::Config(format!(
                "retry_base_ms {} exceeds retry_max_ms {}",
                self.retry_base_ms, self.retry_max_ms
            )));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(RelayerError::Config(format!(
                "jitter_min_ms {} exceeds jitter_max_ms {}",
                self.jitter_min_ms, self.jitter_max_ms
            )));
        }
        if self.lease_ttl_secs == 0 || self.lock_ttl_secs == 0 {
            return Err(RelayerError::Config("lease and lock TTLs must be positive".into()));
        }
        Ok(())
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        signing_key_from_hex(&self.relayer_key)
            .map_err(|e| RelayerError::Config(format!("relayer key: {e}")))
    }

    /// Address derived from the relayer key.
    pub fn identity(&self) -> Result<Address> {
        Ok(address_of(self.signing_key()?.verifying_key()))
    }

    pub fn endpoint(&self, chain: ChainId) -> Option<&ChainEndpoint> {
        self.chains.iter().find(|c| c.chain_id == chain)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            jitter_min: Duration::from_millis(self.jitter_min_ms),
            jitter_max: Duration::from_millis(self.jitter_max_ms),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl fmt::Debug for RelayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerConfig")
            .field("relayer_key", &"<redacted>")
            .field("state_dir", &self.state_dir)
            .field("source_chains", &self.source_chains)
            .field("destination_chains", &self.destination_chains)
            .field("chains", &self.chains)
            .field("lease_ttl_secs", &self.lease_ttl_secs)
            .field("lock_ttl_secs", &self.lock_ttl_secs)
            .field("max_retries", &self.max_retries)
            .field("proof_mode", &self.proof_mode)
            .finish_non_exhaustive()
    }
}
