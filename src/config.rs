//! Layered configuration: CLI flags (`clap`) > environment variables
//! (`ORACLE_*`) > a TOML config file > built-in defaults. Grounded on
//! `opensub-keeper`'s `Args`/`KeeperConfig` split (CLI struct parsed by
//! `clap`, then folded with file/env data into a validated config), and
//! its `private_key_env`/`KEEPER_PRIVATE_KEY` indirection for the
//! signing key, which this config generalizes to "never accepted
//! directly, only via an env var named in the file".

use crate::errors::OracleError;
use crate::feeds::FeedConfig;
use clap::Parser;
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "oracle-node", version, about = "Decentralized off-chain oracle node")]
pub struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "ORACLE_CONFIG", default_value = "oracle.toml")]
    pub config: PathBuf,

    /// Override RPC URL. If omitted, uses the config file's `rpc_url`.
    #[arg(long, env = "ORACLE_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Override the oracle contract address.
    #[arg(long, env = "ORACLE_CONTRACT")]
    pub contract: Option<String>,

    /// Environment variable name that holds the node's signing key.
    /// Never pass the key itself as a flag or config value.
    #[arg(long, env = "ORACLE_PRIVATE_KEY_ENV", default_value = "ORACLE_PRIVATE_KEY")]
    pub private_key_env: String,

    /// Directory for the persistent Store and single-instance lock.
    #[arg(long, env = "ORACLE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Address the operator HTTP API binds to.
    #[arg(long, env = "ORACLE_API_ADDR", default_value = "127.0.0.1:9400")]
    pub api_addr: String,

    /// Run one ingestion tick and exit (useful for smoke-testing a
    /// deployment before enabling continuous operation).
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    chain_id: u64,
    rpc_url: Option<String>,
    contract: Option<String>,
    start_block: u64,
    #[serde(default = "default_confirmation_depth")]
    confirmation_depth: u64,
    #[serde(default = "default_log_chunk_size")]
    log_chunk_size: u64,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
    #[serde(default)]
    worker_count: Option<usize>,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_receipt_timeout_secs")]
    receipt_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    fetch_timeout_secs: u64,
    #[serde(default = "default_fetch_max_attempts")]
    fetch_max_attempts: u32,
    #[serde(default = "default_mad_k")]
    mad_k: f64,
    #[serde(default)]
    proving_key_dir: Option<PathBuf>,
    #[serde(default)]
    source_indirection: HashMap<String, String>,
    #[serde(default)]
    feeds: Vec<FeedConfig>,
}

fn default_confirmation_depth() -> u64 {
    12
}
fn default_log_chunk_size() -> u64 {
    2000
}
fn default_poll_interval_secs() -> u64 {
    15
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_retries() -> u32 {
    5
}
fn default_receipt_timeout_secs() -> u64 {
    120
}
fn default_fetch_timeout_secs() -> u64 {
    5
}
fn default_fetch_max_attempts() -> u32 {
    4
}
fn default_mad_k() -> f64 {
    3.0
}

/// Fully resolved, validated configuration. Rebuilt fresh on every
/// start from CLI/env/file; never itself persisted.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub contract: Address,
    pub start_block: u64,
    pub confirmation_depth: u64,
    pub log_chunk_size: u64,
    pub poll_interval: Duration,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub receipt_timeout: Duration,
    pub fetch_timeout: Duration,
    pub fetch_max_attempts: u32,
    /// MAD outlier multiplier `k`, expressed as `k_num/k_den` so the
    /// aggregation kernel stays integer-only; the file's `madK` float is
    /// converted once here (e.g. `3.0` -> `3000/1000`).
    pub mad_k_num: i128,
    pub mad_k_den: i128,
    pub proving_key_dir: PathBuf,
    pub source_indirection: HashMap<String, String>,
    pub feeds: Vec<FeedConfig>,
    pub data_dir: PathBuf,
    pub api_addr: String,
    pub once: bool,
    pub private_key_env: String,
}

impl NodeConfig {
    pub fn load(args: Args) -> Result<Self, OracleError> {
        let raw = std::fs::read_to_string(&args.config).map_err(|e| {
            OracleError::Config(format!("reading config file {}: {e}", args.config.display()))
        })?;
        let file: FileConfig = toml::from_str(&raw)
            .map_err(|e| OracleError::Config(format!("parsing config file: {e}")))?;

        let rpc_url = args
            .rpc_url
            .or(file.rpc_url)
            .ok_or_else(|| OracleError::Config("no rpc_url: pass --rpc-url, set ORACLE_RPC_URL, or add rpc_url to the config file".to_string()))?;

        let contract_str = args.contract.or(file.contract).ok_or_else(|| {
            OracleError::Config("no contract address configured".to_string())
        })?;
        let contract = Address::from_str(&contract_str)
            .map_err(|e| OracleError::Config(format!("invalid contract address '{contract_str}': {e}")))?;

        if file.start_block == 0 {
            tracing::warn!("start_block is 0; this will scan from genesis and may be slow");
        }
        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!("rpc_url looks like it may embed an API key; prefer ORACLE_RPC_URL to avoid committing it");
        }

        Ok(Self {
            chain_id: file.chain_id,
            rpc_url,
            contract,
            start_block: file.start_block,
            confirmation_depth: file.confirmation_depth,
            log_chunk_size: file.log_chunk_size.max(1),
            poll_interval: Duration::from_secs(file.poll_interval_secs.max(1)),
            queue_capacity: file.queue_capacity.max(1),
            worker_count: file.worker_count.unwrap_or_else(num_cpus::get).max(1),
            max_retries: file.max_retries,
            receipt_timeout: Duration::from_secs(file.receipt_timeout_secs.max(5)),
            fetch_timeout: Duration::from_secs(file.fetch_timeout_secs.max(1)),
            fetch_max_attempts: file.fetch_max_attempts.max(1),
            mad_k_num: (file.mad_k.max(0.0) * 1000.0).round() as i128,
            mad_k_den: 1000,
            proving_key_dir: file.proving_key_dir.unwrap_or_else(|| PathBuf::from("./keys")),
            source_indirection: file.source_indirection,
            feeds: file.feeds,
            data_dir: args.data_dir,
            api_addr: args.api_addr,
            once: args.once,
            private_key_env: args.private_key_env,
        })
    }

    /// A display form safe to log at startup: the signing key env var
    /// name is shown, never its resolved value.
    pub fn redacted_summary(&self) -> String {
        format!(
            "chain_id={} contract={:#x} start_block={} confirmation_depth={} feeds={} private_key_env={} signing_key=***",
            self.chain_id,
            self.contract,
            self.start_block,
            self.confirmation_depth,
            self.feeds.len(),
            self.private_key_env,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_summary_never_contains_key_material() {
        let cfg = NodeConfig {
            chain_id: 1,
            rpc_url: "https://example.com".to_string(),
            contract: Address::zero(),
            start_block: 0,
            confirmation_depth: 12,
            log_chunk_size: 2000,
            poll_interval: Duration::from_secs(15),
            queue_capacity: 256,
            worker_count: 4,
            max_retries: 5,
            receipt_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(5),
            fetch_max_attempts: 4,
            mad_k_num: 3000,
            mad_k_den: 1000,
            proving_key_dir: PathBuf::from("./keys"),
            source_indirection: HashMap::new(),
            feeds: Vec::new(),
            data_dir: PathBuf::from("./data"),
            api_addr: "127.0.0.1:9400".to_string(),
            once: false,
            private_key_env: "ORACLE_PRIVATE_KEY".to_string(),
        };
        let summary = cfg.redacted_summary();
        assert!(summary.contains("***"));
        assert!(!summary.to_lowercase().contains("0xdeadbeef"));
    }
}
