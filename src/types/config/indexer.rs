use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::types::config::rpc::{MulticallSettings, RpcSettings};
use crate::types::config::stream::StreamSettings;

/// Top-level indexer configuration, read from an optional JSON file.
///
/// Every section has defaults so an empty object is a valid config; CLI
/// flags override individual values after loading.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Expected chain id; checked against the provider before syncing.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub multicall: MulticallSettings,
    /// Non-standard method returning all receipts of a block in one call,
    /// e.g. `eth_getBlockReceipts`.
    #[serde(default)]
    pub block_receipts_method: Option<String>,
    #[serde(default = "default_native_token_symbol")]
    pub native_token_symbol: String,
    #[serde(default)]
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_native_token_symbol() -> String {
    "ETH".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_max_page_size() -> u32 {
    100
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: None,
            rpc: RpcSettings::default(),
            stream: StreamSettings::default(),
            multicall: MulticallSettings::default(),
            block_receipts_method: None,
            native_token_symbol: default_native_token_symbol(),
            api: ApiSettings::default(),
        }
    }
}

impl IndexerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load `path` if given, otherwise the default location when it exists,
    /// otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new("config/config.json");
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}
