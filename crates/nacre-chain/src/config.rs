//! Engine configuration.

use nacre_currency::params;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of one chain-state instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Data directory; the block database lives in `blockchain/` below it.
    pub data_dir: PathBuf,
    /// Run against the test network.
    #[serde(default)]
    pub testnet: bool,
    /// Verify proof of work outside the checkpoint zone.
    #[serde(default = "default_check_pow")]
    pub check_pow: bool,
    /// Transaction pool byte budget.
    #[serde(default = "default_pool_byte_cap")]
    pub pool_byte_cap: usize,
}

fn default_check_pow() -> bool {
    true
}

fn default_pool_byte_cap() -> usize {
    params::MAX_POOL_SIZE
}

impl ChainConfig {
    /// Config rooted at `data_dir` with everything else at defaults.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            testnet: false,
            check_pow: default_check_pow(),
            pool_byte_cap: default_pool_byte_cap(),
        }
    }
}
