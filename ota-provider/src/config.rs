//! Provider configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::{TransferParams, TransferRole};
use crate::registry::DEFAULT_MAX_REQUESTORS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Provider-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// `ota_allowed` for requestors seen for the first time
    pub default_allow: bool,
    pub max_requestors: usize,
    /// Advisory retry delay returned with a busy QueryImage; 0 means the
    /// built-in default
    pub delayed_query_action_time_sec: u32,
    /// Delay returned with the next ApplyUpdateResponse
    pub delayed_apply_action_time_sec: u32,
    pub bdx: BdxConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_allow: false,
            max_requestors: DEFAULT_MAX_REQUESTORS,
            delayed_query_action_time_sec: 0,
            delayed_apply_action_time_sec: 0,
            bdx: BdxConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Parameters of the BDX sender session opened for each offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BdxConfig {
    pub block_size: u16,
    pub timeout_sec: u64,
    pub poll_interval_ms: u64,
}

impl Default for BdxConfig {
    fn default() -> Self {
        let params = TransferParams::default();
        Self {
            block_size: params.block_size,
            timeout_sec: params.timeout.as_secs(),
            poll_interval_ms: params.poll_interval.as_millis() as u64,
        }
    }
}

impl BdxConfig {
    pub fn transfer_params(&self) -> TransferParams {
        TransferParams {
            role: TransferRole::Sender,
            block_size: self.block_size,
            timeout: Duration::from_secs(self.timeout_sec),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
