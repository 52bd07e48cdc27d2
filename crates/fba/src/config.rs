//! Declarative quorum configuration.
//!
//! Hosts describe their trust topology with a percentage threshold and
//! hex-encoded validator keys, typically deserialized from a config
//! file. [`quorum_set_from_config`] turns that description into a
//! validated [`QuorumSet`]; any failure here is fatal at load time,
//! before a single slot exists.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::quorum::{check_sanity, get_all_nodes};
use crate::types::{NodeId, QuorumSet};

/// A quorum set as written in host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSetConfig {
    /// Percentage of entries that must agree, 1..=100.
    pub threshold_percent: u32,
    /// Hex-encoded 32-byte validator keys.
    pub validators: Vec<String>,
    /// Nested sets, each weighted as one entry.
    #[serde(default)]
    pub inner_sets: Vec<QuorumSetConfig>,
}

/// Configuration problems that prevent safe consensus. Fatal at load.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A validator key is not a 64-character hex string.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The derived threshold does not fit the entry count.
    #[error("threshold {threshold} invalid for {entry_count} entries")]
    InvalidThreshold { threshold: u32, entry_count: usize },

    /// The assembled quorum set fails structural validation.
    #[error("invalid quorum set structure: {0}")]
    InvalidStructure(String),
}

/// Parse a hex-encoded node id.
pub fn parse_node_id(key: &str) -> Result<NodeId, ConfigError> {
    let key = key.trim();
    let bytes = hex::decode(key).map_err(|_| ConfigError::InvalidPublicKey(key.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidPublicKey(key.to_string()))?;
    Ok(NodeId(arr))
}

/// Build a [`QuorumSet`] from configuration.
///
/// The absolute threshold is `max(1, percent * entries / 100)`.
pub fn quorum_set_from_config(config: &QuorumSetConfig) -> Result<QuorumSet, ConfigError> {
    let qset = assemble(config)?;
    check_sanity(&qset, false).map_err(|e| ConfigError::InvalidStructure(e.to_string()))?;
    Ok(qset)
}

fn assemble(config: &QuorumSetConfig) -> Result<QuorumSet, ConfigError> {
    let mut validators = Vec::with_capacity(config.validators.len());
    for key in &config.validators {
        validators.push(parse_node_id(key)?);
    }

    let mut inner_sets = Vec::with_capacity(config.inner_sets.len());
    for inner in &config.inner_sets {
        inner_sets.push(assemble(inner)?);
    }

    let total = validators.len() + inner_sets.len();
    if config.threshold_percent == 0 || config.threshold_percent > 100 {
        return Err(ConfigError::InvalidThreshold {
            threshold: config.threshold_percent,
            entry_count: total,
        });
    }
    let threshold = if total == 0 {
        0
    } else {
        ((config.threshold_percent as usize * total) / 100).max(1) as u32
    };
    if threshold as usize > total {
        return Err(ConfigError::InvalidThreshold {
            threshold,
            entry_count: total,
        });
    }

    Ok(QuorumSet::new(threshold, validators, inner_sets))
}

/// Validate a configuration and log advisory warnings.
///
/// Errors are the same as [`quorum_set_from_config`]; warnings flag
/// thresholds that are legal but fragile.
pub fn validate_config(config: &QuorumSetConfig) -> Result<(), ConfigError> {
    let qset = quorum_set_from_config(config)?;

    if config.threshold_percent < 51 {
        warn!(
            threshold_percent = config.threshold_percent,
            "quorum threshold below 51%, quorum intersection is not guaranteed"
        );
    }
    if config.threshold_percent == 100 && !get_all_nodes(&qset).is_empty() {
        warn!("quorum threshold at 100%, a single unavailable validator halts consensus");
    }

    Ok(())
}
