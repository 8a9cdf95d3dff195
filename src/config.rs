//! Configuration Module
//!
//! Runtime tunables for a [`crate::Pipeline`]: channel capacities and the
//! default drain timeout. This is deliberately small — the engine's topology
//! is built in code (`chain`/`fan_out`/`fan_in`/`connect_n_to_m`), not
//! declared in a config file, so there is no stage catalogue to load here.

use serde::Deserialize;
use std::time::Duration;

/// Default bound for every stage-to-stage channel created by the pipeline.
const fn default_channel_capacity() -> usize {
    256
}

/// Tunables for a [`crate::Pipeline`].
///
/// # Example
///
/// ```toml
/// channel_capacity = 512
/// default_timeout_ms = 5000
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bound applied to every inbound/outbound/merge queue the pipeline creates.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Default duration used by callers that want a timeout without picking
    /// one explicitly. `wait_with_timeout` always takes its own duration
    /// argument; this is only a convenience for callers building one from config.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            default_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Returns [`Self::default_timeout_ms`] as a [`Duration`], if set.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Loads a [`PipelineConfig`] from a TOML file.
///
/// Mirrors the pattern used elsewhere for loading engine configuration: read
/// the file, parse it as TOML, and let `serde`'s `#[serde(default = ...)]`
/// annotations fill in anything the caller omitted.
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Loads a [`PipelineConfig`] from a TOML string, useful for tests and
/// embedding configuration in a binary rather than a file on disk.
pub fn load_config_from_str(content: &str) -> anyhow::Result<PipelineConfig> {
    let config: PipelineConfig = toml::from_str(content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.channel_capacity, default_channel_capacity());
        assert_eq!(config.default_timeout_ms, None);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load_config_from_str("channel_capacity = 16\ndefault_timeout_ms = 250").unwrap();
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(250)));
    }
}
