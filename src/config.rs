//! Configuration for the Anvil node.
//!
//! Protocol constants ship with the defaults from the wire contract and can
//! be overridden by an optional `anvil.toml` in the data directory. CLI
//! arguments override nothing here; they only name the node, its port and
//! its public URL. If the file is absent or unreadable, defaults apply.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::effectiveness::EffectivenessParams;

/// Protocol constants, all overridable per node.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    /// Block cadence, seconds.
    pub epoch_duration_secs: u64,
    /// Follower patience before demanding a new leader, seconds.
    pub view_change_timeout_secs: u64,
    /// Peer refresh cadence, seconds.
    pub gossip_interval_secs: u64,
    /// Peer eviction threshold, seconds.
    pub heartbeat_timeout_secs: u64,
    /// Challenge protocol deadline, seconds.
    pub challenge_timeout_secs: u64,
    /// Transport timeout for HTTP calls, seconds.
    pub transport_timeout_secs: u64,
    /// Commit threshold as a fraction of the known validator set.
    pub quorum_fraction: f64,
    /// Challenges issued per epoch.
    pub challenges_per_epoch: usize,
    /// Reward pool minted per epoch.
    pub reward_per_epoch: u64,
    /// Debit applied to an equivocating leader.
    pub slash_amount: u64,
    /// Effectiveness ramp time constant, days.
    pub ramp_constant_days: f64,
    /// Effectiveness decay time constant, days.
    pub decay_constant_days: f64,
    /// Probability of fetching a longer chain seen in gossip.
    pub chain_fetch_probability: f64,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        ProtocolParams {
            epoch_duration_secs: 10,
            view_change_timeout_secs: 8,
            gossip_interval_secs: 3,
            heartbeat_timeout_secs: 60,
            challenge_timeout_secs: 4,
            transport_timeout_secs: 10,
            quorum_fraction: 2.0 / 3.0,
            challenges_per_epoch: 2,
            reward_per_epoch: 100,
            slash_amount: 500,
            ramp_constant_days: 40.0,
            decay_constant_days: 7.0,
            chain_fetch_probability: 0.1,
        }
    }
}

impl ProtocolParams {
    pub fn epoch_duration(&self) -> Duration {
        Duration::from_secs(self.epoch_duration_secs)
    }

    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_secs(self.view_change_timeout_secs)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    pub fn effectiveness(&self) -> EffectivenessParams {
        EffectivenessParams {
            ramp_days: self.ramp_constant_days,
            decay_days: self.decay_constant_days,
        }
    }
}

/// Top-level `anvil.toml` contents.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnvilConfig {
    pub protocol: ProtocolParams,
}

impl AnvilConfig {
    /// Load configuration from `anvil.toml` in the data directory, falling
    /// back to defaults when missing or unparsable.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("anvil.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %config_path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %config_path.display(), error = %e, "bad config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_table() {
        let params = ProtocolParams::default();
        assert_eq!(params.epoch_duration_secs, 10);
        assert_eq!(params.view_change_timeout_secs, 8);
        assert_eq!(params.gossip_interval_secs, 3);
        assert_eq!(params.heartbeat_timeout_secs, 60);
        assert_eq!(params.challenges_per_epoch, 2);
        assert_eq!(params.reward_per_epoch, 100);
        assert_eq!(params.slash_amount, 500);
        assert!((params.quorum_fraction - 2.0 / 3.0).abs() < 1e-12);
        assert!((params.ramp_constant_days - 40.0).abs() < 1e-12);
        assert!((params.decay_constant_days - 7.0).abs() < 1e-12);
    }

    #[test]
    fn toml_overrides_subset() {
        let config: AnvilConfig = toml::from_str(
            r#"
[protocol]
epoch_duration_secs = 2
reward_per_epoch = 50
"#,
        )
        .unwrap();
        assert_eq!(config.protocol.epoch_duration_secs, 2);
        assert_eq!(config.protocol.reward_per_epoch, 50);
        // Untouched fields keep defaults
        assert_eq!(config.protocol.slash_amount, 500);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnvilConfig::load(dir.path());
        assert_eq!(config.protocol.epoch_duration_secs, 10);
    }

    #[test]
    fn unparsable_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("anvil.toml"), "!!!").unwrap();
        let config = AnvilConfig::load(dir.path());
        assert_eq!(config.protocol.reward_per_epoch, 100);
    }
}
