//! Connection configuration.
//!
//! [`TransportConfig`] is what the outer CLI or config file hands to a
//! connection. Every field has a default, so a TOML file only needs the
//! values it changes:
//!
//! ```toml
//! fec_redundancy = 0.2
//! congestion_control = "bbrv3"
//! network_profile = "lte"
//!
//! [bbr]
//! loss_threshold = 0.05
//! ```
//!
//! A configuration is validated before any connection opens; every
//! violation is a [`ConfigError`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::congestion::{CongestionAlgorithm, ControllerConfig};
use crate::emulator::{EmulatorConfig, NetworkProfile};
use crate::error::{ConfigError, Result};
use crate::fec::protocol::MAX_PAYLOAD_LEN;
use crate::fec::{DecoderConfig, FecParams};

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Emit redundancy packets. Data packets are framed either way.
    pub fec_enabled: bool,

    /// Redundancy fraction ρ in [0.05, 0.20].
    pub fec_redundancy: f64,

    /// Data packets per group (K).
    pub fec_group_size: u32,

    /// Partial groups are sealed after this long.
    pub fec_flush_timeout_ms: u64,

    /// Receiver-side group lifetime.
    pub fec_retention_ms: u64,

    /// Cadence of the decoder cleanup pass.
    pub cleanup_interval_ms: u64,

    /// One of `cubic`, `bbr`, `bbrv2`, `bbrv3`, `reno`.
    pub congestion_control: String,

    /// Largest application payload per datagram.
    pub segment_size: usize,

    pub emulate_loss: f64,
    pub emulate_dup: f64,
    pub emulate_latency_ms: u64,
    pub emulate_jitter_ms: u64,

    /// Fixed emulator seed; unset means seeded from the clock.
    pub emulator_seed: Option<u64>,

    /// Named preset replacing the `emulate_*` values.
    pub network_profile: Option<String>,

    /// Congestion controller tuning.
    pub bbr: ControllerConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fec_enabled: true,
            fec_redundancy: 0.10,
            fec_group_size: 10,
            fec_flush_timeout_ms: 20,
            fec_retention_ms: 2000,
            cleanup_interval_ms: 1000,
            congestion_control: CongestionAlgorithm::Bbr.to_string(),
            segment_size: 1200,
            emulate_loss: 0.0,
            emulate_dup: 0.0,
            emulate_latency_ms: 0,
            emulate_jitter_ms: 0,
            emulator_seed: None,
            network_profile: None,
            bbr: ControllerConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.fec_params()?;
        self.algorithm()?;
        self.emulator_config()?;

        if self.segment_size == 0 || self.segment_size > MAX_PAYLOAD_LEN {
            return Err(ConfigError::InvalidValue {
                name: "segment_size",
                reason: format!("must be in 1..={}", MAX_PAYLOAD_LEN),
            });
        }
        for (name, value) in [
            ("fec_flush_timeout_ms", self.fec_flush_timeout_ms),
            ("fec_retention_ms", self.fec_retention_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    reason: "must be positive".to_string(),
                });
            }
        }
        self.controller_config().validate()
    }

    pub fn algorithm(&self) -> std::result::Result<CongestionAlgorithm, ConfigError> {
        self.congestion_control.parse()
    }

    pub fn profile(&self) -> std::result::Result<Option<NetworkProfile>, ConfigError> {
        self.network_profile.as_deref().map(str::parse::<NetworkProfile>).transpose()
    }

    pub fn fec_params(&self) -> std::result::Result<FecParams, ConfigError> {
        let group_size = u8::try_from(self.fec_group_size)
            .map_err(|_| ConfigError::InvalidGroupSize(self.fec_group_size))?;
        FecParams::new(group_size, self.fec_redundancy)
    }

    pub fn decoder_config(&self) -> std::result::Result<DecoderConfig, ConfigError> {
        Ok(DecoderConfig {
            retention: self.retention(),
            redundancy: self.fec_enabled,
            ..DecoderConfig::for_params(&self.fec_params()?)
        })
    }

    /// Emulator settings; a network profile overrides the `emulate_*` values.
    pub fn emulator_config(&self) -> std::result::Result<EmulatorConfig, ConfigError> {
        let config = match self.profile()? {
            Some(profile) => profile.emulator_config(self.emulator_seed),
            None => EmulatorConfig {
                loss: self.emulate_loss,
                duplicate: self.emulate_dup,
                latency: Duration::from_millis(self.emulate_latency_ms),
                jitter: Duration::from_millis(self.emulate_jitter_ms),
                seed: self.emulator_seed,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Controller tuning with the connection's segment size.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            segment_size: self.segment_size as u64,
            ..self.bbr.clone()
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.fec_flush_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.fec_retention_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.algorithm().unwrap(), CongestionAlgorithm::Bbr);
        assert_eq!(config.fec_params().unwrap().repair_count(), 1);
        assert!(config.emulator_config().unwrap().is_passthrough());
    }

    #[test]
    fn test_partial_toml() {
        let config = TransportConfig::from_toml_str(
            r#"
            fec_redundancy = 0.2
            congestion_control = "bbrv3"
            emulate_loss = 0.05
            emulator_seed = 7

            [bbr]
            loss_threshold = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.fec_redundancy, 0.2);
        assert_eq!(config.fec_group_size, 10);
        assert_eq!(config.fec_params().unwrap().repair_count(), 2);
        assert_eq!(config.algorithm().unwrap(), CongestionAlgorithm::Bbrv3);
        assert_eq!(config.bbr.loss_threshold, 0.05);
        assert_eq!(config.bbr.loss_beta, 0.7);

        let emulator = config.emulator_config().unwrap();
        assert_eq!(emulator.loss, 0.05);
        assert_eq!(emulator.seed, Some(7));
    }

    #[test]
    fn test_rejects_bad_redundancy() {
        for rho in [0.0, 0.04, 0.21, 1.0] {
            let config = TransportConfig {
                fec_redundancy: rho,
                ..Default::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::RedundancyOutOfRange(rho)));
        }
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let err = TransportConfig::from_toml_str("congestion_control = \"vegas\"").unwrap_err();
        assert_eq!(err, ConfigError::UnknownAlgorithm("vegas".to_string()));
    }

    #[test]
    fn test_rejects_bad_group_size() {
        let config = TransportConfig {
            fec_group_size: 300,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidGroupSize(300)));

        let config = TransportConfig {
            fec_group_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidGroupSize(0)));
    }

    #[test]
    fn test_rejects_bad_emulation() {
        let config = TransportConfig {
            emulate_loss: 0.8,
            emulate_dup: 0.3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ProbabilitySumExceeded { .. })
        ));

        let config = TransportConfig {
            network_profile: Some("carrier-pigeon".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProfile(_))));
    }

    #[test]
    fn test_profile_overrides_emulation() {
        let config = TransportConfig {
            emulate_loss: 0.5,
            network_profile: Some("satellite".to_string()),
            emulator_seed: Some(1),
            ..Default::default()
        };
        let emulator = config.emulator_config().unwrap();
        assert_eq!(emulator.loss, NetworkProfile::Satellite.loss());
        assert_eq!(emulator.latency, Duration::from_millis(600));
        assert_eq!(emulator.seed, Some(1));
    }

    #[test]
    fn test_parse_error() {
        let err = TransportConfig::from_toml_str("fec_enabled = \"yes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TransportConfig {
            congestion_control: "cubic".to_string(),
            network_profile: Some("wifi".to_string()),
            emulator_seed: Some(99),
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(TransportConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_json_snapshot_of_config() {
        let json = serde_json::to_value(TransportConfig::default()).unwrap();
        assert_eq!(json["congestion_control"], "bbr");
        assert_eq!(json["fec_group_size"], 10);
        assert_eq!(json["bbr"]["fast_window_rounds"], 2);
    }

    #[test]
    fn test_controller_uses_segment_size() {
        let config = TransportConfig {
            segment_size: 1400,
            ..Default::default()
        };
        assert_eq!(config.controller_config().segment_size, 1400);
        assert_eq!(config.controller_config().initial_cwnd(), 14_000);
    }

    #[test]
    fn test_decoder_follows_fec_switch() {
        let config = TransportConfig {
            fec_enabled: false,
            fec_retention_ms: 750,
            ..Default::default()
        };
        let decoder = config.decoder_config().unwrap();
        assert!(!decoder.redundancy);
        assert_eq!(decoder.retention, Duration::from_millis(750));
        assert!(TransportConfig::default().decoder_config().unwrap().redundancy);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("quicfec-config-{}.toml", std::process::id()));
        std::fs::write(&path, "fec_group_size = 20\n").unwrap();
        let config = TransportConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.fec_group_size, 20);
        assert_eq!(config.decoder_config().unwrap().group_size, 20);

        assert!(matches!(
            TransportConfig::load("/nonexistent/quicfec.toml"),
            Err(crate::error::Error::Io(_))
        ));
    }
}
