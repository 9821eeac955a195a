use serde::Deserialize;
use std::path::Path;
use tessera_icc::{RingConfig, framed_len};

/// Settings for the relay demo.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Byte ring capacity, power of two.
    #[serde(default = "defaults::spsc_capacity")]
    pub spsc_capacity: usize,
    /// Broadcast ring capacity, power of two.
    #[serde(default = "defaults::broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Fixed ring capacity in elements, power of two.
    #[serde(default = "defaults::fixed_capacity")]
    pub fixed_capacity: usize,
    /// Broadcast readers to spawn.
    #[serde(default = "defaults::consumers")]
    pub consumers: usize,
    /// Messages the producer publishes on each channel.
    #[serde(default = "defaults::messages")]
    pub messages: u64,
    /// Payload bytes per message; the first 8 carry the sequence number.
    #[serde(default = "defaults::payload_len")]
    pub payload_len: usize,
    #[serde(default = "defaults::spin_limit")]
    pub spin_limit: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn spsc_capacity() -> usize {
        1 << 16 // 65536
    }

    pub fn broadcast_capacity() -> usize {
        1 << 16
    }

    pub fn fixed_capacity() -> usize {
        1 << 10
    }

    pub fn consumers() -> usize {
        4
    }

    pub fn messages() -> u64 {
        1_000_000
    }

    pub fn payload_len() -> usize {
        64
    }

    pub fn spin_limit() -> u32 {
        1_000
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            spsc_capacity: defaults::spsc_capacity(),
            broadcast_capacity: defaults::broadcast_capacity(),
            fixed_capacity: defaults::fixed_capacity(),
            consumers: defaults::consumers(),
            messages: defaults::messages(),
            payload_len: defaults::payload_len(),
            spin_limit: defaults::spin_limit(),
        }
    }
}

impl RelayConfig {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    /// Parses and validates a TOML document. Missing keys take their defaults.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let relay_config: RelayConfig = toml::from_str(toml_str)?;
        relay_config.validate()?;
        Ok(relay_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let spsc = ring("spsc_capacity", self.spsc_capacity)?;
        let broadcast = ring("broadcast_capacity", self.broadcast_capacity)?;
        ring("fixed_capacity", self.fixed_capacity)?;

        if self.payload_len < size_of::<u64>() {
            return Err(ConfigError::Invalid {
                field: "payload_len",
                reason: format!("{} is shorter than the 8-byte sequence number", self.payload_len),
            });
        }
        let frame = framed_len(self.payload_len);
        for (field, cfg) in [("spsc_capacity", spsc), ("broadcast_capacity", broadcast)] {
            if frame > cfg.capacity {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} bytes cannot hold a {frame}-byte frame", cfg.capacity),
                });
            }
        }

        if self.consumers == 0 {
            return Err(ConfigError::Invalid {
                field: "consumers",
                reason: "at least one consumer is required".into(),
            });
        }
        if self.messages == 0 {
            return Err(ConfigError::Invalid {
                field: "messages",
                reason: "at least one message is required".into(),
            });
        }
        Ok(())
    }

    pub fn spsc_ring(&self) -> Result<RingConfig, ConfigError> {
        ring("spsc_capacity", self.spsc_capacity)
    }

    pub fn broadcast_ring(&self) -> Result<RingConfig, ConfigError> {
        ring("broadcast_capacity", self.broadcast_capacity)
    }

    pub fn fixed_ring(&self) -> Result<RingConfig, ConfigError> {
        ring("fixed_capacity", self.fixed_capacity)
    }
}

fn ring(field: &'static str, capacity: usize) -> Result<RingConfig, ConfigError> {
    RingConfig::try_new(capacity).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = RelayConfig::parse("").unwrap();
        assert_eq!(cfg, RelayConfig::default());
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.spsc_capacity, 65536);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = RelayConfig::parse(
            r#"
            log_level = "debug"
            broadcast_capacity = 4096
            consumers = 2
            payload_len = 16
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.broadcast_capacity, 4096);
        assert_eq!(cfg.consumers, 2);
        assert_eq!(cfg.payload_len, 16);
        assert_eq!(cfg.spsc_capacity, 65536);
        assert_eq!(cfg.broadcast_ring().unwrap().capacity, 4096);
    }

    #[test]
    fn non_power_of_two_capacity_is_rejected() {
        let err = RelayConfig::parse("spsc_capacity = 1000").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "spsc_capacity",
                ..
            }
        ));
    }

    #[test]
    fn payload_must_fit_in_every_byte_ring() {
        let err = RelayConfig::parse("broadcast_capacity = 64\npayload_len = 57").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "broadcast_capacity",
                ..
            }
        ));
        assert!(RelayConfig::parse("broadcast_capacity = 64\npayload_len = 56").is_ok());
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = RelayConfig::parse("payload_len = 4").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "payload_len",
                ..
            }
        ));
    }

    #[test]
    fn zero_consumers_is_rejected() {
        let err = RelayConfig::parse("consumers = 0").unwrap_err();
        assert!(err.to_string().contains("consumers"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = RelayConfig::parse("consumers = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = RelayConfig::load("/nonexistent/tessera/relay.toml").unwrap_err();
        match err {
            ConfigError::Read { path, .. } => assert_eq!(path, "/nonexistent/tessera/relay.toml"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("tessera-relay-{}.toml", std::process::id()));
        std::fs::write(&path, "messages = 10\nspin_limit = 50\n").unwrap();
        let cfg = RelayConfig::load(path.display().to_string()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.messages, 10);
        assert_eq!(cfg.spin_limit, 50);
    }
}
