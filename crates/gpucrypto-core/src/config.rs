//! Device context configuration.
//!
//! Configuration can be built in code or loaded from a TOML file with
//! `GPUCRYPTO__`-prefixed environment overrides:
//!
//! ```toml
//! stream_count = 4
//! capacity_per_stream = 1048576
//!
//! [poll]
//! spin_limit = 64
//! yield_threshold = 128
//! ```
//!
//! `GPUCRYPTO__STREAM_COUNT=8` overrides the stream count.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::context::MAX_STREAM;
use crate::error::{DeviceError, Result};
use crate::poll::PollPolicy;

const ENV_PREFIX: &str = "GPUCRYPTO";

/// Configuration for a device context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Dedicated streams to create (0 uses the default stream only).
    #[serde(default = "default_stream_count")]
    pub stream_count: usize,
    /// Device memory reserved per stream, in bytes.
    #[serde(default = "default_capacity_per_stream")]
    pub capacity_per_stream: usize,
    /// Pacing of blocking sync.
    #[serde(default)]
    pub poll: PollPolicy,
}

fn default_stream_count() -> usize {
    4
}

fn default_capacity_per_stream() -> usize {
    1024 * 1024
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stream_count: default_stream_count(),
            capacity_per_stream: default_capacity_per_stream(),
            poll: PollPolicy::default(),
        }
    }
}

impl DeviceConfig {
    /// Starts a builder from the defaults.
    #[must_use]
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::new()
    }

    /// Default stream only.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            stream_count: 0,
            ..Self::default()
        }
    }

    /// Every stream slot, larger buffers, spin-only polling.
    #[must_use]
    pub fn performance() -> Self {
        Self {
            stream_count: MAX_STREAM,
            capacity_per_stream: 16 * 1024 * 1024,
            poll: PollPolicy::spin_only(),
        }
    }

    /// Checks limits without touching the device.
    pub fn validate(&self) -> Result<()> {
        if self.stream_count > MAX_STREAM {
            return Err(DeviceError::TooManyStreams {
                requested: self.stream_count,
                max: MAX_STREAM,
            });
        }
        if self.capacity_per_stream == 0 {
            return Err(DeviceError::InvalidConfig(
                "capacity_per_stream must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads and validates a configuration file (format from its extension).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::finish(builder.build())
    }

    /// Loads and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::finish(builder.build())
    }

    fn finish(built: std::result::Result<Config, config::ConfigError>) -> Result<Self> {
        let config: Self = built
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DeviceError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Loads a device configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DeviceConfig> {
    DeviceConfig::load(path)
}

/// Builder for DeviceConfig.
#[derive(Debug, Default)]
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}

impl DeviceConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of dedicated streams.
    #[must_use]
    pub fn with_streams(mut self, count: usize) -> Self {
        self.config.stream_count = count;
        self
    }

    /// Sets the device memory reserved per stream.
    #[must_use]
    pub fn with_capacity_per_stream(mut self, bytes: usize) -> Self {
        self.config.capacity_per_stream = bytes;
        self
    }

    /// Sets the poll policy.
    #[must_use]
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.config.poll = poll;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<DeviceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
