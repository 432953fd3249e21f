//! Engine configuration.
//!
//! [`SimConfig`] is plain serde data with defaults for every field, so a
//! partial TOML document (behind the `config-toml` feature) only needs to
//! name what it overrides.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::resource::Time;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("iterations must be at least 1")]
    ZeroIterations,
    #[error("timestep must be positive, got {0}")]
    NonPositiveTimestep(Decimal),
    #[error("tolerance must not be negative, got {0}")]
    NegativeTolerance(Decimal),
    #[cfg(feature = "config-toml")]
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Micro-iterations per macro tick (K). Scenarios whose dependency
    /// chains are longer than K see values from earlier iterations.
    pub iterations: u32,
    /// Macro tick duration (Δ).
    pub timestep: Time,
    /// Verify per-node flow conservation before each commit.
    pub check_conservation: bool,
    /// Verify sent/received symmetry between every linked pair.
    pub check_exchange: bool,
    /// Largest mismatch the checks accept. Zero means exact.
    pub tolerance: Decimal,
    /// Diagnostics kept in the log before the oldest are dropped.
    pub diagnostic_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            iterations: 6,
            timestep: Decimal::ONE,
            check_conservation: true,
            check_exchange: true,
            tolerance: Decimal::ZERO,
            diagnostic_capacity: 1024,
        }
    }
}

impl SimConfig {
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_timestep(mut self, timestep: Time) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn with_checks(mut self, conservation: bool, exchange: bool) -> Self {
        self.check_conservation = conservation;
        self.check_exchange = exchange;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.timestep <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveTimestep(self.timestep));
        }
        if self.tolerance < Decimal::ZERO {
            return Err(ConfigError::NegativeTolerance(self.tolerance));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    #[cfg(feature = "config-toml")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
