//! Prediction options read from TOML.
//!
//! Every field is optional in the file; missing fields take the defaults of
//! `PredictionRequest`. A minimal config might look like:
//!
//! ```toml
//! method = "sample"
//! draws = 200
//! prediction_type = "response"
//! ncpu = 4
//! ```

use crate::orchestrate::{PredictionRequest, PredictionType};
use crate::params::Method;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictionConfig {
    pub method: Method,
    pub draws: usize,
    pub prediction_type: PredictionType,
    pub include_fixed: bool,
    pub include_spatial: bool,
    pub fixed_subset: Option<Vec<String>>,
    pub ncpu: usize,
    pub seed: u64,
    pub coordinate_columns: Vec<String>,
    /// Probability mass of the reported credible interval.
    pub interval: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        let request = PredictionRequest::default();
        Self {
            method: request.method,
            draws: request.n_draws,
            prediction_type: request.prediction_type,
            include_fixed: request.include_fixed,
            include_spatial: request.include_spatial,
            fixed_subset: request.fixed_subset,
            ncpu: request.ncpu,
            seed: request.seed,
            coordinate_columns: request.coordinate_columns,
            interval: 0.95,
        }
    }
}

impl PredictionConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        log::debug!("Loaded prediction config from '{path}': {config:?}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpu == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ncpu",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.method == Method::Sample && self.draws == 0 {
            return Err(ConfigError::InvalidValue {
                field: "draws",
                reason: "sampling needs at least one draw".to_string(),
            });
        }
        if !(self.interval > 0.0 && self.interval < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "interval",
                reason: format!("{} is not in (0, 1)", self.interval),
            });
        }
        if self.coordinate_columns.len() != 2 {
            return Err(ConfigError::InvalidValue {
                field: "coordinate_columns",
                reason: format!("expected two names, got {}", self.coordinate_columns.len()),
            });
        }
        Ok(())
    }

    pub fn to_request(&self) -> PredictionRequest {
        PredictionRequest {
            coordinate_columns: self.coordinate_columns.clone(),
            method: self.method,
            n_draws: self.draws,
            prediction_type: self.prediction_type,
            include_fixed: self.include_fixed,
            include_spatial: self.include_spatial,
            fixed_subset: self.fixed_subset.clone(),
            ncpu: self.ncpu,
            seed: self.seed,
        }
    }
}
