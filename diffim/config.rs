use crate::detection::ThresholdType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Settings for kernel fitting and footprint selection.
///
/// Every field is required; a TOML document missing any of them fails to parse. Keys
/// use the camel-case policy names (`kernelCols`, `fpNpixMin`, `detThresholdType`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PsfMatchConfig {
    /// Kernel width in pixels.
    pub kernel_cols: usize,
    /// Kernel height in pixels.
    pub kernel_rows: usize,
    /// Smallest footprint the detector should return.
    pub fp_npix_min: usize,
    /// Footprints with more pixels than this are rejected.
    pub fp_npix_max: usize,
    /// Footprints grow by this multiple of the larger kernel dimension.
    pub fp_grow_ksize: f64,
    /// Number of clean footprints that ends the threshold search.
    pub min_clean_fp: usize,
    /// Starting detection threshold.
    pub det_threshold: f64,
    /// Factor applied to the threshold after every unsuccessful pass.
    pub det_threshold_scaling: f64,
    /// The search stops once the threshold is no longer above this floor.
    pub det_threshold_min: f64,
    pub det_threshold_type: ThresholdType,
}

/// Largest footprint growth, in pixels, a config may ask for.
pub const MAX_GROW_PIXELS: usize = 1 << 15;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl PsfMatchConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel_cols == 0 {
            return Err(invalid("kernelCols", "must be positive"));
        }
        if self.kernel_rows == 0 {
            return Err(invalid("kernelRows", "must be positive"));
        }
        if self.fp_npix_min > self.fp_npix_max {
            return Err(invalid(
                "fpNpixMin",
                format!(
                    "{} exceeds fpNpixMax ({})",
                    self.fp_npix_min, self.fp_npix_max
                ),
            ));
        }
        if !(self.fp_grow_ksize.is_finite() && self.fp_grow_ksize >= 0.0) {
            return Err(invalid(
                "fpGrowKsize",
                format!("must be finite and non-negative, got {}", self.fp_grow_ksize),
            ));
        }
        let grow = self.fp_grow_ksize * self.kernel_cols.max(self.kernel_rows) as f64;
        if grow > MAX_GROW_PIXELS as f64 {
            return Err(invalid(
                "fpGrowKsize",
                format!("grows footprints by {grow} pixels, more than {MAX_GROW_PIXELS}"),
            ));
        }
        if self.min_clean_fp == 0 {
            return Err(invalid("minCleanFp", "must be at least 1"));
        }
        if !self.det_threshold.is_finite() {
            return Err(invalid(
                "detThreshold",
                format!("must be finite, got {}", self.det_threshold),
            ));
        }
        if !self.det_threshold_min.is_finite() {
            return Err(invalid(
                "detThresholdMin",
                format!("must be finite, got {}", self.det_threshold_min),
            ));
        }
        if !(self.det_threshold_scaling > 0.0 && self.det_threshold_scaling < 1.0) {
            return Err(invalid(
                "detThresholdScaling",
                format!("must lie in (0, 1), got {}", self.det_threshold_scaling),
            ));
        }
        Ok(())
    }

    /// Pixels each footprint grows by: `fpGrowKsize * max(kernelCols, kernelRows)`,
    /// truncated.
    pub fn grow_pixels(&self) -> usize {
        let kernel_size = self.kernel_cols.max(self.kernel_rows) as f64;
        (self.fp_grow_ksize * kernel_size) as usize
    }
}
