//! Pipeline configuration.
//!
//! Every statistical threshold used by the pipelines lives here so that it can be tuned per
//! site from a TOML file instead of being baked into the algorithms. All sections default to
//! the values the production pipelines have always used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "uph-clean.toml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub outlier: OutlierConfig,
    pub logview: LogviewConfig,
    pub rollup: RollupConfig,
    pub rounding: RoundingConfig,
    pub aliases: AliasConfig,
    pub reference: ReferenceConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Iterative Z-score/IQR trimming of throughput groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutlierConfig {
    /// Groups smaller than this are passed through untouched.
    pub min_group_size: usize,
    pub max_iterations: usize,
    /// Symmetric z-score bound (population standard deviation).
    pub z_threshold: f64,
    /// Tukey fence multiplier.
    pub iqr_factor: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            min_group_size: 15,
            max_iterations: 20,
            z_threshold: 3.0,
            iqr_factor: 1.5,
        }
    }
}

/// Machine-log reconstruction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogviewConfig {
    pub cycle_start_step: String,
    pub cycle_confirm_step: String,
    /// 1-based value slot of the confirm event holding the raw speed.
    pub speed_slot: usize,
    pub speed_raw_divisor: f64,
    pub speed_units_per_inch: f64,
    pub error_steps: Vec<String>,
    pub frame_prefixes: Vec<String>,
    /// Durations above this many seconds are discarded.
    pub max_duration_secs: f64,
    pub iqr_factor: f64,
    pub z_threshold: f64,
    /// Absolute floor a duration must differ by before it can be flagged.
    pub min_diff_seconds: f64,
    pub min_clean_samples: usize,
}

impl Default for LogviewConfig {
    fn default() -> Self {
        Self {
            cycle_start_step: "PRO".to_string(),
            cycle_confirm_step: "CUC".to_string(),
            speed_slot: 5,
            speed_raw_divisor: 10.0,
            speed_units_per_inch: 25.4,
            error_steps: ["ERRSET", "ERRRCV", "ERRCLR", "DMC", "DMW"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            frame_prefixes: [
                "FU", "FR", "FA", "FW", "FN", "FJ", "F1", "F2", "F3", "F4", "F5", "F6", "F7",
                "F8", "F9", "F0",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_duration_secs: 86_400.0,
            iqr_factor: 1.0,
            z_threshold: 2.0,
            min_diff_seconds: 90.0,
            min_clean_samples: 5,
        }
    }
}

/// Cross-file roll-up of per-frame timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollupConfig {
    pub iqr_factor: f64,
    /// Groups with fewer values than this are averaged without trimming.
    pub min_values_for_trim: usize,
    /// Number of leading frame-id characters forming the frame stock code.
    pub frame_stock_len: usize,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            iqr_factor: 1.5,
            min_values_for_trim: 2,
            frame_stock_len: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoundingConfig {
    pub throughput: u32,
    pub efficiency: u32,
    pub duration: u32,
}

impl Default for RoundingConfig {
    fn default() -> Self {
        Self {
            throughput: 3,
            efficiency: 2,
            duration: 2,
        }
    }
}

/// Alias tables used to normalize machine models and option codes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AliasConfig {
    /// Any model containing one of these tokens collapses to the token.
    pub machine_families: Vec<String>,
    pub option_codes: BTreeMap<String, String>,
}

impl Default for AliasConfig {
    fn default() -> Self {
        let mut option_codes = BTreeMap::new();
        option_codes.insert("L/B-ROV-CU".to_string(), "W/B-ROV-CU".to_string());
        option_codes.insert("L/B-ROVING".to_string(), "W/B-ROV".to_string());
        Self {
            machine_families: vec![
                "WB3100".to_string(),
                "WB3200".to_string(),
                "WB3300".to_string(),
            ],
            option_codes,
        }
    }
}

/// Location of the read-only reference tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReferenceConfig {
    pub dir: PathBuf,
    pub wire_file: String,
    pub device_file: String,
    pub frame_stock_file: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data_MAP"),
            wire_file: "Book6_Wire Data.xlsx".to_string(),
            device_file: "Part bom pkg.xlsx".to_string(),
            frame_stock_file: "export package and frame stock.xlsx".to_string(),
        }
    }
}

impl ReferenceConfig {
    pub fn wire_path(&self) -> PathBuf {
        self.dir.join(&self.wire_file)
    }

    pub fn device_path(&self) -> PathBuf {
        self.dir.join(&self.device_file)
    }

    pub fn frame_stock_path(&self) -> PathBuf {
        self.dir.join(&self.frame_stock_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("temp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Use `uph-clean.toml` from the working directory when present, defaults otherwise.
    pub fn discover() -> Result<Self, ConfigError> {
        let path = Path::new(DEFAULT_CONFIG_FILE);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.outlier;
        if o.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "outlier.max_iterations must be at least 1".to_string(),
            ));
        }
        if o.z_threshold <= 0.0 || o.iqr_factor < 0.0 {
            return Err(ConfigError::Invalid(
                "outlier thresholds must be positive".to_string(),
            ));
        }

        let l = &self.logview;
        if l.speed_slot == 0 {
            return Err(ConfigError::Invalid(
                "logview.speed_slot is 1-based".to_string(),
            ));
        }
        if l.speed_raw_divisor == 0.0 || l.speed_units_per_inch == 0.0 {
            return Err(ConfigError::Invalid(
                "logview speed divisors must be non-zero".to_string(),
            ));
        }
        if l.iqr_factor < 0.0 || l.z_threshold <= 0.0 || l.min_diff_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "logview thresholds must be positive".to_string(),
            ));
        }
        if l.max_duration_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "logview.max_duration_secs must be positive".to_string(),
            ));
        }

        if self.rollup.frame_stock_len == 0 || self.rollup.iqr_factor < 0.0 {
            return Err(ConfigError::Invalid(
                "rollup settings out of range".to_string(),
            ));
        }
        Ok(())
    }
}
