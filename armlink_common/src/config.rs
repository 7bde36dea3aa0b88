//! Configuration loading traits and types.
//!
//! Every armlink binary reads one TOML file. Sections and fields are all
//! optional; omitted values fall back to the constants in [`crate::consts`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use armlink_common::config::{ArmConfig, ConfigError, ConfigLoader};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ArmConfig::load(Path::new("armlink.toml"))?;
//!     config.validate()?;
//!     println!("Bus on {}", config.bus.port);
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
    DEFAULT_BAUDRATE, DEFAULT_CALIBRATION_FILE, DEFAULT_HISTORY_CAPACITY,
    DEFAULT_MIN_COMMAND_GAP_MS, DEFAULT_READ_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS,
    DEFAULT_SAMPLE_PERIOD_MS, DEFAULT_TIMEOUT_MS, DEFAULT_WRITE_SETTLE_MS, NUM_SERVOS,
    SERVICE_NAME, SERVO_IDS, servo_index,
};

/// Set of servo IDs, at most one per joint.
pub type ServoIdSet = heapless::Vec<u8, NUM_SERVOS>;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, per-frame tracing.
    Trace,
    /// Retries and bus traffic summaries.
    Debug,
    /// Lifecycle events.
    #[default]
    Info,
    /// Fallbacks and degraded operation.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn default_service_name() -> String {
    SERVICE_NAME.to_string()
}

/// Common configuration fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "armlink-bench-01"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Defaults ───────────────────────────────────────────────────────

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_servo_ids() -> ServoIdSet {
    SERVO_IDS.iter().copied().collect()
}

fn default_min_command_gap_ms() -> u64 {
    DEFAULT_MIN_COMMAND_GAP_MS
}

fn default_write_settle_ms() -> u64 {
    DEFAULT_WRITE_SETTLE_MS
}

fn default_read_attempts() -> u32 {
    DEFAULT_READ_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_sample_period_ms() -> u64 {
    DEFAULT_SAMPLE_PERIOD_MS
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_output() -> PathBuf {
    PathBuf::from(DEFAULT_CALIBRATION_FILE)
}

// ─── Sections ───────────────────────────────────────────────────────

/// Serial bus settings. Two requests for the same port conflict when
/// `port`, `baudrate` or `timeout_ms` differ; `servo_ids` is role-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial device path.
    #[serde(default = "default_port")]
    pub port: String,

    /// Line rate in bits per second.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Per-read timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Servos this caller drives. Handed back by the registry handle;
    /// the shared controller itself always addresses all six.
    #[serde(default = "default_servo_ids")]
    pub servo_ids: ServoIdSet,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baudrate: default_baudrate(),
            timeout_ms: default_timeout_ms(),
            servo_ids: default_servo_ids(),
        }
    }
}

impl BusConfig {
    /// Bus settings for `port` with every other field defaulted.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Read timeout.
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// True when both configs may share one bus.
    pub fn is_compatible(&self, other: &BusConfig) -> bool {
        self.port == other.port
            && self.baudrate == other.baudrate
            && self.timeout_ms == other.timeout_ms
    }

    /// Validate the bus section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.port cannot be empty".to_string(),
            ));
        }
        if self.baudrate == 0 {
            return Err(ConfigError::ValidationError(
                "bus.baudrate must be greater than 0".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus.timeout_ms must be greater than 0".to_string(),
            ));
        }
        validate_servo_ids(&self.servo_ids, "bus.servo_ids")
    }
}

/// Check a servo subset: non-empty, joint IDs only, no duplicates.
pub fn validate_servo_ids(ids: &[u8], field: &str) -> Result<(), ConfigError> {
    if ids.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{field} cannot be empty"
        )));
    }
    let mut seen = [false; NUM_SERVOS];
    for &id in ids {
        let idx = servo_index(id).ok_or_else(|| {
            ConfigError::ValidationError(format!("{field}: servo id {id} outside 1..={NUM_SERVOS}"))
        })?;
        if seen[idx] {
            return Err(ConfigError::ValidationError(format!(
                "{field}: duplicate servo id {id}"
            )));
        }
        seen[idx] = true;
    }
    Ok(())
}

/// Bus pacing and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum gap between the end of one command and the next.
    #[serde(default = "default_min_command_gap_ms")]
    pub min_command_gap_ms: u64,

    /// Delay after every write.
    #[serde(default = "default_write_settle_ms")]
    pub write_settle_ms: u64,

    /// Read attempts before a read error is surfaced.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    /// Base backoff between read attempts; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_command_gap_ms: default_min_command_gap_ms(),
            write_settle_ms: default_write_settle_ms(),
            read_attempts: default_read_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl TimingConfig {
    /// Pacing with every delay zeroed. Used against simulated links.
    pub const fn immediate() -> Self {
        Self {
            min_command_gap_ms: 0,
            write_settle_ms: 0,
            read_attempts: DEFAULT_READ_ATTEMPTS,
            retry_backoff_ms: 0,
        }
    }

    /// Minimum command gap.
    #[inline]
    pub fn min_command_gap(&self) -> Duration {
        Duration::from_millis(self.min_command_gap_ms)
    }

    /// Post-write settle delay.
    #[inline]
    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }

    /// Backoff before retry number `attempt` (1-based).
    #[inline]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// Validate the timing section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "timing.read_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Calibration source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Calibration file; when absent the controller reads limits off the
    /// servos.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Calibration workflow settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Range sampler period in milliseconds.
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,

    /// Samples kept in the recording history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// File written by `save_calibration`.
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Servos taking part in the calibration.
    #[serde(default = "default_servo_ids")]
    pub servo_ids: ServoIdSet,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: default_sample_period_ms(),
            history_capacity: default_history_capacity(),
            output: default_output(),
            servo_ids: default_servo_ids(),
        }
    }
}

impl WorkflowConfig {
    /// Sampler period.
    #[inline]
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    /// Validate the workflow section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "workflow.sample_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "workflow.history_capacity must be greater than 0".to_string(),
            ));
        }
        validate_servo_ids(&self.servo_ids, "workflow.servo_ids")
    }
}

/// Main configuration loaded from `armlink.toml`.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "armlink"
///
/// [bus]
/// port = "/dev/ttyACM0"
/// baudrate = 1000000
/// timeout_ms = 100
///
/// [calibration]
/// file = "calibration.json"
///
/// [workflow]
/// sample_period_ms = 10
/// output = "calibration.json"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArmConfig {
    /// Logging and identity.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Serial bus.
    #[serde(default)]
    pub bus: BusConfig,
    /// Pacing and retries.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Calibration source.
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Calibration workflow.
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl ArmConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.bus.validate()?;
        self.timing.validate()?;
        self.workflow.validate()
    }

    /// Load, then validate.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed = toml::from_str::<TestWrapper>(&format!("level = \"{text}\"")).unwrap();
            assert_eq!(parsed.level, level);
            assert_eq!(level.as_filter(), text);
        }
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: String::new(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: ArmConfig = toml::from_str("").unwrap();
        assert_eq!(config, ArmConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.servo_ids.as_slice(), &SERVO_IDS);
        assert_eq!(config.bus.baudrate, DEFAULT_BAUDRATE);
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = ArmConfig::load(Path::new("/nonexistent/path/armlink.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = ArmConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_loader_success() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[shared]
log_level = "debug"
service_name = "bench-arm"

[bus]
port = "/dev/ttyUSB1"
baudrate = 500000
servo_ids = [6]

[timing]
read_attempts = 5

[workflow]
output = "out/cal.json"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = ArmConfig::load_validated(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.bus.port, "/dev/ttyUSB1");
        assert_eq!(config.bus.baudrate, 500_000);
        assert_eq!(config.bus.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.bus.servo_ids.as_slice(), &[6]);
        assert_eq!(config.timing.read_attempts, 5);
        assert_eq!(config.workflow.output, PathBuf::from("out/cal.json"));
    }

    #[test]
    fn test_too_many_servo_ids_is_parse_error() {
        let result = toml::from_str::<ArmConfig>("[bus]\nservo_ids = [1, 2, 3, 4, 5, 6, 1]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rules() {
        let mut config = ArmConfig::default();
        config.bus.baudrate = 0;
        assert!(config.validate().is_err());

        let mut config = ArmConfig::default();
        config.bus.servo_ids = [1u8, 1].into_iter().collect();
        assert!(config.validate().is_err());

        let mut config = ArmConfig::default();
        config.workflow.servo_ids = [7u8].into_iter().collect();
        assert!(config.validate().is_err());

        let mut config = ArmConfig::default();
        config.timing.read_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ArmConfig::default();
        config.workflow.sample_period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compatibility_ignores_servo_subset() {
        let arm = BusConfig::for_port("/dev/ttyACM0");
        let mut gripper = arm.clone();
        gripper.servo_ids = [6u8].into_iter().collect();
        assert!(arm.is_compatible(&gripper));

        let mut slow = arm.clone();
        slow.baudrate = 115_200;
        assert!(!arm.is_compatible(&slow));
    }

    #[test]
    fn test_backoff_doubles() {
        let timing = TimingConfig::default();
        assert_eq!(timing.backoff(1), Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS));
        assert_eq!(timing.backoff(3), Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS * 4));
    }
}
