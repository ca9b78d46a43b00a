//! Flash client configuration with YAML support

use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uf2b_core::DEVICE_CAPACITY;

/// Flash client configuration
///
/// Can be loaded from YAML, JSON, or constructed programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Connection settings
    pub connection: ConnectionConfig,

    /// Endpoint paths on the controller
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Board layout
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Base URL of the controller
    pub base_url: String,
}

/// Endpoint paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Status array: GET
    #[serde(default = "default_status_path")]
    pub status: String,

    /// Port selection: GET with the device index as query parameter
    #[serde(default = "default_select_path")]
    pub select: String,

    /// Query parameter carrying the device index
    #[serde(default = "default_select_param")]
    pub select_param: String,

    /// Firmware upload: POST
    #[serde(default = "default_flash_path")]
    pub flash: String,

    /// Board console output: GET
    #[serde(default = "default_stdout_path")]
    pub stdout: String,

    /// Controller reboot: GET with `bootsel=0|1`
    #[serde(default = "default_reboot_path")]
    pub reboot: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            status: default_status_path(),
            select: default_select_path(),
            select_param: default_select_param(),
            flash: default_flash_path(),
            stdout: default_stdout_path(),
            reboot: default_reboot_path(),
        }
    }
}

fn default_status_path() -> String {
    "/status.json".to_string()
}

fn default_select_path() -> String {
    "/select.cgi".to_string()
}

fn default_select_param() -> String {
    "active_device".to_string()
}

fn default_flash_path() -> String {
    "/flash".to_string()
}

fn default_stdout_path() -> String {
    "/stdout.ssi".to_string()
}

fn default_reboot_path() -> String {
    "/reboot.cgi".to_string()
}

/// Board layout and default device range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Number of USB ports on the controller (at most 255)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// First device to flash (inclusive)
    #[serde(default)]
    pub first: Option<usize>,

    /// Last device to flash (inclusive)
    #[serde(default)]
    pub last: Option<usize>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            first: None,
            last: None,
        }
    }
}

fn default_capacity() -> usize {
    DEVICE_CAPACITY
}

/// Timeout configuration, all values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// General request timeout (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_ms: u64,

    /// Connect timeout (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Status poll period (default: 245ms)
    #[serde(default = "default_poll_period")]
    pub poll_ms: u64,

    /// Queue or service time above which a request is reported slow (default: 600ms)
    #[serde(default = "default_slow_request")]
    pub slow_request_ms: u64,

    /// Clearing all ports before a run (default: 1 minute)
    #[serde(default = "default_clear_timeout")]
    pub clear_ms: u64,

    /// Port selection acknowledged (default: 1 minute)
    #[serde(default = "default_select_timeout")]
    pub select_ms: u64,

    /// Each BOOTSEL transition over the serial interface (default: 2s)
    #[serde(default = "default_cdc_timeout")]
    pub cdc_ms: u64,

    /// Mass-storage ready for a flash request (default: 1 minute)
    #[serde(default = "default_msc_timeout")]
    pub msc_ms: u64,

    /// Upload POST, answered once the image reached the target (default: 10 minutes)
    #[serde(default = "default_upload_timeout")]
    pub upload_ms: u64,

    /// Grace period after an upload before polling again (default: 1s)
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Flashing finished after upload (default: 20 minutes)
    #[serde(default = "default_flash_timeout")]
    pub flash_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
            connect_ms: default_connect_timeout(),
            poll_ms: default_poll_period(),
            slow_request_ms: default_slow_request(),
            clear_ms: default_clear_timeout(),
            select_ms: default_select_timeout(),
            cdc_ms: default_cdc_timeout(),
            msc_ms: default_msc_timeout(),
            upload_ms: default_upload_timeout(),
            settle_ms: default_settle(),
            flash_ms: default_flash_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_poll_period() -> u64 {
    245
}

fn default_slow_request() -> u64 {
    600
}

fn default_clear_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_select_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_cdc_timeout() -> u64 {
    2_000 // 2 seconds
}

fn default_msc_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_upload_timeout() -> u64 {
    600_000 // 10 minutes
}

fn default_settle() -> u64 {
    1_000 // 1 second
}

fn default_flash_timeout() -> u64 {
    1_200_000 // 20 minutes
}

impl TimeoutsConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn slow_request(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }

    pub fn clear(&self) -> Duration {
        Duration::from_millis(self.clear_ms)
    }

    pub fn select(&self) -> Duration {
        Duration::from_millis(self.select_ms)
    }

    pub fn cdc(&self) -> Duration {
        Duration::from_millis(self.cdc_ms)
    }

    pub fn msc(&self) -> Duration {
        Duration::from_millis(self.msc_ms)
    }

    pub fn upload(&self) -> Duration {
        Duration::from_millis(self.upload_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn flash(&self) -> Duration {
        Duration::from_millis(self.flash_ms)
    }
}

impl FlashConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Create a builder for programmatic configuration
    pub fn builder(base_url: impl Into<String>) -> FlashConfigBuilder {
        FlashConfigBuilder::new(base_url)
    }

    /// Check the values the orchestration relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacity = self.devices.capacity;
        if capacity == 0 || capacity > usize::from(u8::MAX) {
            return Err(ConfigError::Invalid(format!(
                "device capacity must be within 1..=255, got {}",
                capacity
            )));
        }
        if self.timeouts.poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Device range from the `devices.first` / `devices.last` bounds
    pub fn device_range(&self) -> Result<DeviceRange, ConfigError> {
        DeviceRange::resolve(None, self.devices.first, self.devices.last, self.devices.capacity)
    }
}

/// Builder for FlashConfig
pub struct FlashConfigBuilder {
    config: FlashConfig,
}

impl FlashConfigBuilder {
    /// Create a new builder with the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: FlashConfig {
                connection: ConnectionConfig {
                    base_url: base_url.into(),
                },
                endpoints: EndpointsConfig::default(),
                devices: DevicesConfig::default(),
                timeouts: TimeoutsConfig::default(),
            },
        }
    }

    /// Set the number of USB ports
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.devices.capacity = capacity;
        self
    }

    /// Set the status endpoint path
    pub fn status_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoints.status = path.into();
        self
    }

    /// Set the flash endpoint path
    pub fn flash_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoints.flash = path.into();
        self
    }

    /// Set the status poll period in milliseconds
    pub fn poll_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.poll_ms = ms;
        self
    }

    /// Set request timeout in milliseconds
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.request_ms = ms;
        self
    }

    /// Set the slow-request reporting threshold in milliseconds
    pub fn slow_request_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.slow_request_ms = ms;
        self
    }

    /// Set the serial (BOOTSEL) transition timeout in milliseconds
    pub fn cdc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.cdc_ms = ms;
        self
    }

    /// Set the mass-storage timeout in milliseconds
    pub fn msc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.msc_ms = ms;
        self
    }

    /// Set the post-upload grace period in milliseconds
    pub fn settle_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.settle_ms = ms;
        self
    }

    /// Set the upload request timeout in milliseconds
    pub fn upload_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.upload_ms = ms;
        self
    }

    /// Set the flash completion timeout in milliseconds
    pub fn flash_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.flash_ms = ms;
        self
    }

    /// Replace all timeouts at once
    pub fn timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Build the configuration
    pub fn build(self) -> FlashConfig {
        self.config
    }
}

/// Contiguous, half-open range of device indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRange {
    pub start: usize,
    pub end: usize,
}

impl DeviceRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Every port on a board of `capacity`
    pub fn all(capacity: usize) -> Self {
        Self::new(0, capacity)
    }

    /// A single port
    pub fn single(device: usize) -> Result<Self, ConfigError> {
        Ok(Self::new(device, Self::past(device)?))
    }

    /// Exclusive end for an inclusive `last`
    fn past(last: usize) -> Result<usize, ConfigError> {
        last.checked_add(1)
            .ok_or_else(|| ConfigError::Invalid(format!("device index {} is too large", last)))
    }

    /// Resolve command-line style bounds
    ///
    /// `single` wins; otherwise `first` and `last` are inclusive and default
    /// to the first and last port of the board.
    pub fn resolve(
        single: Option<usize>,
        first: Option<usize>,
        last: Option<usize>,
        capacity: usize,
    ) -> Result<Self, ConfigError> {
        let range = match (single, first, last) {
            (Some(device), _, _) => Self::single(device)?,
            (None, Some(first), Some(last)) => Self::new(first, Self::past(last)?),
            (None, Some(first), None) => Self::new(first, capacity),
            (None, None, Some(last)) => Self::new(0, Self::past(last)?),
            (None, None, None) => Self::all(capacity),
        };

        if range.start >= range.end || range.end > capacity {
            return Err(ConfigError::Invalid(format!(
                "device range {} does not fit a board of {} ports",
                range, capacity
            )));
        }
        Ok(range)
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, device: usize) -> bool {
        (self.start..self.end).contains(&device)
    }

    pub fn iter(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for DeviceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len() == 1 {
            write!(f, "[{}]", self.start)
        } else {
            write!(f, "[{}..={}]", self.start, self.end.saturating_sub(1))
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::FlashError {
    fn from(err: ConfigError) -> Self {
        crate::FlashError::Config(err.to_string())
    }
}
