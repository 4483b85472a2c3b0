//! Driver options with range validation.
//!
//! Every timeout and attempt limit has a legal range; out-of-range values
//! are a configuration bug and are rejected up front with
//! [`DriverError::InvalidOptions`] rather than clamped silently. A few
//! settings can be overridden from the environment:
//!
//! - `ZWIRE_DISABLE_SOFT_RESET` — force `enable_soft_reset = false`
//! - `NO_CACHE=true` — clear the persistent caches on open
//! - `ZWIRE_LOCK_DIRECTORY` — where the single-instance lock file lives

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use zwire_core::{
    security::{NetworkKeys, SecurityClass},
    storage::FlushThrottle,
    DriverError,
};

/// Protocol timeouts.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// ACK wait after a frame write (≥ 1 ms)
    pub ack: Duration,
    /// Inter-byte timeout while a frame is partially received (≥ 1 ms)
    pub byte: Duration,
    /// Response wait after an ACK (500..=20000 ms)
    pub response: Duration,
    /// CC report wait after a CC get (500..=10000 ms)
    pub report: Duration,
    /// S0 nonce lifetime (3000..=20000 ms)
    pub nonce: Duration,
    /// Maximum wait for a SendData callback (≥ 10000 ms)
    pub send_data_callback: Duration,
    /// Post-reset Serial API handshake wait (1000..=30000 ms)
    pub serial_api_started: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ack: Duration::from_millis(1000),
            byte: Duration::from_millis(150),
            response: Duration::from_millis(10_000),
            report: Duration::from_millis(1000),
            nonce: Duration::from_millis(5000),
            send_data_callback: Duration::from_millis(65_000),
            serial_api_started: Duration::from_millis(5000),
        }
    }
}

/// Retry limits.
#[derive(Debug, Clone)]
pub struct Attempts {
    /// Serial port open attempts, 1 s apart (≥ 1)
    pub open_serial_port: u8,
    /// Controller command attempts (1..=3)
    pub controller: u8,
    /// Radio-level attempts per SendData (≥ 1)
    pub send_data: u8,
    /// Interview attempts before a node is given up on (1..=10)
    pub node_interview: u8,
}

impl Default for Attempts {
    fn default() -> Self {
        Self { open_serial_port: 10, controller: 3, send_data: 3, node_interview: 5 }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Cache directory; `None` keeps everything in memory
    pub cache_dir: Option<PathBuf>,
    /// Write coalescing preset
    pub throttle: FlushThrottle,
}

/// User callbacks driving interactive S2 inclusion. The three belong
/// together, which the type enforces: either all are present or none is.
#[derive(Clone)]
pub struct InclusionUserCallbacks {
    /// Choose which of the requested security classes to grant
    pub grant_security_classes: Arc<dyn Fn(Vec<SecurityClass>) -> Vec<SecurityClass> + Send + Sync>,
    /// Show the DSK to the user and collect the missing PIN digits
    pub validate_dsk_and_enter_pin: Arc<dyn Fn(String) -> Option<String> + Send + Sync>,
    /// The bootstrap was aborted; dismiss any UI
    pub abort: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for InclusionUserCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InclusionUserCallbacks").finish_non_exhaustive()
    }
}

/// The full option set the driver is constructed with.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Protocol timeouts
    pub timeouts: Timeouts,
    /// Retry limits
    pub attempts: Attempts,
    /// Soft-reset the controller during startup
    pub enable_soft_reset: bool,
    /// Network keys per security class
    pub security_keys: NetworkKeys,
    /// Persistence configuration
    pub storage: StorageOptions,
    /// Clear the caches on open (`NO_CACHE`)
    pub no_cache: bool,
    /// Lock-file directory for single-instance ownership
    pub lock_directory: Option<PathBuf>,
    /// Interactive inclusion callbacks, all-or-none
    pub inclusion_user_callbacks: Option<InclusionUserCallbacks>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            attempts: Attempts::default(),
            enable_soft_reset: true,
            security_keys: NetworkKeys::default(),
            storage: StorageOptions::default(),
            no_cache: false,
            lock_directory: None,
            inclusion_user_callbacks: None,
        }
    }
}

impl DriverOptions {
    /// Validate every range and cross-field rule.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidOptions`] naming the offending option.
    pub fn validate(&self) -> Result<(), DriverError> {
        fn range(
            name: &str,
            value: Duration,
            min: u64,
            max: Option<u64>,
        ) -> Result<(), DriverError> {
            let millis = value.as_millis() as u64;
            if millis < min || max.is_some_and(|max| millis > max) {
                return Err(DriverError::InvalidOptions(match max {
                    Some(max) => format!("timeouts.{name} must be within {min}..={max} ms"),
                    None => format!("timeouts.{name} must be at least {min} ms"),
                }));
            }
            Ok(())
        }

        range("ack", self.timeouts.ack, 1, None)?;
        range("byte", self.timeouts.byte, 1, None)?;
        range("response", self.timeouts.response, 500, Some(20_000))?;
        range("report", self.timeouts.report, 500, Some(10_000))?;
        range("nonce", self.timeouts.nonce, 3000, Some(20_000))?;
        range("sendDataCallback", self.timeouts.send_data_callback, 10_000, None)?;
        range("serialAPIStarted", self.timeouts.serial_api_started, 1000, Some(30_000))?;

        if self.attempts.open_serial_port < 1 {
            return Err(DriverError::InvalidOptions(
                "attempts.openSerialPort must be at least 1".into(),
            ));
        }
        if !(1..=3).contains(&self.attempts.controller) {
            return Err(DriverError::InvalidOptions(
                "attempts.controller must be within 1..=3".into(),
            ));
        }
        if self.attempts.send_data < 1 {
            return Err(DriverError::InvalidOptions(
                "attempts.sendData must be at least 1".into(),
            ));
        }
        if !(1..=10).contains(&self.attempts.node_interview) {
            return Err(DriverError::InvalidOptions(
                "attempts.nodeInterview must be within 1..=10".into(),
            ));
        }

        if !self.security_keys.all_distinct() {
            return Err(DriverError::InvalidOptions(
                "security keys must be distinct across classes".into(),
            ));
        }

        Ok(())
    }

    /// Apply environment overrides. Called once by `Driver::start`.
    pub fn apply_env(&mut self) {
        if std::env::var_os("ZWIRE_DISABLE_SOFT_RESET").is_some() {
            self.enable_soft_reset = false;
        }
        if std::env::var("NO_CACHE").is_ok_and(|value| value == "true") {
            self.no_cache = true;
        }
        if let Some(dir) = std::env::var_os("ZWIRE_LOCK_DIRECTORY") {
            self.lock_directory = Some(PathBuf::from(dir));
        }
    }
}
