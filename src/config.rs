//! Configuration types for pan-transfer

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upload behavior
    #[serde(default)]
    pub upload: UploadConfig,

    /// Retry backoff for failed attempts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Terminal renderer settings
    #[serde(default)]
    pub renderer: RendererConfig,
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults. The loaded configuration is
    /// validated before it is returned.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would make the upload core misbehave
    pub fn validate(&self) -> Result<()> {
        if self.upload.parallel == 0 {
            return Err(config_error("parallel must be at least 1", "upload.parallel"));
        }
        if self.upload.status_interval.is_zero() {
            return Err(config_error(
                "status interval must be non-zero",
                "upload.status_interval",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff multiplier below 1.0 would shrink delays",
                "retry.backoff_multiplier",
            ));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(config_error(
                "max delay is smaller than initial delay",
                "retry.max_delay",
            ));
        }
        if self.renderer.tick_interval.is_zero() {
            return Err(config_error(
                "tick interval must be non-zero",
                "renderer.tick_interval",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Policy applied by the remote side when the target name already exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Reject the upload (default)
    #[default]
    Fail,
    /// Keep both, the new file gets a renamed copy
    NewCopy,
    /// Replace the existing file
    Overwrite,
    /// Keep the existing file, drop the upload
    Skip,
    /// Replace only if the content differs
    RSync,
}

impl ConflictPolicy {
    /// Wire name of the policy
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Fail => "fail",
            ConflictPolicy::NewCopy => "newcopy",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::RSync => "rsync",
        }
    }
}

/// Upload behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Number of blocks transferred concurrently per file (default: 4)
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Never attempt a rapid (hash-only) upload
    #[serde(default)]
    pub no_rapid_upload: bool,

    /// Upload each file as a single block
    #[serde(default)]
    pub no_split_file: bool,

    /// What the server does with an existing file of the same name
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Upload rate ceiling in bytes per second (None = unlimited)
    #[serde(default)]
    pub max_upload_rate: Option<u64>,

    /// Maximum number of retries after the first failed attempt (default: 3)
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// How often transfer progress is reported (default: 1 second)
    #[serde(default = "default_status_interval", with = "millis_serde")]
    pub status_interval: Duration,

    /// Minimum time between two resume checkpoint writes (default: 5 seconds)
    #[serde(default = "default_checkpoint_interval", with = "millis_serde")]
    pub checkpoint_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            no_rapid_upload: false,
            no_split_file: false,
            conflict_policy: ConflictPolicy::default(),
            max_upload_rate: None,
            max_retry: default_max_retry(),
            status_interval: default_status_interval(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

/// Retry backoff configuration
///
/// The delay before retry `n` (1-based) is
/// `min(initial_delay * backoff_multiplier^(n-1), max_delay)`, which never
/// decreases as `n` grows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Terminal renderer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Spinner frame interval (default: 100 milliseconds)
    #[serde(default = "default_tick_interval", with = "millis_serde")]
    pub tick_interval: Duration,

    /// Extra spaces written past a shrinking row to cover width-measurement
    /// error on control and wide characters (default: 4)
    #[serde(default = "default_erase_margin")]
    pub erase_margin: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            erase_margin: default_erase_margin(),
        }
    }
}

fn default_parallel() -> usize {
    4
}

fn default_max_retry() -> u32 {
    3
}

fn default_status_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_erase_margin() -> usize {
    4
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
