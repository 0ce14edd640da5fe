//! Process configuration surface. No CLI/argument parsing lives here or
//! anywhere in this crate — that is an external collaborator's job.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_desired_fps")]
    pub desired_fps: u32,

    #[serde(default)]
    pub slowdown: bool,

    /// Seconds; 0 disables.
    #[serde(default)]
    pub exit_on_no_clients: u64,

    /// Heartbeat interval the memory sinks use to refresh `has_clients`,
    /// and the unit the idle-exit grace window below is measured against.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// `<0` blank immediately, `0` freeze forever, `>0` freeze for N seconds.
    #[serde(default)]
    pub last_as_blank: i64,

    #[serde(default = "default_error_delay")]
    pub error_delay_secs: u64,

    #[serde(default)]
    pub h264_bitrate: u32,

    #[serde(default = "default_h264_gop")]
    pub h264_gop: u32,

    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_path")]
    pub path: String,

    /// DRM card node the display mirror opens, distinct from `path` (the
    /// capture device node) even though both commonly live under
    /// `/dev/dri`/`/dev/video*` with overlapping-looking defaults.
    #[serde(default = "default_display_path")]
    pub display_path: String,

    #[serde(default = "default_vsync_timeout")]
    pub timeout_secs: u64,

    /// Requested capture resolution; `0` means "use whatever format the
    /// device is already set to" rather than forcing a mode change.
    #[serde(default)]
    pub capture_width: u32,
    #[serde(default)]
    pub capture_height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desired_fps: default_desired_fps(),
            slowdown: false,
            exit_on_no_clients: 0,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            last_as_blank: 0,
            error_delay_secs: default_error_delay(),
            h264_bitrate: 0,
            h264_gop: default_h264_gop(),
            port: default_port(),
            path: default_path(),
            display_path: default_display_path(),
            timeout_secs: default_vsync_timeout(),
            capture_width: 0,
            capture_height: 0,
        }
    }
}

fn default_desired_fps() -> u32 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_error_delay() -> u64 {
    1
}
fn default_h264_gop() -> u32 {
    30
}
fn default_port() -> String {
    "HDMI-A-1".to_string()
}
fn default_path() -> String {
    "/dev/video0".to_string()
}
fn default_display_path() -> String {
    "/dev/dri/card0".to_string()
}
fn default_vsync_timeout() -> u64 {
    2
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.desired_fps == 0 || self.desired_fps > 240 {
            return Err(ConfigError::Invalid(format!(
                "desired_fps must be between 1 and 240, got {}",
                self.desired_fps
            )));
        }

        if self.exit_on_no_clients > 0
            && self.exit_on_no_clients < 2 * self.heartbeat_interval_secs
        {
            return Err(ConfigError::Invalid(format!(
                "exit_on_no_clients ({}) must be 0 or at least twice the sink \
                 heartbeat interval ({}s) so the idle timer cannot race a \
                 non-real-time has_clients flag",
                self.exit_on_no_clients, self.heartbeat_interval_secs
            )));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout_secs (vsync wait) must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
