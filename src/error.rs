//! Crate-wide error rollup.
//!
//! Each component defines its own `thiserror` enum; this type aggregates
//! them the way `rust-mjpeg-rtp`'s `CaptureError`/`StreamerError` are kept
//! separate but share the same derive shape.

use thiserror::Error;

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::display::DisplayError;
use crate::encoder::EncodeError;
use crate::motion_video::MotionVideoError;
use crate::sink::SinkError;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Display(#[from] DisplayError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    MotionVideo(#[from] MotionVideoError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("fatal error, aborting: {0}")]
    Fatal(String),
}
