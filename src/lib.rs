//! Low-latency video capture-and-display core: grabs frames from a V4L2
//! device, fans them out to a still-image encoder pool and an optional
//! motion-video processor, publishes the result through shared-memory
//! sinks, and mirrors the live signal onto a local display via DRM/KMS.

pub mod config;
pub mod controller;
pub mod device;
pub mod display;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod motion_video;
pub mod releaser;
pub mod ring;
pub mod sink;
pub mod text;

pub use config::Config;
pub use error::StreamError;
