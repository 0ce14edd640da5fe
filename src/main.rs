use std::sync::Arc;

use kvmstream::config::Config;
use kvmstream::controller::{StreamController, StreamRuntime};
use kvmstream::device::{HardwareBuffer, V4l2Device};
use kvmstream::display::{DisplayRuntime, KmsBackend};
use kvmstream::encoder::{EncodeError, EncoderPool, StillImageEncoder};
use kvmstream::frame::{FourCc, RawFrame};
use kvmstream::motion_video::NullMotionVideoProcessor;
use kvmstream::ring::{FrameRing, IMAGE_RING_CAPACITY};
use kvmstream::sink::{MemorySink, SharedMemorySink};

/// Placeholder used until a real still-image encoder back-end is wired in:
/// copies the captured frame through unchanged.
struct PassthroughEncoder;

impl StillImageEncoder for PassthroughEncoder {
    fn encode(&mut self, hw: &HardwareBuffer, out: &mut RawFrame) -> Result<(), EncodeError> {
        out.copy_from(&hw.frame);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/kvmstream.toml".to_string());
    let config = Config::load(&config_path)?;
    tracing::info!(path = %config_path, "loaded configuration");

    let image_sink = Arc::new(SharedMemorySink::create(
        std::path::Path::new("/dev/shm/kvmstream-image"),
        8 * 1024 * 1024,
        std::time::Duration::from_secs(config.heartbeat_interval_secs * 2),
    )?);

    let blank_jpeg = RawFrame::blank(1920, 1080, 1920 * 3, FourCc::RGB24);
    let ring = Arc::new(FrameRing::new(IMAGE_RING_CAPACITY, || {
        RawFrame::blank(1920, 1080, 1920 * 3, FourCc::RGB24)
    }));

    let device = V4l2Device::default();
    let encoders = EncoderPool::new(2, || Box::new(PassthroughEncoder) as Box<dyn StillImageEncoder>);
    let runtime = Arc::new(StreamRuntime::new());

    let display = match KmsBackend::open(&config.display_path, &config.port) {
        Ok(backend) => Some(DisplayRuntime::new(backend)),
        Err(err) => {
            tracing::warn!(error = %err, path = %config.display_path, "display mirror unavailable, running capture-only");
            None
        }
    };

    let mut controller = StreamController::new(
        config.clone(),
        device,
        encoders,
        Some(NullMotionVideoProcessor::new()),
        ring,
        image_sink as Arc<dyn MemorySink>,
        None,
        display,
        blank_jpeg,
        runtime,
    );

    controller.run(&config.path)?;
    Ok(())
}
