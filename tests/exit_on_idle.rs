//! When `exit_on_no_clients` is configured and no client shows up for that
//! long, the controller signals its runtime to stop.

use std::sync::Arc;
use std::time::Duration;

use kvmstream::config::Config;
use kvmstream::controller::{StreamController, StreamRuntime};
use kvmstream::device::{HardwareBuffer, MockDevice};
use kvmstream::encoder::{EncodeError, EncoderPool, StillImageEncoder};
use kvmstream::frame::{FourCc, RawFrame};
use kvmstream::motion_video::NullMotionVideoProcessor;
use kvmstream::ring::FrameRing;
use kvmstream::sink::{MemorySink, NullSink};

struct EchoEncoder;
impl StillImageEncoder for EchoEncoder {
    fn encode(&mut self, hw: &HardwareBuffer, out: &mut RawFrame) -> Result<(), EncodeError> {
        out.copy_from(&hw.frame);
        Ok(())
    }
}

fn build(config: Config) -> (StreamController<MockDevice, NullMotionVideoProcessor>, Arc<NullSink>) {
    let device = MockDevice::new(16, 16, FourCc::RGB24, 30);
    let encoders = EncoderPool::new(1, || Box::new(EchoEncoder));
    let ring = Arc::new(FrameRing::new(4, || RawFrame::blank(16, 16, 48, FourCc::RGB24)));
    let sink = Arc::new(NullSink::new());
    let blank = RawFrame::blank(16, 16, 48, FourCc::RGB24);
    let runtime = Arc::new(StreamRuntime::new());
    let controller = StreamController::new(
        config,
        device,
        encoders,
        Some(NullMotionVideoProcessor::new()),
        ring,
        sink.clone() as Arc<dyn MemorySink>,
        None,
        blank,
        runtime,
    );
    (controller, sink)
}

#[test]
fn stays_running_while_a_client_is_present() {
    let mut config = Config::default();
    config.exit_on_no_clients = 10;
    config.heartbeat_interval_secs = 5;
    let (mut controller, sink) = build(config);
    sink.set_has_clients(true);

    controller.check_exit_on_idle();
    assert!(!controller.runtime_is_stopped());
}

#[test]
fn stops_after_the_idle_window_elapses_with_no_client() {
    let mut config = Config::default();
    config.exit_on_no_clients = 10;
    config.heartbeat_interval_secs = 5;
    let (mut controller, _sink) = build(config);

    // Force the idle clock to already be in the past rather than sleeping
    // for the real 10-second window in a test.
    controller.backdate_last_http_request(Duration::from_secs(11));

    controller.check_exit_on_idle();
    assert!(controller.runtime_is_stopped());
}
