//! When slowdown is enabled and no client is present for a full idle
//! second, the next frame fed to the motion-video processor must be
//! forced as a keyframe so a late-arriving client gets a decodable start.

use std::sync::Arc;
use std::time::Duration;

use kvmstream::config::Config;
use kvmstream::controller::{StreamController, StreamRuntime};
use kvmstream::device::{HardwareBuffer, MockDevice};
use kvmstream::encoder::{EncodeError, EncoderPool, StillImageEncoder};
use kvmstream::frame::{FourCc, RawFrame};
use kvmstream::motion_video::{MotionVideoProcessor, NullMotionVideoProcessor};
use kvmstream::ring::FrameRing;
use kvmstream::sink::{MemorySink, NullSink};

struct EchoEncoder;
impl StillImageEncoder for EchoEncoder {
    fn encode(&mut self, hw: &HardwareBuffer, out: &mut RawFrame) -> Result<(), EncodeError> {
        out.copy_from(&hw.frame);
        Ok(())
    }
}

#[test]
fn idle_second_forces_a_keyframe_on_the_next_motion_video_frame() {
    let mut config = Config::default();
    config.slowdown = true;

    let device = MockDevice::new(16, 16, FourCc::RGB24, 30);
    let encoders = EncoderPool::new(2, || Box::new(EchoEncoder));
    let ring = Arc::new(FrameRing::new(4, || RawFrame::blank(16, 16, 48, FourCc::RGB24)));
    let sink = Arc::new(NullSink::new());
    let motion = NullMotionVideoProcessor::new();
    let blank = RawFrame::blank(16, 16, 48, FourCc::RGB24);
    let runtime = Arc::new(StreamRuntime::new());

    let mut controller = StreamController::new(
        config,
        device,
        encoders,
        Some(motion),
        ring,
        sink.clone() as Arc<dyn MemorySink>,
        None,
        blank,
        runtime.clone(),
    );

    std::thread::scope(|s| {
        s.spawn(|| {
            controller.run("/dev/null").ok();
        });
        // Slowdown gating needs the full second of no clients before it
        // reports true; give it enough wall-clock time to get there.
        std::thread::sleep(Duration::from_millis(1400));
        runtime.request_stop();
    });

    let calls = controller.motion_video().unwrap().calls();
    assert!(!calls.is_empty());
    assert!(
        calls.iter().any(|(_, forced)| *forced),
        "expected at least one forced keyframe after an idle second, got {calls:?}"
    );
}
