//! Stream Controller: the outer reinit loop and inner per-frame loop that
//! drive a device, an encoder pool, the memory sinks, and the motion-video
//! fan-out.
//!
//! Generic over `Device` and `MotionVideoProcessor` implementations so the
//! whole state machine runs against `MockDevice`/`NullMotionVideoProcessor`
//! in tests, without real V4L2/DRM hardware.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;
use crate::device::{Device, DeviceError, HardwareBuffer, OpenSettings};
use crate::display::{DisplayRuntime, DisplayState, KmsBackend, StubReason};
use crate::encoder::EncoderPool;
use crate::error::StreamError;
use crate::frame::{FourCc, RawFrame};
use crate::motion_video::MotionVideoProcessor;
use crate::releaser::ReleaserPool;
use crate::ring::FrameRing;
use crate::sink::MemorySink;
use crate::text::{StubTextRasterizer, TextRasterizer};

/// Shared, cross-thread state a running controller exposes: the stop flag
/// other components check, and the last published captured-fps count.
pub struct StreamRuntime {
    pub stop: Arc<AtomicBool>,
    pub captured_fps: Arc<AtomicU32>,
}

impl StreamRuntime {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            captured_fps: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

impl Default for StreamRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the online/offline transition for the blank/freeze policy so the
/// controller only has to ask "what should I publish right now". Holds no
/// frame references itself, only the decision, so callers are free to
/// borrow `self` again immediately afterwards to act on it.
struct BlankPolicy {
    last_online: bool,
    offline_since: Option<Instant>,
    blank_jpeg: RawFrame,
}

#[derive(Debug, PartialEq, Eq)]
enum PublishDecision {
    Live,
    Blank,
    HoldLast,
}

impl BlankPolicy {
    fn new(blank_jpeg: RawFrame) -> Self {
        Self {
            last_online: false,
            offline_since: None,
            blank_jpeg,
        }
    }

    /// Decides what to publish for this tick, given whether a live frame
    /// arrived and the configured `last_as_blank` freeze window.
    fn decide(&mut self, live: bool, last_as_blank: i64) -> PublishDecision {
        if live {
            self.last_online = true;
            self.offline_since = None;
            return PublishDecision::Live;
        }

        if self.last_online {
            // First tick of the online -> offline transition: the freeze
            // timer, if any, starts here and is never re-armed while still
            // offline.
            self.last_online = false;
            if last_as_blank > 0 {
                self.offline_since = Some(Instant::now());
            }
        }

        if last_as_blank < 0 {
            return PublishDecision::Blank;
        }
        if last_as_blank == 0 {
            return PublishDecision::HoldLast;
        }
        match self.offline_since {
            Some(since) if since.elapsed() >= Duration::from_secs(last_as_blank as u64) => {
                PublishDecision::Blank
            }
            _ => PublishDecision::HoldLast,
        }
    }
}

/// Rate-limits a repeated warning to at most once per window, used for the
/// ring-full retry loop so a stuck consumer does not flood the log.
struct RateLimitedLog {
    last_logged: Option<Instant>,
    window: Duration,
}

impl RateLimitedLog {
    fn new(window: Duration) -> Self {
        Self {
            last_logged: None,
            window,
        }
    }

    fn fire(&mut self, message: &str) {
        let now = Instant::now();
        let should_log = match self.last_logged {
            Some(last) => now.duration_since(last) >= self.window,
            None => true,
        };
        if should_log {
            tracing::warn!("{message}");
            self.last_logged = Some(now);
        }
    }
}

pub struct StreamController<D: Device + 'static, M: MotionVideoProcessor> {
    config: Config,
    device: Arc<Mutex<D>>,
    encoders: EncoderPool,
    motion_video: Option<M>,
    image_ring: Arc<FrameRing<RawFrame>>,
    image_sink: Arc<dyn MemorySink>,
    raw_sink: Option<Arc<dyn MemorySink>>,
    display: Option<DisplayRuntime<KmsBackend>>,
    text_rasterizer: Box<dyn TextRasterizer>,
    releaser: Option<ReleaserPool>,
    runtime: Arc<StreamRuntime>,
    blank_policy: BlankPolicy,
    ring_full_log: RateLimitedLog,
    grab_after: Instant,
    fps_window_start: Instant,
    fps_window_count: u32,
    last_http_request: Instant,
}

impl<D: Device + 'static, M: MotionVideoProcessor> StreamController<D, M> {
    pub fn new(
        config: Config,
        device: D,
        encoders: EncoderPool,
        motion_video: Option<M>,
        image_ring: Arc<FrameRing<RawFrame>>,
        image_sink: Arc<dyn MemorySink>,
        raw_sink: Option<Arc<dyn MemorySink>>,
        display: Option<DisplayRuntime<KmsBackend>>,
        blank_jpeg: RawFrame,
        runtime: Arc<StreamRuntime>,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            device: Arc::new(Mutex::new(device)),
            encoders,
            motion_video,
            image_ring,
            image_sink,
            raw_sink,
            display,
            text_rasterizer: Box::new(StubTextRasterizer),
            releaser: None,
            runtime,
            blank_policy: BlankPolicy::new(blank_jpeg),
            ring_full_log: RateLimitedLog::new(Duration::from_secs(1)),
            grab_after: now,
            fps_window_start: now,
            fps_window_count: 0,
            last_http_request: now,
        }
    }

    pub fn motion_video(&self) -> Option<&M> {
        self.motion_video.as_ref()
    }

    /// Wall-clock budget an encode job gets before it counts as late: twice
    /// the nominal frame interval, so one slow encode does not itself cause
    /// the next one to be dropped too.
    fn job_budget(&self) -> Duration {
        let fps = self.config.desired_fps.max(1) as f64;
        Duration::from_secs_f64(2.0 / fps)
    }

    /// Outer reinit loop: opens the device, runs the inner loop until it
    /// breaks out for reopen, and retries after `error_delay_secs` when the
    /// failure looks transient.
    pub fn run(&mut self, path: &str) -> Result<(), StreamError> {
        while !self.runtime.is_stopped() {
            self.publish_blank_placeholder();
            self.wait_for_device_node(path);
            if self.runtime.is_stopped() {
                break;
            }

            let dma_export = self.motion_video.is_some();
            let settings = OpenSettings {
                path: path.to_string(),
                width: self.config.capture_width,
                height: self.config.capture_height,
                fps: self.config.desired_fps,
                buffer_count: crate::ring::IMAGE_RING_CAPACITY,
                dma_export,
            };

            match self.device.lock().open(&settings) {
                Ok(()) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "failed to open capture device");
                    self.device.lock().close();
                    std::thread::sleep(Duration::from_secs(self.config.error_delay_secs));
                    continue;
                }
            }

            self.open_display_for_current_device();
            self.releaser = Some(ReleaserPool::new(self.device.clone(), crate::ring::IMAGE_RING_CAPACITY));

            self.inner_loop();

            if let Some(releaser) = self.releaser.take() {
                releaser.shutdown();
            }
            if let Some(display) = self.display.as_mut() {
                display.close();
            }
            self.device.lock().close();
        }
        Ok(())
    }

    /// Opens the display mirror against the resolution/format the device
    /// just negotiated, falling back to a stub-only mount (never fatal: a
    /// missing or unplugged monitor must not stop capture).
    fn open_display_for_current_device(&mut self) {
        let Some(display) = self.display.as_mut() else {
            return;
        };
        let (width, height, hz, format) = {
            let device = self.device.lock();
            (device.width(), device.height(), device.hz(), device.format())
        };
        let format_is_rgb24 = format == FourCc::RGB24;
        let result = display.open_for_capture(width, height, hz, format_is_rgb24, crate::ring::IMAGE_RING_CAPACITY);
        if let Err(err) = result {
            tracing::warn!(error = %err, "display mirror failed to open for capture, falling back to stub");
            if let Err(err) = display.open_for_stub_only() {
                tracing::warn!(error = %err, "display mirror stub fallback also failed");
            }
        }
    }

    fn wait_for_device_node(&self, path: &str) {
        while !std::path::Path::new(path).exists() {
            if self.runtime.is_stopped() {
                return;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    fn publish_blank_placeholder(&mut self) {
        let blank = self.blank_policy.blank_jpeg.clone();
        if self.image_sink.server_check(&blank) {
            let _ = self.image_sink.server_put(&blank);
        }
    }

    /// Routes a completed hardware buffer back to its device, through the
    /// per-slot releaser pool when one is running so a slow release never
    /// blocks the next grab; falls back to an inline release otherwise.
    fn release_hw(&mut self, hw: HardwareBuffer) {
        let mut device = self.device.lock();
        if let Some(releaser) = self.releaser.as_ref() {
            if let Err(err) = releaser.release(hw, &mut *device) {
                tracing::warn!(error = %err, "failed to release hardware buffer");
            }
        } else if let Err(err) = device.release_buffer(hw) {
            tracing::warn!(error = %err, "failed to release hardware buffer");
        }
    }

    /// Mirrors the just-grabbed buffer onto the connector: a DMA page flip
    /// when open for capture, a captioned stub frame otherwise. Waits for
    /// the previous flip's vsync first so page flips never queue up faster
    /// than the display can retire them.
    fn drive_display(&mut self, hw: &HardwareBuffer) {
        let Some(display) = self.display.as_mut() else {
            return;
        };
        if let Err(err) = display.wait_for_vsync(Duration::from_secs(self.config.timeout_secs)) {
            tracing::debug!(error = %err, "display vsync wait failed");
        }
        match display.state() {
            DisplayState::OpenForDma => {
                if let Err(err) = display.expose_dma(hw) {
                    tracing::debug!(error = %err, "dma page flip failed");
                }
            }
            DisplayState::OpenForStub => {
                let reason = display.stub_reason().unwrap_or(StubReason::NoSignal);
                if let Err(err) = display.expose_stub(reason, "", self.text_rasterizer.as_ref()) {
                    tracing::debug!(error = %err, "stub page flip failed");
                }
            }
            DisplayState::Closed => {}
        }
    }

    /// Per-frame loop. Returns when the device reports a persistent error
    /// and the controller should reopen.
    fn inner_loop(&mut self) {
        loop {
            if self.runtime.is_stopped() {
                return;
            }

            let sink_key_requested = match self.encoders.wait(Duration::from_millis(50)) {
                Some(job) => {
                    let key = match (job.outcome, job.timely) {
                        (Ok(()), true) => self.expose_encoded(job.frame),
                        (Ok(()), false) => {
                            tracing::debug!("dropping late encode job, image ring not advanced");
                            self.expose_offline_tick()
                        }
                        (Err(err), _) => {
                            tracing::debug!(error = %err, "dropping failed encode job");
                            self.expose_offline_tick()
                        }
                    };
                    self.release_hw(job.hw);
                    key
                }
                None => self.expose_offline_tick(),
            };

            let mut force_keyframe = self.apply_slowdown_gating() || sink_key_requested;

            let hw = match self.device.lock().grab_buffer() {
                Ok(hw) => hw,
                Err(DeviceError::BrokenFrame) => continue,
                Err(_) => return,
            };

            self.account_captured_frame();
            self.drive_display(&hw);

            let now = Instant::now();
            if now < self.grab_after {
                self.release_hw(hw);
                continue;
            }
            self.grab_after = now + self.encoders.fluency_delay();

            if let Some(raw_sink) = &self.raw_sink {
                if raw_sink.server_check(&hw.frame) {
                    match raw_sink.server_put(&hw.frame) {
                        Ok(key_requested) => force_keyframe |= key_requested,
                        Err(err) => tracing::debug!(error = %err, "failed to publish raw frame"),
                    }
                }
            }
            if let Some(motion_video) = &self.motion_video {
                let _ = motion_video.feed(&hw.frame, force_keyframe);
            }

            let deadline = Instant::now() + self.job_budget();
            if self.encoders.assign(hw, deadline).is_err() {
                tracing::error!("encoder pool lost, breaking for reopen");
                return;
            }
        }
    }

    /// Returns whether the full idle second elapsed without a client
    /// appearing, which forces a keyframe on the next motion-video packet.
    fn apply_slowdown_gating(&self) -> bool {
        if !self.config.slowdown || self.image_sink.has_clients() {
            return false;
        }
        for _ in 0..10 {
            if self.runtime.is_stopped() || self.image_sink.has_clients() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        true
    }

    fn account_captured_frame(&mut self) {
        self.fps_window_count += 1;
        let elapsed = self.fps_window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.runtime
                .captured_fps
                .store(self.fps_window_count, Ordering::Relaxed);
            self.fps_window_count = 0;
            self.fps_window_start = Instant::now();
        }
    }

    /// Exposes a successfully (and timely) encoded frame through the blank
    /// policy, returning whether the sink wants a keyframe on the next
    /// motion-video packet.
    fn expose_encoded(&mut self, frame: RawFrame) -> bool {
        match self.blank_policy.decide(true, self.config.last_as_blank) {
            PublishDecision::Live => self.publish(&frame),
            PublishDecision::Blank => {
                let blank = self.blank_policy.blank_jpeg.clone();
                self.publish(&blank)
            }
            PublishDecision::HoldLast => false,
        }
    }

    /// Publishes `_expose_frame(None)`: called once per tick that produced
    /// no live frame (fluency-passed, late, failed, or waiting on an idle
    /// worker), so the blank/freeze timer keeps advancing even when
    /// nothing was encoded.
    fn expose_offline_tick(&mut self) -> bool {
        match self.blank_policy.decide(false, self.config.last_as_blank) {
            PublishDecision::Blank => {
                let blank = self.blank_policy.blank_jpeg.clone();
                self.publish(&blank)
            }
            PublishDecision::Live | PublishDecision::HoldLast => false,
        }
    }

    /// Writes `frame` into the image ring and, subject to the idle-publish
    /// gate, into the image sink. Returns whether the sink just asked for a
    /// keyframe (a client rejoined since the last publish).
    fn publish(&mut self, frame: &RawFrame) -> bool {
        // The ring is the internal hand-off buffer between this loop and
        // the reader that owns the sink's transport; a full ring here means
        // the reader is falling behind, not that the frame is lost, so the
        // producer retries instead of dropping it.
        loop {
            if self.runtime.is_stopped() {
                return false;
            }
            if let Some(idx) = self.image_ring.producer_try_acquire() {
                self.image_ring.write(idx, |slot| slot.copy_from(frame));
                self.image_ring.producer_release(idx);
                break;
            }
            self.ring_full_log.fire("image ring full, retrying publish");
            std::thread::sleep(Duration::from_micros(500));
        }

        if !self.image_sink.server_check(frame) {
            return false;
        }
        match self.image_sink.server_put(frame) {
            Ok(key_requested) => key_requested,
            Err(err) => {
                tracing::debug!(error = %err, "failed to publish frame to image sink");
                false
            }
        }
    }

    /// Checks the idle-exit condition: when `exit_on_no_clients` is set and
    /// no client has been seen for that long, signals the runtime to stop.
    pub fn check_exit_on_idle(&mut self) {
        if self.config.exit_on_no_clients == 0 {
            return;
        }
        if self.image_sink.has_clients() {
            self.last_http_request = Instant::now();
            return;
        }
        let idle_for = self.last_http_request.elapsed();
        if idle_for > Duration::from_secs(self.config.exit_on_no_clients) {
            self.last_http_request = Instant::now();
            self.runtime.request_stop();
        }
    }

    pub fn runtime_is_stopped(&self) -> bool {
        self.runtime.is_stopped()
    }

    /// Test hook: pushes the idle clock back so idle-exit tests don't have
    /// to sleep through the real window.
    #[doc(hidden)]
    pub fn backdate_last_http_request(&mut self, by: Duration) {
        self.last_http_request = Instant::now() - by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use crate::encoder::{EncodeError, StillImageEncoder};
    use crate::frame::FourCc;
    use crate::motion_video::NullMotionVideoProcessor;
    use crate::sink::NullSink;

    struct EchoEncoder;
    impl StillImageEncoder for EchoEncoder {
        fn encode(&mut self, hw: &crate::device::HardwareBuffer, out: &mut RawFrame) -> Result<(), EncodeError> {
            out.copy_from(&hw.frame);
            Ok(())
        }
    }

    fn make_controller() -> (
        StreamController<MockDevice, NullMotionVideoProcessor>,
        Arc<NullSink>,
    ) {
        let config = Config::default();
        let device = MockDevice::new(64, 48, FourCc::RGB24, 30);
        let encoders = EncoderPool::new(2, || Box::new(EchoEncoder));
        let ring = Arc::new(FrameRing::new(4, || RawFrame::blank(64, 48, 192, FourCc::RGB24)));
        let sink = Arc::new(NullSink::new());
        let blank = RawFrame::blank(64, 48, 192, FourCc::RGB24);
        let runtime = Arc::new(StreamRuntime::new());
        let controller = StreamController::new(
            config,
            device,
            encoders,
            Some(NullMotionVideoProcessor::new()),
            ring,
            sink.clone() as Arc<dyn MemorySink>,
            None,
            None,
            blank,
            runtime,
        );
        (controller, sink)
    }

    #[test]
    fn blank_policy_holds_last_frame_when_freeze_forever() {
        let mut policy = BlankPolicy::new(RawFrame::blank(4, 4, 12, FourCc::RGB24));
        assert_eq!(policy.decide(true, 0), PublishDecision::Live);
        assert_eq!(policy.decide(false, 0), PublishDecision::HoldLast);
    }

    #[test]
    fn blank_policy_blanks_immediately_when_negative() {
        let mut policy = BlankPolicy::new(RawFrame::blank(4, 4, 12, FourCc::RGB24));
        policy.decide(true, -1);
        assert_eq!(policy.decide(false, -1), PublishDecision::Blank);
    }

    #[test]
    fn blank_policy_arms_timer_only_on_first_offline_tick() {
        let mut policy = BlankPolicy::new(RawFrame::blank(4, 4, 12, FourCc::RGB24));
        policy.decide(true, 1);

        policy.decide(false, 1);
        let first_timer = policy.offline_since;
        assert!(first_timer.is_some());

        std::thread::sleep(Duration::from_millis(5));
        policy.decide(false, 1);
        assert_eq!(policy.offline_since, first_timer);
    }

    #[test]
    fn controller_exposes_a_grabbed_frame_through_the_sink() {
        let (mut controller, sink) = make_controller();
        let runtime = controller.runtime.clone();
        std::thread::scope(|s| {
            s.spawn(|| {
                controller.run("/dev/null").ok();
            });
            std::thread::sleep(Duration::from_millis(200));
            runtime.request_stop();
        });
        assert!(sink.last_frame().is_some());
    }

    #[test]
    fn exit_on_idle_is_noop_when_disabled() {
        let (mut controller, _sink) = make_controller();
        controller.check_exit_on_idle();
        assert!(!controller.runtime.is_stopped());
    }
}
