//! Shared-memory output sink: the non-real-time channel through which a
//! viewer process reads the latest frame without taking part in the
//! capture/encode hot path.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use parking_lot::Mutex;
use thiserror::Error;

use crate::frame::RawFrame;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large for sink region ({needed} > {capacity})")]
    TooLarge { needed: usize, capacity: usize },
}

/// Output side of the pipeline. A sink never blocks the producer on a
/// reader; `server_put` always returns promptly whether or not anyone is
/// looking.
pub trait MemorySink: Send + Sync {
    /// Minimum-interval publish gate: always `true` while a client is
    /// present, otherwise throttles to `IDLE_PUBLISH_INTERVAL` so an idle
    /// sink isn't rewritten on every captured frame for nobody to read.
    fn server_check(&self, frame: &RawFrame) -> bool;

    /// Writes the frame and returns whether a keyframe has been requested
    /// since the last publish (e.g. a client just reappeared), which the
    /// caller feeds to the motion-video encoder as `force_keyframe`.
    fn server_put(&self, frame: &RawFrame) -> Result<bool, SinkError>;

    /// Whether a reader has sent a heartbeat recently enough to be
    /// considered present. Non-real-time: a reader that dies without
    /// cleanup is only noticed once its heartbeat goes stale.
    fn has_clients(&self) -> bool;
}

/// How often an idle sink (no client heartbeats) is still rewritten, so a
/// reader that shows up mid-gap sees a recent frame instead of a stale one.
const IDLE_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// A sink backed by a memory-mapped region: a fixed header followed by a
/// raw pixel payload, written in place so a reader mapping the same region
/// always sees a complete frame or the previous complete frame, never a
/// torn mix of the two (the write always goes through a lock the reader
/// does not take, but frame layout is fixed-size so partial writes never
/// straddle the header).
pub struct SharedMemorySink {
    mmap: Mutex<MmapMut>,
    capacity: usize,
    last_client_ping: Arc<AtomicU64>,
    heartbeat_timeout: Duration,
    epoch: Instant,
    last_publish_secs: AtomicU64,
    key_requested: Arc<AtomicBool>,
}

const HEADER_LEN: usize = 32;

impl SharedMemorySink {
    pub fn create(path: &std::path::Path, capacity: usize, heartbeat_timeout: Duration) -> Result<Self, SinkError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len((HEADER_LEN + capacity) as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap: Mutex::new(mmap),
            capacity,
            last_client_ping: Arc::new(AtomicU64::new(0)),
            heartbeat_timeout,
            epoch: Instant::now(),
            last_publish_secs: AtomicU64::new(0),
            key_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a handle a reader process (or, in this crate, a test) uses to
    /// mark itself present.
    pub fn heartbeat_handle(&self) -> SinkHeartbeat {
        SinkHeartbeat {
            last_client_ping: self.last_client_ping.clone(),
            heartbeat_timeout: self.heartbeat_timeout,
            key_requested: self.key_requested.clone(),
            epoch: self.epoch,
        }
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    fn write_frame(&self, frame: &RawFrame) -> Result<(), SinkError> {
        let payload_len = frame.data.len();
        if payload_len > self.capacity {
            return Err(SinkError::TooLarge {
                needed: payload_len,
                capacity: self.capacity,
            });
        }

        let mut mmap = self.mmap.lock();
        {
            let mut header = &mut mmap[..HEADER_LEN];
            header.write_all(&frame.width.to_le_bytes())?;
            header.write_all(&frame.height.to_le_bytes())?;
            header.write_all(&frame.stride.to_le_bytes())?;
            header.write_all(&frame.format.0)?;
            header.write_all(&(payload_len as u32).to_le_bytes())?;
            header.write_all(&frame.sequence.to_le_bytes())?;
        }
        mmap[HEADER_LEN..HEADER_LEN + payload_len].copy_from_slice(&frame.data);
        mmap.flush_async()?;
        Ok(())
    }
}

/// Cloneable handle a reader uses to refresh its presence without touching
/// the mmap itself.
#[derive(Clone)]
pub struct SinkHeartbeat {
    last_client_ping: Arc<AtomicU64>,
    heartbeat_timeout: Duration,
    key_requested: Arc<AtomicBool>,
    epoch: Instant,
}

impl SinkHeartbeat {
    /// Marks the reader present. A ping arriving after the previous one
    /// lapsed past `heartbeat_timeout` (including the very first ping) is
    /// treated as a fresh client joining, and requests a keyframe so it
    /// gets a decodable first frame on the motion-video stream.
    pub fn ping(&self) {
        let secs = self.epoch.elapsed().as_secs();
        let previous = self.last_client_ping.swap(secs, Ordering::AcqRel);
        let rejoined = previous == 0 || secs.saturating_sub(previous) > self.heartbeat_timeout.as_secs();
        if rejoined {
            self.key_requested.store(true, Ordering::Release);
        }
    }
}

impl MemorySink for SharedMemorySink {
    fn server_check(&self, _frame: &RawFrame) -> bool {
        if self.has_clients() {
            return true;
        }
        let last = self.last_publish_secs.load(Ordering::Acquire);
        last == 0 || self.now_secs().saturating_sub(last) >= IDLE_PUBLISH_INTERVAL.as_secs()
    }

    fn server_put(&self, frame: &RawFrame) -> Result<bool, SinkError> {
        self.write_frame(frame)?;
        self.last_publish_secs.store(self.now_secs(), Ordering::Release);
        Ok(self.key_requested.swap(false, Ordering::AcqRel))
    }

    fn has_clients(&self) -> bool {
        let last = self.last_client_ping.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        self.now_secs().saturating_sub(last) <= self.heartbeat_timeout.as_secs()
    }
}

/// No-op sink for tests and for running the controller with output
/// disabled; records the last frame it was given so assertions can inspect
/// it without standing up a real mmap region.
pub struct NullSink {
    last: Mutex<Option<RawFrame>>,
    clients: AtomicBool,
    key_requested: AtomicBool,
    last_publish: Mutex<Option<Instant>>,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
            clients: AtomicBool::new(false),
            key_requested: AtomicBool::new(false),
            last_publish: Mutex::new(None),
        }
    }

    pub fn set_has_clients(&self, present: bool) {
        self.clients.store(present, Ordering::Release);
    }

    pub fn last_frame(&self) -> Option<RawFrame> {
        self.last.lock().clone()
    }

    /// Test/diagnostic hook mirroring a reader heartbeat rejoining after a
    /// gap: marks a keyframe as requested for the next `server_put`.
    pub fn request_keyframe(&self) {
        self.key_requested.store(true, Ordering::Release);
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink for NullSink {
    fn server_check(&self, _frame: &RawFrame) -> bool {
        if self.has_clients() {
            return true;
        }
        let mut last_publish = self.last_publish.lock();
        let now = Instant::now();
        let due = match *last_publish {
            Some(last) => now.duration_since(last) >= IDLE_PUBLISH_INTERVAL,
            None => true,
        };
        if due {
            *last_publish = Some(now);
        }
        due
    }

    fn server_put(&self, frame: &RawFrame) -> Result<bool, SinkError> {
        *self.last.lock() = Some(frame.clone());
        Ok(self.key_requested.swap(false, Ordering::AcqRel))
    }

    fn has_clients(&self) -> bool {
        self.clients.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FourCc;

    #[test]
    fn null_sink_reports_last_frame() {
        let sink = NullSink::new();
        let frame = RawFrame::blank(4, 2, 12, FourCc::RGB24);
        sink.server_put(&frame).unwrap();
        assert_eq!(sink.last_frame().unwrap().width, 4);
    }

    #[test]
    fn null_sink_has_no_clients_until_told() {
        let sink = NullSink::new();
        assert!(!sink.has_clients());
        sink.set_has_clients(true);
        assert!(sink.has_clients());
    }

    #[test]
    fn shared_memory_sink_rejects_oversized_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.shm");
        let sink = SharedMemorySink::create(&path, 16, Duration::from_secs(5)).unwrap();
        let mut frame = RawFrame::blank(4, 4, 16, FourCc::RGB24);
        frame.data = vec![0u8; 64];
        assert!(matches!(sink.server_put(&frame), Err(SinkError::TooLarge { .. })));
    }

    #[test]
    fn shared_memory_sink_tracks_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.shm");
        let sink = SharedMemorySink::create(&path, 64, Duration::from_millis(50)).unwrap();
        assert!(!sink.has_clients());

        let hb = sink.heartbeat_handle();
        hb.ping();
        assert!(sink.has_clients());

        std::thread::sleep(Duration::from_millis(80));
        assert!(!sink.has_clients());
    }

    #[test]
    fn shared_memory_sink_writes_frame_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.shm");
        let sink = SharedMemorySink::create(&path, 64, Duration::from_secs(5)).unwrap();
        let mut frame = RawFrame::blank(2, 2, 6, FourCc::RGB24);
        frame.data = vec![9u8; 24];
        sink.server_put(&frame).unwrap();
    }

    #[test]
    fn shared_memory_sink_requests_key_on_rejoin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.shm");
        let sink = SharedMemorySink::create(&path, 64, Duration::from_millis(50)).unwrap();
        let frame = RawFrame::blank(2, 2, 6, FourCc::RGB24);

        let hb = sink.heartbeat_handle();
        hb.ping();
        assert!(sink.server_put(&frame).unwrap(), "first join requests a keyframe");
        assert!(!sink.server_put(&frame).unwrap(), "no repeat request while still connected");
    }

    #[test]
    fn null_sink_server_check_throttles_when_idle() {
        let sink = NullSink::new();
        let frame = RawFrame::blank(4, 2, 12, FourCc::RGB24);
        assert!(sink.server_check(&frame), "first check always publishes");
        assert!(!sink.server_check(&frame), "immediate recheck is throttled");
    }

    #[test]
    fn null_sink_server_check_ignores_throttle_with_clients() {
        let sink = NullSink::new();
        sink.set_has_clients(true);
        let frame = RawFrame::blank(4, 2, 12, FourCc::RGB24);
        assert!(sink.server_check(&frame));
        assert!(sink.server_check(&frame));
    }

    #[test]
    fn null_sink_reports_requested_keyframe_once() {
        let sink = NullSink::new();
        let frame = RawFrame::blank(4, 2, 12, FourCc::RGB24);
        sink.request_keyframe();
        assert!(sink.server_put(&frame).unwrap());
        assert!(!sink.server_put(&frame).unwrap());
    }
}
