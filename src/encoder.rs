//! Still-image encoding is an external collaborator's job (JPEG/PNG/etc
//! back-ends live outside this crate); what lives here is the worker pool
//! that fans hardware buffers out to encoder instances and tracks how far
//! behind the pool is running, so the controller can pace capture to match.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::device::HardwareBuffer;
use crate::frame::RawFrame;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("encoder rejected frame: {0}")]
    Rejected(String),

    #[error("encoder worker panicked")]
    WorkerLost,
}

/// A still-image encoder back-end. Implementations live outside this crate;
/// this trait is the seam a real JPEG/PNG encoder plugs into.
pub trait StillImageEncoder: Send {
    fn encode(&mut self, hw: &HardwareBuffer, out: &mut RawFrame) -> Result<(), EncodeError>;
}

struct WorkerJob {
    hw: HardwareBuffer,
    deadline: Instant,
}

struct WorkerResult {
    frame: RawFrame,
    hw: HardwareBuffer,
    started_at: Instant,
    timely: bool,
    outcome: Result<(), EncodeError>,
}

/// A completed job handed back to the controller: the encoded frame, the
/// hardware buffer to release, and whether it finished inside its deadline.
/// `timely=false` means the frame arrived too late to be worth exposing —
/// the controller drops it instead of advancing the ring.
pub struct EncodedJob {
    pub frame: RawFrame,
    pub hw: HardwareBuffer,
    pub timely: bool,
    pub outcome: Result<(), EncodeError>,
}

/// Fixed pool of OS threads, each driving its own encoder instance, fed by
/// a bounded job queue. One thread per worker avoids sharing a single
/// encoder's internal state across frames in flight.
pub struct EncoderPool {
    job_tx: Sender<WorkerJob>,
    result_rx: Receiver<WorkerResult>,
    handles: Vec<std::thread::JoinHandle<()>>,
    recent_latencies: Mutex<VecDeque<Duration>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

const MAX_LATENCY_SAMPLES: usize = 8;

impl EncoderPool {
    pub fn new<F>(worker_count: usize, mut make_encoder: F) -> Self
    where
        F: FnMut() -> Box<dyn StillImageEncoder>,
    {
        let (job_tx, job_rx) = bounded::<WorkerJob>(worker_count * 2);
        let (result_tx, result_rx) = bounded::<WorkerResult>(worker_count * 2);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handles = (0..worker_count.max(1))
            .map(|_| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let mut encoder = make_encoder();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        let job = match job_rx.recv_timeout(Duration::from_millis(200)) {
                            Ok(job) => job,
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        };
                        let started_at = Instant::now();
                        let mut out = RawFrame::blank(
                            job.hw.frame.width,
                            job.hw.frame.height,
                            job.hw.frame.stride,
                            job.hw.frame.format,
                        );
                        let outcome = encoder.encode(&job.hw, &mut out);
                        let timely = Instant::now() <= job.deadline;
                        let result = WorkerResult {
                            frame: out,
                            hw: job.hw,
                            started_at,
                            timely,
                            outcome,
                        };
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            job_tx,
            result_rx,
            handles,
            recent_latencies: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            stop,
        }
    }

    /// Hands a buffer to whichever worker picks it up next, tagged with the
    /// wall-clock deadline by which the encode must finish to still be worth
    /// exposing. Blocks only if every worker's queue slot is full, which
    /// only happens if the pool is running well behind the capture rate.
    pub fn assign(&self, hw: HardwareBuffer, deadline: Instant) -> Result<(), EncodeError> {
        self.job_tx
            .send(WorkerJob { hw, deadline })
            .map_err(|_| EncodeError::WorkerLost)
    }

    /// Waits for the next completed job, recording its latency for the
    /// rolling fluency estimate.
    pub fn wait(&self, timeout: Duration) -> Option<EncodedJob> {
        let result = self.result_rx.recv_timeout(timeout).ok()?;
        let elapsed = result.started_at.elapsed();
        let mut latencies = self.recent_latencies.lock();
        if latencies.len() == MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(elapsed);
        Some(EncodedJob {
            frame: result.frame,
            hw: result.hw,
            timely: result.timely,
            outcome: result.outcome,
        })
    }

    /// Mean of the last few completion latencies; used to decide how much
    /// headroom the capture loop has before it should slow down.
    pub fn fluency_delay(&self) -> Duration {
        let latencies = self.recent_latencies.lock();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = latencies.iter().sum();
        total / latencies.len() as u32
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for EncoderPool {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FourCc;

    struct EchoEncoder;

    impl StillImageEncoder for EchoEncoder {
        fn encode(&mut self, hw: &HardwareBuffer, out: &mut RawFrame) -> Result<(), EncodeError> {
            out.copy_from(&hw.frame);
            Ok(())
        }
    }

    fn sample_hw(seq: u64) -> HardwareBuffer {
        let mut frame = RawFrame::blank(4, 4, 12, FourCc::RGB24);
        frame.data = vec![1, 2, 3, 4];
        frame.sequence = seq;
        frame.online = true;
        HardwareBuffer {
            frame,
            index: 0,
            dma_fd: None,
        }
    }

    #[test]
    fn pool_round_trips_a_job() {
        let pool = EncoderPool::new(2, || Box::new(EchoEncoder));
        pool.assign(sample_hw(1), Instant::now() + Duration::from_secs(5)).unwrap();
        let job = pool.wait(Duration::from_secs(1)).unwrap();
        assert!(job.outcome.is_ok());
        assert!(job.timely);
        assert_eq!(job.frame.sequence, 1);
    }

    #[test]
    fn late_completion_is_reported_as_not_timely() {
        let pool = EncoderPool::new(1, || Box::new(EchoEncoder));
        let already_passed = Instant::now() - Duration::from_millis(1);
        pool.assign(sample_hw(1), already_passed).unwrap();
        let job = pool.wait(Duration::from_secs(1)).unwrap();
        assert!(job.outcome.is_ok());
        assert!(!job.timely);
    }

    #[test]
    fn fluency_delay_is_zero_before_any_completion() {
        let pool = EncoderPool::new(1, || Box::new(EchoEncoder));
        assert_eq!(pool.fluency_delay(), Duration::ZERO);
    }

    #[test]
    fn fluency_delay_reflects_recent_completions() {
        let pool = EncoderPool::new(1, || Box::new(EchoEncoder));
        for seq in 0..3 {
            pool.assign(sample_hw(seq), Instant::now() + Duration::from_secs(5)).unwrap();
            pool.wait(Duration::from_secs(1)).unwrap();
        }
        assert!(pool.fluency_delay() < Duration::from_millis(50));
    }
}
