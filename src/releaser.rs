//! Releaser pool: hands a hardware buffer back to its device off the hot
//! capture/encode path, one dedicated thread per buffer slot so a slow
//! release never blocks the next grab.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;

use crate::device::{Device, DeviceError, HardwareBuffer};

/// One channel per hardware-buffer slot, each drained by its own thread.
/// Routing by slot index (rather than a single shared queue) means a slot
/// can never have two releases in flight and a release for slot N never
/// waits behind an unrelated release for slot M.
pub struct ReleaserPool {
    senders: Vec<Sender<HardwareBuffer>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ReleaserPool {
    pub fn new<D>(device: Arc<Mutex<D>>, slot_count: usize) -> Self
    where
        D: Device + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(slot_count);
        let mut handles = Vec::with_capacity(slot_count);

        for _ in 0..slot_count {
            let (tx, rx) = bounded::<HardwareBuffer>(1);
            let device = device.clone();
            let stop = stop.clone();
            let handle = std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let hw = match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(hw) => hw,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    };
                    let mut device = device.lock();
                    if let Err(err) = device.release_buffer(hw) {
                        tracing::warn!(error = %err, "failed to release hardware buffer");
                    }
                }
            });
            senders.push(tx);
            handles.push(handle);
        }

        Self {
            senders,
            handles,
            stop,
        }
    }

    /// Queues a buffer for release on its slot's dedicated thread. Never
    /// blocks: if that slot's single-deep queue is already full (a release
    /// from the previous cycle is still in flight), the buffer is released
    /// inline instead of piling up.
    pub fn release(&self, hw: HardwareBuffer, fallback: &mut dyn Device) -> Result<(), DeviceError> {
        let idx = hw.index % self.senders.len();
        match self.senders[idx].try_send(hw) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(hw)) => fallback.release_buffer(hw),
            Err(TrySendError::Disconnected(hw)) => fallback.release_buffer(hw),
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ReleaserPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use crate::frame::FourCc;

    fn sample_hw(index: usize) -> HardwareBuffer {
        let frame = crate::frame::RawFrame::blank(4, 4, 12, FourCc::RGB24);
        HardwareBuffer {
            frame,
            index,
            dma_fd: None,
        }
    }

    #[test]
    fn releases_buffer_through_dedicated_thread() {
        let device = Arc::new(Mutex::new(MockDevice::new(4, 4, FourCc::RGB24, 30)));
        let pool = ReleaserPool::new(device.clone(), 2);
        let mut fallback = MockDevice::new(4, 4, FourCc::RGB24, 30);
        pool.release(sample_hw(0), &mut fallback).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown();
    }

    #[test]
    fn releases_many_buffers_across_slots() {
        let device = Arc::new(Mutex::new(MockDevice::new(4, 4, FourCc::RGB24, 30)));
        let pool = ReleaserPool::new(device.clone(), 4);
        let mut fallback = MockDevice::new(4, 4, FourCc::RGB24, 30);
        for idx in 0..8 {
            pool.release(sample_hw(idx), &mut fallback).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown();
    }
}
