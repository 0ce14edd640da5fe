//! Capture device contract and its V4L2 implementation.

mod v4l2;

pub use v4l2::V4l2Device;

use std::os::fd::OwnedFd;
use thiserror::Error;

use crate::frame::{FourCc, RawFrame};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format negotiation failed: {0}")]
    Format(String),

    #[error("buffer is recoverable-broken, caller should retry")]
    BrokenFrame,

    #[error("grab timed out")]
    Timeout,

    #[error("fatal device error: {0}")]
    Fatal(String),
}

/// Settings used to open a capture device.
#[derive(Debug, Clone)]
pub struct OpenSettings {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: usize,
    pub dma_export: bool,
}

/// A hardware buffer: a raw frame plus kernel-visible identifiers.
pub struct HardwareBuffer {
    pub frame: RawFrame,
    pub index: usize,
    pub dma_fd: Option<OwnedFd>,
}

/// Capture device contract. Generic so the controller and its tests can run
/// against a `MockDevice` without real V4L2 hardware.
pub trait Device: Send {
    fn open(&mut self, settings: &OpenSettings) -> Result<(), DeviceError>;

    /// Dequeues the next ready buffer. `Err(DeviceError::BrokenFrame)` is
    /// recoverable and must not count as an error; `Err(DeviceError::Timeout)`
    /// is persistent and forces the caller to reopen.
    fn grab_buffer(&mut self) -> Result<HardwareBuffer, DeviceError>;

    fn release_buffer(&mut self, hw: HardwareBuffer) -> Result<(), DeviceError>;

    fn close(&mut self);

    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn stride(&self) -> u32;
    fn format(&self) -> FourCc;
    fn hz(&self) -> u32;
}

/// In-memory device for controller/ring tests: produces synthetic frames on
/// demand instead of touching real hardware.
pub struct MockDevice {
    width: u32,
    height: u32,
    format: FourCc,
    hz: u32,
    sequence: u64,
    buffer_count: usize,
    pub break_every: Option<u64>,
    pub timeout_after: Option<u64>,
    pub released: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl MockDevice {
    pub fn new(width: u32, height: u32, format: FourCc, hz: u32) -> Self {
        Self {
            width,
            height,
            format,
            hz,
            sequence: 0,
            buffer_count: 4,
            break_every: None,
            timeout_after: None,
            released: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

impl Device for MockDevice {
    fn open(&mut self, settings: &OpenSettings) -> Result<(), DeviceError> {
        self.width = settings.width;
        self.height = settings.height;
        self.buffer_count = settings.buffer_count.max(1);
        Ok(())
    }

    fn grab_buffer(&mut self) -> Result<HardwareBuffer, DeviceError> {
        if let Some(limit) = self.timeout_after {
            if self.sequence >= limit {
                return Err(DeviceError::Timeout);
            }
        }
        self.sequence += 1;
        if let Some(n) = self.break_every {
            if n > 0 && self.sequence % n == 0 {
                return Err(DeviceError::BrokenFrame);
            }
        }

        let stride = self.width * 3;
        let mut frame = RawFrame::blank(self.width, self.height, stride, self.format);
        frame.data = vec![0u8; (stride * self.height) as usize];
        frame.online = true;
        frame.sequence = self.sequence;
        frame.hz = self.hz;
        frame.grabbed_at = std::time::Instant::now();

        Ok(HardwareBuffer {
            frame,
            index: (self.sequence as usize - 1) % self.buffer_count,
            dma_fd: None,
        })
    }

    fn release_buffer(&mut self, _hw: HardwareBuffer) -> Result<(), DeviceError> {
        self.released.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {}

    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn stride(&self) -> u32 {
        self.width * 3
    }
    fn format(&self) -> FourCc {
        self.format
    }
    fn hz(&self) -> u32 {
        self.hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_device_cycles_buffer_indices() {
        let mut dev = MockDevice::new(64, 48, FourCc::RGB24, 30);
        dev.open(&OpenSettings {
            path: "mock".into(),
            width: 64,
            height: 48,
            fps: 30,
            buffer_count: 2,
            dma_export: false,
        })
        .unwrap();

        let a = dev.grab_buffer().unwrap();
        let b = dev.grab_buffer().unwrap();
        let c = dev.grab_buffer().unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(c.index, 0);
    }

    #[test]
    fn mock_device_reports_broken_frame_as_recoverable() {
        let mut dev = MockDevice::new(64, 48, FourCc::RGB24, 30);
        dev.break_every = Some(2);
        dev.open(&OpenSettings {
            path: "mock".into(),
            width: 64,
            height: 48,
            fps: 30,
            buffer_count: 4,
            dma_export: false,
        })
        .unwrap();

        dev.grab_buffer().unwrap();
        let err = dev.grab_buffer().unwrap_err();
        assert!(matches!(err, DeviceError::BrokenFrame));
    }

    #[test]
    fn mock_device_reports_persistent_timeout() {
        let mut dev = MockDevice::new(64, 48, FourCc::RGB24, 30);
        dev.timeout_after = Some(1);
        dev.open(&OpenSettings {
            path: "mock".into(),
            width: 64,
            height: 48,
            fps: 30,
            buffer_count: 4,
            dma_export: false,
        })
        .unwrap();

        dev.grab_buffer().unwrap();
        let err = dev.grab_buffer().unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
    }
}
