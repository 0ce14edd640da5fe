//! Raw frame data model shared by capture, encode, ring, and display.

use std::fmt;
use std::time::Instant;

/// Four-character pixel format code (V4L2/DRM convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const RGB24: FourCc = FourCc(*b"RGB3");
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    pub const MJPG: FourCc = FourCc(*b"MJPG");

    pub fn new(code: &[u8; 4]) -> Self {
        FourCc(*code)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

/// A captured or synthetic video frame plus its metadata.
///
/// The byte buffer is reused across frames (resized, not reallocated) so a
/// `RawFrame` can live in a pre-allocated ring slot.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: FourCc,
    pub hz: u32,
    pub grabbed_at: Instant,
    pub sequence: u64,
    /// true iff produced from a live capture in the current open-cycle.
    pub online: bool,
}

impl RawFrame {
    pub fn blank(width: u32, height: u32, stride: u32, format: FourCc) -> Self {
        Self {
            data: Vec::new(),
            width,
            height,
            stride,
            format,
            hz: 0,
            grabbed_at: Instant::now(),
            sequence: 0,
            online: false,
        }
    }

    pub fn copy_from(&mut self, other: &RawFrame) {
        self.data.clear();
        self.data.extend_from_slice(&other.data);
        self.width = other.width;
        self.height = other.height;
        self.stride = other.stride;
        self.format = other.format;
        self.hz = other.hz;
        self.grabbed_at = other.grabbed_at;
        self.sequence = other.sequence;
        self.online = other.online;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display_matches_ascii() {
        assert_eq!(FourCc::RGB24.to_string(), "RGB3");
        assert_eq!(FourCc::YUYV.to_string(), "YUYV");
    }

    #[test]
    fn blank_frame_is_offline() {
        let f = RawFrame::blank(1920, 1080, 1920 * 3, FourCc::RGB24);
        assert!(!f.online);
        assert_eq!(f.sequence, 0);
    }

    #[test]
    fn copy_from_reuses_allocation() {
        let mut dst = RawFrame::blank(4, 4, 12, FourCc::RGB24);
        dst.data.reserve(64);
        let cap_before = dst.data.capacity();

        let mut src = RawFrame::blank(4, 4, 12, FourCc::RGB24);
        src.data = vec![1, 2, 3, 4];
        src.online = true;
        src.sequence = 7;

        dst.copy_from(&src);
        assert_eq!(dst.data, vec![1, 2, 3, 4]);
        assert!(dst.online);
        assert_eq!(dst.sequence, 7);
        assert!(dst.data.capacity() >= cap_before.min(4));
    }
}
