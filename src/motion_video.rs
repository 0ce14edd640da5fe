//! Motion-video encoding (H.264/etc) is an external collaborator's job;
//! this trait is the controller's fan-out target, kept in the core crate
//! because the slowdown/keyframe contract is part of this crate's own
//! behavior even though the codec itself is not.

use parking_lot::Mutex;
use thiserror::Error;

use crate::frame::RawFrame;

#[derive(Error, Debug)]
pub enum MotionVideoError {
    #[error("motion-video processor rejected frame: {0}")]
    Rejected(String),
}

pub trait MotionVideoProcessor: Send {
    fn feed(&self, frame: &RawFrame, force_keyframe: bool) -> Result<(), MotionVideoError>;
}

/// Discards frames; used when motion-video is disabled and in tests that
/// only care about the force-keyframe flag.
pub struct NullMotionVideoProcessor {
    calls: Mutex<Vec<(u64, bool)>>,
}

impl NullMotionVideoProcessor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(u64, bool)> {
        self.calls.lock().clone()
    }
}

impl Default for NullMotionVideoProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionVideoProcessor for NullMotionVideoProcessor {
    fn feed(&self, frame: &RawFrame, force_keyframe: bool) -> Result<(), MotionVideoError> {
        self.calls.lock().push((frame.sequence, force_keyframe));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FourCc;

    #[test]
    fn records_keyframe_flag_per_call() {
        let proc = NullMotionVideoProcessor::new();
        let mut frame = RawFrame::blank(4, 4, 12, FourCc::RGB24);
        frame.sequence = 1;
        proc.feed(&frame, false).unwrap();
        frame.sequence = 2;
        proc.feed(&frame, true).unwrap();

        let calls = proc.calls();
        assert_eq!(calls, vec![(1, false), (2, true)]);
    }
}
