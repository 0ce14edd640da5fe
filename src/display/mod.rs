//! Display Mirror: a direct page-flip loop that either imports capture
//! buffers straight onto a connector (zero-copy) or paints a stub screen
//! when there is nothing to show.
//!
//! Grounded on the `drm` crate's `Device`/`control::Device` traits for the
//! KMS ioctl surface (mode enumeration, dumb-buffer creation, PRIME import,
//! page-flip with an event) and on Smithay's compositor output code for the
//! shape of dispatching a page-flip completion back to the buffer that
//! triggered it via a small per-flip token rather than an aliased pointer.

mod drm_backend;
mod sysfs;

pub use drm_backend::KmsBackend;
pub use sysfs::{ConnectorStatus, ConnectorStatusProbe};

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;

use crate::device::HardwareBuffer;
use crate::text::TextRasterizer;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connector unplugged")]
    Unplugged,

    #[error("operation not valid in state {0:?}")]
    WrongState(DisplayState),

    #[error("wait for vsync timed out")]
    Timeout,

    #[error("no usable mode found on connector")]
    NoMode,

    #[error("hardware buffer carries no importable DMA-BUF fd")]
    NoDmaFd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Closed,
    OpenForDma,
    OpenForStub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubReason {
    User,
    BadResolution,
    BadFormat,
    NoSignal,
    Busy,
}

impl StubReason {
    pub fn caption(self, width: u32, height: u32, hz: u32) -> String {
        match self {
            StubReason::User => String::new(),
            StubReason::BadResolution => {
                format!("UNSUPPORTED RESOLUTION {width}x{height}@{hz}")
            }
            StubReason::BadFormat => {
                "UNSUPPORTED CAPTURE FORMAT (report at issue tracker)".to_string()
            }
            StubReason::NoSignal => "NO SIGNAL".to_string(),
            StubReason::Busy => "ONLINE IS ACTIVE".to_string(),
        }
    }
}

/// A connector mode candidate, trimmed to the fields the mode-selection
/// rule needs. A real implementation fills this from `drm::control::Mode`.
#[derive(Debug, Clone, Copy)]
pub struct ModeInfo {
    pub width: u32,
    pub height: u32,
    pub hz: u32,
    pub preferred: bool,
    pub interlaced: bool,
}

/// Picks the best mode for a requested `(width, height, hz)`, per the rule:
/// exact match first, then exact resolution at any refresh, then same width
/// with a taller or equal mode (letterboxable), then the connector's
/// preferred mode, then the first mode in the list. Interlaced modes are
/// never selected.
pub fn select_mode(modes: &[ModeInfo], width: u32, height: u32, hz: u32) -> Option<ModeInfo> {
    let progressive: Vec<&ModeInfo> = modes.iter().filter(|m| !m.interlaced).collect();
    if progressive.is_empty() {
        return None;
    }

    if let Some(m) = progressive
        .iter()
        .find(|m| m.width == width && m.height == height && m.hz == hz)
    {
        return Some(**m);
    }
    if let Some(m) = progressive
        .iter()
        .find(|m| m.width == width && m.height == height)
    {
        return Some(**m);
    }
    if let Some(m) = progressive
        .iter()
        .filter(|m| m.width == width && m.height >= height)
        .min_by_key(|m| m.height)
    {
        return Some(**m);
    }
    if let Some(m) = progressive.iter().find(|m| m.preferred) {
        return Some(**m);
    }
    Some(*progressive[0])
}

/// Whether a capture resolution mounts as DMA (possibly letterboxed), falls
/// back to a stub, or is outright incompatible with the chosen mode.
pub fn dma_fit(capture_width: u32, capture_height: u32, mode: ModeInfo) -> Result<(), StubReason> {
    if capture_width != mode.width {
        return Err(StubReason::BadResolution);
    }
    if capture_height > mode.height {
        return Err(StubReason::BadResolution);
    }
    Ok(())
}

/// Display runtime state machine. Generic over a `Backend` so the KMS ioctl
/// calls can be swapped for an in-memory fake in tests.
pub struct DisplayRuntime<B: DisplayBackend> {
    backend: B,
    state: DisplayState,
    has_vsync: bool,
    exposing_dma_index: Option<usize>,
    stub_rotation: VecDeque<usize>,
    open_stub_reason: Option<StubReason>,
}

/// The KMS operations a `DisplayRuntime` needs, factored out so tests can
/// supply an in-memory double instead of touching `/dev/dri`.
pub trait DisplayBackend: Send {
    fn probe_connector(&mut self) -> Result<ConnectorStatus, DisplayError>;
    fn enumerate_modes(&mut self) -> Result<Vec<ModeInfo>, DisplayError>;
    fn allocate_dma_buffers(&mut self, buffer_count: usize, mode: ModeInfo) -> Result<(), DisplayError>;
    fn allocate_stub_buffers(&mut self, mode: ModeInfo) -> Result<(), DisplayError>;
    fn set_mode(&mut self, mode: ModeInfo, buffer_index: usize) -> Result<(), DisplayError>;
    fn page_flip_dma(&mut self, hw: &HardwareBuffer) -> Result<(), DisplayError>;
    fn page_flip_stub(&mut self, buffer_index: usize, rasterizer: &dyn TextRasterizer, caption: &str) -> Result<(), DisplayError>;
    fn pump_events(&mut self, timeout: Duration) -> Result<bool, DisplayError>;
    fn dpms_off(&mut self) -> Result<(), DisplayError>;
}

impl<B: DisplayBackend> DisplayRuntime<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: DisplayState::Closed,
            has_vsync: true,
            exposing_dma_index: None,
            stub_rotation: (0..4).collect(),
            open_stub_reason: None,
        }
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// Why `open_for_capture` landed in `OpenForStub` rather than
    /// `OpenForDma`, if it did. `None` in `OpenForDma` or `Closed`.
    pub fn stub_reason(&self) -> Option<StubReason> {
        self.open_stub_reason
    }

    /// Opens the mirror for a capture resolution, mounting `OpenForDma` when
    /// the connector, format, and mode line up, otherwise falling back to a
    /// reason-coded stub.
    pub fn open_for_capture(
        &mut self,
        width: u32,
        height: u32,
        hz: u32,
        format_is_rgb24: bool,
        buffer_count: usize,
    ) -> Result<(), DisplayError> {
        if self.backend.probe_connector()? == ConnectorStatus::Disconnected {
            return Err(DisplayError::Unplugged);
        }

        let modes = self.backend.enumerate_modes()?;
        let mode = select_mode(&modes, width, height, hz).ok_or(DisplayError::NoMode)?;

        let stub_reason = if !format_is_rgb24 {
            Some(StubReason::BadFormat)
        } else {
            dma_fit(width, height, mode).err()
        };

        match stub_reason {
            None => {
                self.backend.allocate_dma_buffers(buffer_count, mode)?;
                self.backend.set_mode(mode, 0)?;
                self.state = DisplayState::OpenForDma;
                self.open_stub_reason = None;
            }
            Some(reason) => {
                self.backend.allocate_stub_buffers(mode)?;
                self.backend.set_mode(mode, 0)?;
                self.state = DisplayState::OpenForStub;
                self.open_stub_reason = Some(reason);
            }
        }
        self.has_vsync = true;
        Ok(())
    }

    /// Opens directly into stub mode, for a configuration with no capture
    /// device wired in at all.
    pub fn open_for_stub_only(&mut self) -> Result<(), DisplayError> {
        if self.backend.probe_connector()? == ConnectorStatus::Disconnected {
            return Err(DisplayError::Unplugged);
        }
        let modes = self.backend.enumerate_modes()?;
        let mode = modes
            .iter()
            .find(|m| m.preferred && !m.interlaced)
            .or_else(|| modes.iter().find(|m| !m.interlaced))
            .copied()
            .ok_or(DisplayError::NoMode)?;
        self.backend.allocate_stub_buffers(mode)?;
        self.backend.set_mode(mode, 0)?;
        self.state = DisplayState::OpenForStub;
        self.open_stub_reason = Some(StubReason::User);
        self.has_vsync = true;
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = DisplayState::Closed;
        self.has_vsync = true;
        self.exposing_dma_index = None;
        self.open_stub_reason = None;
    }

    pub fn expose_dma(&mut self, hw: &HardwareBuffer) -> Result<(), DisplayError> {
        if self.state != DisplayState::OpenForDma {
            return Err(DisplayError::WrongState(self.state));
        }
        self.backend.page_flip_dma(hw)?;
        self.has_vsync = false;
        self.exposing_dma_index = Some(hw.index);
        Ok(())
    }

    pub fn expose_stub(
        &mut self,
        reason: StubReason,
        caption_extra: &str,
        rasterizer: &dyn TextRasterizer,
    ) -> Result<(), DisplayError> {
        if self.state != DisplayState::OpenForStub {
            return Err(DisplayError::WrongState(self.state));
        }
        let idx = self.stub_rotation.pop_front().unwrap_or(0);
        self.stub_rotation.push_back(idx);
        let caption = if caption_extra.is_empty() {
            reason.caption(0, 0, 0)
        } else {
            format!("{} {}", reason.caption(0, 0, 0), caption_extra)
        };
        self.backend.page_flip_stub(idx, rasterizer, &caption)?;
        self.has_vsync = false;
        Ok(())
    }

    /// Blocks (bounded by `timeout`) until the most recent page-flip's
    /// vsync event has been observed.
    pub fn wait_for_vsync(&mut self, timeout: Duration) -> Result<(), DisplayError> {
        if self.has_vsync {
            return Ok(());
        }
        let got_event = self.backend.pump_events(timeout)?;
        if !got_event {
            return Err(DisplayError::Timeout);
        }
        self.has_vsync = true;
        self.exposing_dma_index = None;
        Ok(())
    }

    pub fn dpms_power_off(&mut self) -> Result<(), DisplayError> {
        self.backend.dpms_off()
    }
}
