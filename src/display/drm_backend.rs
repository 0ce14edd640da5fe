//! The real `DisplayBackend`: a DRM/KMS card opened at a fixed path, driving
//! one connector with dumb-buffer stub framebuffers and PRIME-imported
//! capture buffers for the zero-copy path.
//!
//! Connector presence is read from sysfs first (`ConnectorStatusProbe`,
//! cheap and does not require a DRM ioctl round trip) and only falls back to
//! `connector::Info::state()` when the sysfs file is missing, e.g. on a
//! non-Linux CI sandbox that still has a DRM render node.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{connector, crtc, dumbbuffer::DumbBuffer, framebuffer, Device as ControlDevice, Event, Mode, PageFlipFlags};
use drm::Device as BasicDevice;
use drm_fourcc::DrmFourcc;

use super::sysfs::{ConnectorStatus as SysfsStatus, ConnectorStatusProbe};
use super::{ConnectorStatus, DisplayBackend, DisplayError, ModeInfo};
use crate::device::HardwareBuffer;
use crate::text::TextRasterizer;

const STUB_BUFFER_COUNT: usize = 4;
const FB_DEPTH: u32 = 24;
const FB_BPP: u32 = 24;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// A framebuffer minted directly from a PRIME-imported GEM handle, with no
/// backing dumb-buffer allocation of its own: the handle's memory belongs to
/// the V4L2 capture buffer it came from.
struct PrimeBuffer {
    handle: drm::buffer::Handle,
    width: u32,
    height: u32,
    pitch: u32,
}

impl DrmBuffer for PrimeBuffer {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
    fn format(&self) -> DrmFourcc {
        DrmFourcc::Rgb888
    }
    fn pitch(&self) -> u32 {
        self.pitch
    }
    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

struct StubSlot {
    buffer: DumbBuffer,
    fb: framebuffer::Handle,
}

/// What is currently bound to the CRTC, so the backend knows whether the
/// framebuffer it is about to replace owns a PRIME import that must be
/// released, or is one of the persistent stub slots that must not be.
enum ScannedOut {
    Dma(framebuffer::Handle),
    Stub,
}

pub struct KmsBackend {
    card: Card,
    connector: connector::Handle,
    crtc: crtc::Handle,
    sysfs: Option<ConnectorStatusProbe>,
    cached_modes: Vec<Mode>,
    mode: Option<Mode>,
    crtc_active: bool,
    scanned_out: Option<ScannedOut>,
    inflight: Option<ScannedOut>,
    stub_slots: Vec<StubSlot>,
}

impl KmsBackend {
    /// Opens `path` (typically `/dev/dri/cardN`) and binds to the connector
    /// named `port` (e.g. `"HDMI-A-1"`), falling back to the first connector
    /// reported by the card if no name matches.
    pub fn open(path: &str, port: &str) -> Result<Self, DisplayError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let card = Card(file);

        let handles = card.resource_handles().map_err(DisplayError::Io)?;
        let mut chosen = None;
        for handle in handles.connectors() {
            let info = card.get_connector(*handle, false).map_err(DisplayError::Io)?;
            let name = connector_name(&info);
            if name.eq_ignore_ascii_case(port) {
                chosen = Some(*handle);
                break;
            }
        }
        let connector = chosen
            .or_else(|| handles.connectors().first().copied())
            .ok_or(DisplayError::NoMode)?;

        let crtc = *handles.crtcs().first().ok_or(DisplayError::NoMode)?;
        let sysfs = card_minor_from_path(path).and_then(|minor| ConnectorStatusProbe::open(minor, port).ok());

        Ok(Self {
            card,
            connector,
            crtc,
            sysfs,
            cached_modes: Vec::new(),
            mode: None,
            crtc_active: false,
            scanned_out: None,
            inflight: None,
            stub_slots: Vec::new(),
        })
    }

    fn native_mode(&self, mode: ModeInfo) -> Result<Mode, DisplayError> {
        self.cached_modes
            .iter()
            .find(|m| {
                let (w, h) = m.size();
                w as u32 == mode.width && h as u32 == mode.height && m.vrefresh() == mode.hz
            })
            .copied()
            .ok_or(DisplayError::NoMode)
    }

    fn bind_or_flip(&mut self, fb: framebuffer::Handle, scanned_out: ScannedOut) -> Result<(), DisplayError> {
        if !self.crtc_active {
            let mode = self.mode.ok_or(DisplayError::NoMode)?;
            self.card
                .set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], Some(mode))
                .map_err(DisplayError::Io)?;
            self.crtc_active = true;
            self.scanned_out = Some(scanned_out);
        } else {
            self.card
                .page_flip(self.crtc, fb, PageFlipFlags::EVENT | PageFlipFlags::ASYNC, None)
                .map_err(DisplayError::Io)?;
            self.inflight = Some(scanned_out);
        }
        Ok(())
    }
}

impl DisplayBackend for KmsBackend {
    fn probe_connector(&mut self) -> Result<ConnectorStatus, DisplayError> {
        if let Some(probe) = self.sysfs.as_mut() {
            if let Ok(status) = probe.read() {
                return Ok(match status {
                    SysfsStatus::Connected => ConnectorStatus::Connected,
                    SysfsStatus::Disconnected => ConnectorStatus::Disconnected,
                    SysfsStatus::Unknown => ConnectorStatus::Unknown,
                });
            }
        }
        let info = self.card.get_connector(self.connector, false).map_err(DisplayError::Io)?;
        Ok(match info.state() {
            connector::State::Connected => ConnectorStatus::Connected,
            connector::State::Disconnected => ConnectorStatus::Disconnected,
            connector::State::Unknown => ConnectorStatus::Unknown,
        })
    }

    fn enumerate_modes(&mut self) -> Result<Vec<ModeInfo>, DisplayError> {
        let info = self.card.get_connector(self.connector, true).map_err(DisplayError::Io)?;
        self.cached_modes = info.modes().to_vec();
        Ok(self
            .cached_modes
            .iter()
            .map(|m| {
                let (w, h) = m.size();
                ModeInfo {
                    width: w as u32,
                    height: h as u32,
                    hz: m.vrefresh(),
                    preferred: m.mode_type().contains(drm::control::ModeTypeFlags::PREFERRED),
                    interlaced: m.flags().contains(drm::control::ModeFlags::INTERLACE),
                }
            })
            .collect())
    }

    fn allocate_dma_buffers(&mut self, _buffer_count: usize, mode: ModeInfo) -> Result<(), DisplayError> {
        self.mode = Some(self.native_mode(mode)?);
        self.crtc_active = false;
        Ok(())
    }

    fn allocate_stub_buffers(&mut self, mode: ModeInfo) -> Result<(), DisplayError> {
        let native = self.native_mode(mode)?;
        self.mode = Some(native);
        self.crtc_active = false;
        self.stub_slots.clear();

        for _ in 0..STUB_BUFFER_COUNT {
            let buffer = self
                .card
                .create_dumb_buffer((mode.width, mode.height), DrmFourcc::Rgb888, FB_BPP)
                .map_err(DisplayError::Io)?;
            let fb = self
                .card
                .add_framebuffer(&buffer, FB_DEPTH, FB_BPP)
                .map_err(DisplayError::Io)?;
            self.stub_slots.push(StubSlot { buffer, fb });
        }
        Ok(())
    }

    fn set_mode(&mut self, mode: ModeInfo, _buffer_index: usize) -> Result<(), DisplayError> {
        self.mode = Some(self.native_mode(mode)?);
        Ok(())
    }

    fn page_flip_dma(&mut self, hw: &HardwareBuffer) -> Result<(), DisplayError> {
        let fd = hw.dma_fd.as_ref().ok_or(DisplayError::NoDmaFd)?;
        let handle = self
            .card
            .prime_fd_to_handle(fd.as_raw_fd())
            .map_err(DisplayError::Io)?;
        let prime = PrimeBuffer {
            handle,
            width: hw.frame.width,
            height: hw.frame.height,
            pitch: hw.frame.stride,
        };
        let fb = self
            .card
            .add_framebuffer(&prime, FB_DEPTH, FB_BPP)
            .map_err(DisplayError::Io)?;
        self.bind_or_flip(fb, ScannedOut::Dma(fb))
    }

    fn page_flip_stub(&mut self, buffer_index: usize, rasterizer: &dyn TextRasterizer, caption: &str) -> Result<(), DisplayError> {
        let mode = self.mode.ok_or(DisplayError::NoMode)?;
        let (width, height) = mode.size();
        let slot = self
            .stub_slots
            .get_mut(buffer_index % self.stub_slots.len().max(1))
            .ok_or(DisplayError::NoMode)?;
        let pitch = slot.buffer.pitch();
        let fb = slot.fb;
        {
            let mut mapping = self.card.map_dumb_buffer(&mut slot.buffer).map_err(DisplayError::Io)?;
            rasterizer.render(caption, &mut mapping, width as u32, height as u32, pitch);
        }
        self.bind_or_flip(fb, ScannedOut::Stub)
    }

    fn pump_events(&mut self, timeout: Duration) -> Result<bool, DisplayError> {
        let fd = self.card.as_fd().as_raw_fd();
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
        if ready <= 0 {
            return Ok(false);
        }

        let events = self.card.receive_events().map_err(DisplayError::Io)?;
        let mut saw_flip = false;
        for event in events {
            if let Event::PageFlip(_) = event {
                saw_flip = true;
            }
        }
        if saw_flip {
            if let Some(new) = self.inflight.take() {
                if let Some(ScannedOut::Dma(old_fb)) = self.scanned_out.replace(new) {
                    if let Err(err) = self.card.destroy_framebuffer(old_fb) {
                        tracing::debug!(error = %err, "failed to destroy retired framebuffer");
                    }
                }
            }
        }
        Ok(saw_flip)
    }

    fn dpms_off(&mut self) -> Result<(), DisplayError> {
        let props = self.card.get_properties(self.connector).map_err(DisplayError::Io)?;
        for (prop_handle, _) in props.as_hashmap().iter().map(|(k, v)| (*k, *v)) {
            let info = self.card.get_property(prop_handle).map_err(DisplayError::Io)?;
            if info.name().to_string_lossy() == "DPMS" {
                self.card
                    .set_property(self.connector, prop_handle, 3)
                    .map_err(DisplayError::Io)?;
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Maps a connector's interface/interface-id pair to the sysfs-style name
/// used both in configuration (`port = "HDMI-A-1"`) and in
/// `/sys/class/drm/card*-*`.
fn connector_name(info: &connector::Info) -> String {
    use connector::Interface;
    let prefix = match info.interface() {
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::DisplayPort => "DP",
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::USB => "USB",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Writeback => "Writeback",
        Interface::SPI => "SPI",
        _ => "Unknown",
    };
    format!("{prefix}-{}", info.interface_id())
}

fn card_minor_from_path(path: &str) -> Option<u32> {
    let file_name = std::path::Path::new(path).file_name()?.to_str()?;
    let digits: String = file_name.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
