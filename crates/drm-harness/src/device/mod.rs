// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! The kernel seam.
//!
//! Every component talks to a display device through [`Device`], a thin
//! set of DRM primitives returning raw errno values. [`KernelBackend`] drives
//! real `/dev/dri/card*` nodes; [`VirtualBus`] provides in-process devices
//! with configurable topology for dry runs and for the test-suite.

pub mod ioctl;
mod kernel;
mod virtual_device;

pub use kernel::KernelBackend;
pub use virtual_device::{VirtualBus, VirtualDevice, VirtualObjects, VirtualTopology};

use crate::buffer::Mapping;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

pub use ioctl::{
    DRM_MODE_ATOMIC_ALLOW_MODESET as ATOMIC_ALLOW_MODESET,
    DRM_MODE_ATOMIC_NONBLOCK as ATOMIC_NONBLOCK, DRM_MODE_ATOMIC_TEST_ONLY as ATOMIC_TEST_ONLY,
};

/// Kinds of mode objects that carry atomic properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Crtc,
    Connector,
    Plane,
}

impl ObjectKind {
    pub(crate) fn raw(self) -> u32 {
        match self {
            ObjectKind::Crtc => ioctl::DRM_MODE_OBJECT_CRTC,
            ObjectKind::Connector => ioctl::DRM_MODE_OBJECT_CONNECTOR,
            ObjectKind::Plane => ioctl::DRM_MODE_OBJECT_PLANE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: u32,
}

impl ObjectRef {
    pub fn crtc(id: u32) -> Self {
        Self {
            kind: ObjectKind::Crtc,
            id,
        }
    }

    pub fn connector(id: u32) -> Self {
        Self {
            kind: ObjectKind::Connector,
            id,
        }
    }

    pub fn plane(id: u32) -> Self {
        Self {
            kind: ObjectKind::Plane,
            id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

impl Connection {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Connection::Connected,
            2 => Connection::Disconnected,
            _ => Connection::Unknown,
        }
    }
}

/// Plane type as reported by the immutable `type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

impl PlaneType {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            PlaneType::Overlay => 0,
            PlaneType::Primary => 1,
            PlaneType::Cursor => 2,
        }
    }
}

/// A display mode with its timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: String,
}

impl ModeInfo {
    pub fn is_preferred(&self) -> bool {
        self.type_ & ioctl::DRM_MODE_TYPE_PREFERRED != 0
    }

    pub(crate) fn from_raw(raw: &ioctl::DrmModeModeInfo) -> Self {
        let len = raw.name.iter().position(|&b| b == 0).unwrap_or(raw.name.len());
        Self {
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vrefresh: raw.vrefresh,
            flags: raw.flags,
            type_: raw.type_,
            name: String::from_utf8_lossy(&raw.name[..len]).into_owned(),
        }
    }

    pub(crate) fn to_raw(&self) -> ioctl::DrmModeModeInfo {
        let mut name = [0u8; 32];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(31);
        name[..len].copy_from_slice(&bytes[..len]);
        ioctl::DrmModeModeInfo {
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: 0,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: 0,
            vrefresh: self.vrefresh,
            flags: self.flags,
            type_: self.type_,
            name,
        }
    }

    /// Serialise into the `drm_mode_modeinfo` layout expected by a `MODE_ID` blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let raw = self.to_raw();
        let mut out = Vec::with_capacity(68);
        out.extend_from_slice(&raw.clock.to_ne_bytes());
        for v in [
            raw.hdisplay,
            raw.hsync_start,
            raw.hsync_end,
            raw.htotal,
            raw.hskew,
            raw.vdisplay,
            raw.vsync_start,
            raw.vsync_end,
            raw.vtotal,
            raw.vscan,
        ] {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        out.extend_from_slice(&raw.vrefresh.to_ne_bytes());
        out.extend_from_slice(&raw.flags.to_ne_bytes());
        out.extend_from_slice(&raw.type_.to_ne_bytes());
        out.extend_from_slice(&raw.name);
        out
    }

    pub fn from_blob(data: &[u8]) -> Option<Self> {
        if data.len() != 68 {
            return None;
        }
        let u32_at = |o: usize| u32::from_ne_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let u16_at = |o: usize| u16::from_ne_bytes([data[o], data[o + 1]]);
        let mut name = [0u8; 32];
        name.copy_from_slice(&data[36..68]);
        let raw = ioctl::DrmModeModeInfo {
            clock: u32_at(0),
            hdisplay: u16_at(4),
            hsync_start: u16_at(6),
            hsync_end: u16_at(8),
            htotal: u16_at(10),
            hskew: u16_at(12),
            vdisplay: u16_at(14),
            vsync_start: u16_at(16),
            vsync_end: u16_at(18),
            vtotal: u16_at(20),
            vscan: u16_at(22),
            vrefresh: u32_at(24),
            flags: u32_at(28),
            type_: u32_at(32),
            name,
        };
        Some(Self::from_raw(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardResources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: Connection,
    pub mm_width: u32,
    pub mm_height: u32,
    pub modes: Vec<ModeInfo>,
    pub encoder_id: Option<u32>,
    /// CRTC currently driving this connector, resolved through its encoder.
    pub crtc_id: Option<u32>,
}

impl ConnectorInfo {
    pub fn preferred_mode(&self) -> Option<&ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.is_preferred())
            .or_else(|| self.modes.first())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub mode: Option<ModeInfo>,
    pub gamma_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    pub plane_type: PlaneType,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

impl PlaneInfo {
    /// Whether the plane can be attached to the CRTC at `crtc_index` in the
    /// card's resource list.
    pub fn supports_crtc_index(&self, crtc_index: usize) -> bool {
        crtc_index < 32 && self.possible_crtcs & (1 << crtc_index) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub value: u64,
}

/// Result of a dumb-buffer allocation. `size` is the kernel's figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSpec {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub handle: u32,
    pub pitch: u32,
    pub modifier: Option<u64>,
}

/// One `(object, property, value)` triple of an atomic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyValue {
    pub object: u32,
    pub property: u32,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    /// Identity ramp spanning the full 16-bit range.
    pub fn linear(size: usize) -> Self {
        let step = |i: usize| -> u16 {
            if size <= 1 {
                0
            } else {
                ((i as u64 * 0xffff) / (size as u64 - 1)) as u16
            }
        };
        let channel: Vec<u16> = (0..size).map(step).collect();
        Self {
            red: channel.clone(),
            green: channel.clone(),
            blue: channel,
        }
    }

    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }
}

/// Primitive operations on one opened display device.
///
/// Errors are raw errno values; callers attach meaning.
pub trait Device {
    /// Node path or virtual device name, used in diagnostics.
    fn path(&self) -> &str;

    fn resources(&self) -> nix::Result<CardResources>;
    fn connector(&self, id: u32) -> nix::Result<ConnectorInfo>;
    fn crtc(&self, id: u32) -> nix::Result<CrtcInfo>;
    fn plane_ids(&self) -> nix::Result<Vec<u32>>;
    fn plane(&self, id: u32) -> nix::Result<PlaneInfo>;
    fn properties(&self, object: ObjectRef) -> nix::Result<Vec<Property>>;

    /// Modifiers reported through the plane's `IN_FORMATS` blob, or `None`
    /// when the device has no such report.
    fn plane_modifiers(&self, plane: u32) -> nix::Result<Option<Vec<u64>>>;

    fn create_blob(&self, data: &[u8]) -> nix::Result<u32>;
    fn destroy_blob(&self, id: u32) -> nix::Result<()>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> nix::Result<DumbBuffer>;
    /// Size in bytes of the memory behind a handle.
    fn handle_size(&self, handle: u32) -> nix::Result<u64>;
    fn map(&self, handle: u32, size: usize) -> nix::Result<Mapping>;
    fn close_handle(&self, handle: u32) -> nix::Result<()>;
    fn export_fd(&self, handle: u32) -> nix::Result<OwnedFd>;
    fn import_fd(&self, fd: BorrowedFd<'_>) -> nix::Result<u32>;

    fn add_framebuffer(&self, fb: &FramebufferSpec) -> nix::Result<u32>;
    fn remove_framebuffer(&self, id: u32) -> nix::Result<()>;
    fn atomic_commit(&self, values: &[PropertyValue], flags: u32) -> nix::Result<()>;

    /// Wait for the next vertical blank on the CRTC at `crtc_index`; returns
    /// its sequence number, or `ETIME` once `timeout` elapses.
    fn wait_vblank(&self, crtc_index: u32, timeout: Duration) -> nix::Result<u32>;

    fn syncobj_create(&self, signaled: bool) -> nix::Result<u32>;
    fn syncobj_signal(&self, handle: u32) -> nix::Result<()>;
    /// Returns `ETIME` if the object is still unsignaled after `timeout`.
    fn syncobj_wait(&self, handle: u32, timeout: Duration) -> nix::Result<()>;
    fn syncobj_destroy(&self, handle: u32) -> nix::Result<()>;

    fn gamma(&self, crtc: u32, size: u32) -> nix::Result<GammaRamp>;
    fn set_gamma(&self, crtc: u32, ramp: &GammaRamp) -> nix::Result<()>;
}

/// Opens display devices by index.
pub trait Backend {
    fn open(&self, index: u32) -> crate::Result<Box<dyn Device>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_1080p() -> ModeInfo {
        ModeInfo {
            clock: 148_500,
            hdisplay: 1920,
            hsync_start: 2008,
            hsync_end: 2052,
            htotal: 2200,
            vdisplay: 1080,
            vsync_start: 1084,
            vsync_end: 1089,
            vtotal: 1125,
            vrefresh: 60,
            flags: 0x5,
            type_: ioctl::DRM_MODE_TYPE_PREFERRED,
            name: "1920x1080".into(),
        }
    }

    #[test]
    fn mode_blob_layout() {
        let mode = mode_1080p();
        let blob = mode.to_blob();
        assert_eq!(blob.len(), std::mem::size_of::<ioctl::DrmModeModeInfo>());
        assert_eq!(ModeInfo::from_blob(&blob), Some(mode));
        assert_eq!(ModeInfo::from_blob(&blob[..60]), None);
    }

    #[test]
    fn preferred_mode_falls_back_to_first() {
        let mut other = mode_1080p();
        other.type_ = 0;
        other.name = "1280x720".into();
        let mut connector = ConnectorInfo {
            id: 1,
            connector_type: 0,
            connector_type_id: 1,
            connection: Connection::Connected,
            mm_width: 0,
            mm_height: 0,
            modes: vec![other.clone(), mode_1080p()],
            encoder_id: None,
            crtc_id: None,
        };
        assert_eq!(connector.preferred_mode().unwrap().name, "1920x1080");
        connector.modes = vec![other];
        assert_eq!(connector.preferred_mode().unwrap().name, "1280x720");
    }

    #[test]
    fn linear_gamma_ramp_spans_range() {
        let ramp = GammaRamp::linear(256);
        assert_eq!(ramp.len(), 256);
        assert_eq!(ramp.red[0], 0);
        assert_eq!(ramp.green[255], 0xffff);
        assert!(ramp.blue.windows(2).all(|w| w[0] <= w[1]));
        assert!(GammaRamp::linear(0).is_empty());
    }

    #[test]
    fn plane_crtc_mask() {
        let plane = PlaneInfo {
            id: 31,
            plane_type: PlaneType::Primary,
            crtc_id: 0,
            fb_id: 0,
            possible_crtcs: 0b101,
            formats: vec![],
        };
        assert!(plane.supports_crtc_index(0));
        assert!(!plane.supports_crtc_index(1));
        assert!(plane.supports_crtc_index(2));
        assert!(!plane.supports_crtc_index(40));
    }
}
