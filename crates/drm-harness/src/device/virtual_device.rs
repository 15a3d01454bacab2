// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! In-process display devices.
//!
//! A [`VirtualDevice`] models one card with a single CRTC, connector and
//! encoder plus a configurable set of planes. Buffers are backed by memfd, so
//! exported descriptors are real file descriptors and two virtual devices on
//! the same [`VirtualBus`] share memory exactly like PRIME does. Atomic
//! requests are validated in full before any state changes.

use super::ioctl::{DRM_MODE_ATOMIC_ALLOW_MODESET, DRM_MODE_ATOMIC_TEST_ONLY, DRM_MODE_TYPE_PREFERRED};
use super::{
    Backend, CardResources, Connection, ConnectorInfo, CrtcInfo, Device, DumbBuffer,
    FramebufferSpec, GammaRamp, ModeInfo, ObjectKind, ObjectRef, PlaneInfo, PlaneType, Property,
    PropertyValue,
};
use crate::buffer::Mapping;
use crate::error::{Error, Result};
use crate::format::{Modifier, PixelFormat};
use log::{debug, trace};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::rc::Rc;
use std::time::Duration;

const ENCODER_ID: u32 = 20;
const CRTC_ID: u32 = 40;
const CONNECTOR_ID: u32 = 50;
const FIRST_PLANE_ID: u32 = 60;
const FIRST_PROPERTY_ID: u32 = 100;
const FIRST_BLOB_ID: u32 = 1000;
const FIRST_FB_ID: u32 = 2000;
const PAGE_SIZE: u64 = 4096;
const DRM_MODE_CONNECTOR_VIRTUAL: u32 = 15;

/// Shape and behaviour of a virtual card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTopology {
    /// Reported connector state.
    pub connected: bool,
    /// Whether the connector's encoder is bound to the CRTC at start-up.
    pub crtc_bound: bool,
    /// Planes in id order, all attachable to the single CRTC.
    pub planes: Vec<PlaneType>,
    pub max_width: u32,
    pub max_height: u32,
    /// The connector's only (preferred) mode, also the initial CRTC mode.
    pub mode: ModeInfo,
    pub mm_width: u32,
    pub mm_height: u32,
    /// Scan-out formats accepted by every plane.
    pub formats: Vec<PixelFormat>,
    /// Modifiers reported through `IN_FORMATS`, `None` for no report.
    pub in_formats: Option<Vec<Modifier>>,
    /// Gamma LUT length; zero means no gamma support.
    pub gamma_size: u32,
    /// Whether VBLANK events are ever delivered.
    pub vblank: bool,
}

impl VirtualTopology {
    pub fn mode_1080p() -> ModeInfo {
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
            type_: DRM_MODE_TYPE_PREFERRED,
            name: "1920x1080".into(),
        }
    }
}

impl Default for VirtualTopology {
    fn default() -> Self {
        Self {
            connected: true,
            crtc_bound: true,
            planes: vec![PlaneType::Primary, PlaneType::Overlay, PlaneType::Cursor],
            max_width: 4096,
            max_height: 4096,
            mode: Self::mode_1080p(),
            mm_width: 520,
            mm_height: 290,
            formats: vec![
                PixelFormat::Argb8888,
                PixelFormat::Xrgb8888,
                PixelFormat::Rgb565,
                PixelFormat::Nv12,
                PixelFormat::Yuyv,
            ],
            in_formats: Some(vec![Modifier::LINEAR, Modifier::X_TILED]),
            gamma_size: 256,
            vblank: true,
        }
    }
}

/// Live kernel-side objects of a virtual card, for leak assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualObjects {
    pub handles: usize,
    pub framebuffers: usize,
    pub blobs: usize,
    pub syncobjs: usize,
}

struct VirtualBuffer {
    file: File,
    size: u64,
    key: (u64, u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PlaneState {
    fb_id: u32,
    crtc_id: u32,
    crtc_x: i32,
    crtc_y: i32,
    crtc_w: u32,
    crtc_h: u32,
    src_x: u32,
    src_y: u32,
    src_w: u32,
    src_h: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ModesetState {
    active: bool,
    mode_blob: u32,
    connector_crtc: u32,
    planes: Vec<PlaneState>,
}

struct State {
    topology: VirtualTopology,
    modeset: ModesetState,
    gamma: GammaRamp,
    vblank_sequence: u32,
    /// property id -> (object id, property name)
    properties: BTreeMap<u32, (u32, &'static str)>,
    buffers: HashMap<u32, VirtualBuffer>,
    next_handle: u32,
    /// Blobs owned by the client.
    blobs: HashMap<u32, Vec<u8>>,
    /// Blobs the client no longer owns but the CRTC still references.
    retained_blobs: HashMap<u32, Vec<u8>>,
    next_blob: u32,
    framebuffers: HashMap<u32, FramebufferSpec>,
    next_fb: u32,
    syncobjs: HashMap<u32, bool>,
    next_syncobj: u32,
}

const CRTC_PROPS: [&str; 2] = ["ACTIVE", "MODE_ID"];
const CONNECTOR_PROPS: [&str; 1] = ["CRTC_ID"];
const PLANE_PROPS: [&str; 11] = [
    "type", "FB_ID", "CRTC_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y",
    "SRC_W", "SRC_H",
];

fn io_errno(e: io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(nix::libc::EIO))
}

impl State {
    fn new(topology: VirtualTopology) -> Self {
        let mut properties = BTreeMap::new();
        let mut next = FIRST_PROPERTY_ID;
        let mut register = |object: u32, names: &[&'static str]| {
            for &name in names {
                properties.insert(next, (object, name));
                next += 1;
            }
        };
        register(CRTC_ID, &CRTC_PROPS);
        register(CONNECTOR_ID, &CONNECTOR_PROPS);
        for i in 0..topology.planes.len() {
            register(FIRST_PLANE_ID + i as u32, &PLANE_PROPS);
            if topology.in_formats.is_some() {
                register(FIRST_PLANE_ID + i as u32, &["IN_FORMATS"]);
            }
        }

        let mut retained_blobs = HashMap::new();
        let mode_blob = FIRST_BLOB_ID;
        retained_blobs.insert(mode_blob, topology.mode.to_blob());
        let bound = topology.connected && topology.crtc_bound;

        Self {
            modeset: ModesetState {
                active: bound,
                mode_blob: if bound { mode_blob } else { 0 },
                connector_crtc: if bound { CRTC_ID } else { 0 },
                planes: vec![PlaneState::default(); topology.planes.len()],
            },
            gamma: GammaRamp::linear(topology.gamma_size as usize),
            vblank_sequence: 0,
            properties,
            buffers: HashMap::new(),
            next_handle: 1,
            blobs: HashMap::new(),
            retained_blobs,
            next_blob: mode_blob + 1,
            framebuffers: HashMap::new(),
            next_fb: FIRST_FB_ID,
            syncobjs: HashMap::new(),
            next_syncobj: 1,
            topology,
        }
    }

    fn blob(&self, id: u32) -> Option<&Vec<u8>> {
        self.blobs.get(&id).or_else(|| self.retained_blobs.get(&id))
    }

    fn plane_index(&self, id: u32) -> Option<usize> {
        let index = id.checked_sub(FIRST_PLANE_ID)? as usize;
        (index < self.topology.planes.len()).then_some(index)
    }

    fn object_kind(&self, id: u32) -> Option<ObjectKind> {
        match id {
            CRTC_ID => Some(ObjectKind::Crtc),
            CONNECTOR_ID => Some(ObjectKind::Connector),
            _ => self.plane_index(id).map(|_| ObjectKind::Plane),
        }
    }

    fn property_value(&self, object: u32, name: &str) -> u64 {
        let m = &self.modeset;
        if object == CRTC_ID {
            return match name {
                "ACTIVE" => m.active as u64,
                "MODE_ID" => m.mode_blob as u64,
                _ => 0,
            };
        }
        if object == CONNECTOR_ID {
            return m.connector_crtc as u64;
        }
        let Some(index) = self.plane_index(object) else {
            return 0;
        };
        let p = &m.planes[index];
        match name {
            "type" => self.topology.planes[index].raw(),
            "FB_ID" => p.fb_id as u64,
            "CRTC_ID" => p.crtc_id as u64,
            "CRTC_X" => p.crtc_x as i64 as u64,
            "CRTC_Y" => p.crtc_y as i64 as u64,
            "CRTC_W" => p.crtc_w as u64,
            "CRTC_H" => p.crtc_h as u64,
            "SRC_X" => p.src_x as u64,
            "SRC_Y" => p.src_y as u64,
            "SRC_W" => p.src_w as u64,
            "SRC_H" => p.src_h as u64,
            // The IN_FORMATS blob is synthesised on read; see `plane_modifiers`.
            _ => 0,
        }
    }

    fn stage(&self, staged: &mut ModesetState, v: &PropertyValue) -> nix::Result<()> {
        let &(object, name) = self.properties.get(&v.property).ok_or(Errno::EINVAL)?;
        if object != v.object {
            return Err(Errno::EINVAL);
        }
        let as_u32 = |value: u64| u32::try_from(value).map_err(|_| Errno::ERANGE);
        match (self.object_kind(object), name) {
            (Some(ObjectKind::Crtc), "ACTIVE") => staged.active = v.value != 0,
            (Some(ObjectKind::Crtc), "MODE_ID") => staged.mode_blob = as_u32(v.value)?,
            (Some(ObjectKind::Connector), "CRTC_ID") => staged.connector_crtc = as_u32(v.value)?,
            (Some(ObjectKind::Plane), name) => {
                let index = self.plane_index(object).ok_or(Errno::ENOENT)?;
                let p = &mut staged.planes[index];
                match name {
                    "FB_ID" => p.fb_id = as_u32(v.value)?,
                    "CRTC_ID" => p.crtc_id = as_u32(v.value)?,
                    "CRTC_X" => p.crtc_x = v.value as i64 as i32,
                    "CRTC_Y" => p.crtc_y = v.value as i64 as i32,
                    "CRTC_W" => p.crtc_w = as_u32(v.value)?,
                    "CRTC_H" => p.crtc_h = as_u32(v.value)?,
                    "SRC_X" => p.src_x = as_u32(v.value)?,
                    "SRC_Y" => p.src_y = as_u32(v.value)?,
                    "SRC_W" => p.src_w = as_u32(v.value)?,
                    "SRC_H" => p.src_h = as_u32(v.value)?,
                    // immutable
                    _ => return Err(Errno::EINVAL),
                }
            }
            _ => return Err(Errno::EINVAL),
        }
        Ok(())
    }

    fn check(&self, staged: &ModesetState, flags: u32) -> nix::Result<()> {
        let current = &self.modeset;
        let modeset = staged.active != current.active
            || staged.mode_blob != current.mode_blob
            || staged.connector_crtc != current.connector_crtc;
        if modeset && flags & DRM_MODE_ATOMIC_ALLOW_MODESET == 0 {
            return Err(Errno::EINVAL);
        }
        if staged.connector_crtc != 0 && staged.connector_crtc != CRTC_ID {
            return Err(Errno::EINVAL);
        }
        if staged.active {
            let blob = self.blob(staged.mode_blob).ok_or(Errno::EINVAL)?;
            let mode = ModeInfo::from_blob(blob).ok_or(Errno::EINVAL)?;
            if u32::from(mode.hdisplay) > self.topology.max_width
                || u32::from(mode.vdisplay) > self.topology.max_height
            {
                return Err(Errno::EINVAL);
            }
        } else if staged.mode_blob != 0 && self.blob(staged.mode_blob).is_none() {
            return Err(Errno::EINVAL);
        }

        for p in &staged.planes {
            if p.fb_id == 0 {
                continue;
            }
            let fb = self.framebuffers.get(&p.fb_id).ok_or(Errno::ENOENT)?;
            if p.crtc_id != CRTC_ID || !staged.active {
                return Err(Errno::EINVAL);
            }
            let format = PixelFormat::from_code(fb.format).ok_or(Errno::EINVAL)?;
            if !self.topology.formats.contains(&format) {
                return Err(Errno::EINVAL);
            }
            if p.crtc_w == 0
                || p.crtc_h == 0
                || p.crtc_w > self.topology.max_width
                || p.crtc_h > self.topology.max_height
            {
                return Err(Errno::EINVAL);
            }
            let src_right = (u64::from(p.src_x) + u64::from(p.src_w)) >> 16;
            let src_bottom = (u64::from(p.src_y) + u64::from(p.src_h)) >> 16;
            if src_right > u64::from(fb.width) || src_bottom > u64::from(fb.height) {
                return Err(Errno::ENOSPC);
            }
        }
        Ok(())
    }
}

/// One virtual card. Cloning yields another handle to the same card.
#[derive(Clone)]
pub struct VirtualDevice {
    name: Rc<str>,
    state: Rc<RefCell<State>>,
}

impl VirtualDevice {
    pub fn new(name: impl Into<String>, topology: VirtualTopology) -> Self {
        Self {
            name: name.into().into(),
            state: Rc::new(RefCell::new(State::new(topology))),
        }
    }

    /// Counts of live handles, framebuffers, user blobs and syncobjs.
    pub fn objects(&self) -> VirtualObjects {
        let st = self.state.borrow();
        VirtualObjects {
            handles: st.buffers.len(),
            framebuffers: st.framebuffers.len(),
            // the initial mode blob belongs to the card
            blobs: st.blobs.len(),
            syncobjs: st.syncobjs.len(),
        }
    }

    /// Current CRTC state, for comparing before and after a commit.
    pub fn crtc_state(&self) -> CrtcInfo {
        let st = self.state.borrow();
        Self::crtc_info(&st)
    }

    /// The `ADDFB2` request behind a live framebuffer.
    pub fn framebuffer(&self, id: u32) -> Option<FramebufferSpec> {
        self.state.borrow().framebuffers.get(&id).copied()
    }

    /// Framebuffer currently scanned out by the plane with this id, if any.
    pub fn plane_framebuffer(&self, plane: u32) -> Option<u32> {
        let st = self.state.borrow();
        let index = st.plane_index(plane)?;
        let fb = st.modeset.planes[index].fb_id;
        (fb != 0).then_some(fb)
    }

    /// Plug or unplug the display.
    pub fn set_connected(&self, connected: bool) {
        self.state.borrow_mut().topology.connected = connected;
    }

    /// Swap in a panel of a different physical size.
    pub fn set_physical_size(&self, mm_width: u32, mm_height: u32) {
        let mut st = self.state.borrow_mut();
        st.topology.mm_width = mm_width;
        st.topology.mm_height = mm_height;
    }

    /// Replace the gamma table behind the harness's back.
    pub fn load_gamma(&self, ramp: GammaRamp) {
        self.state.borrow_mut().gamma = ramp;
    }

    fn crtc_info(st: &State) -> CrtcInfo {
        let mode = if st.modeset.active {
            st.blob(st.modeset.mode_blob)
                .and_then(|b| ModeInfo::from_blob(b))
        } else {
            None
        };
        let primary = st
            .topology
            .planes
            .iter()
            .position(|&t| t == PlaneType::Primary);
        CrtcInfo {
            id: CRTC_ID,
            fb_id: primary.map_or(0, |i| st.modeset.planes[i].fb_id),
            x: 0,
            y: 0,
            mode,
            gamma_size: st.topology.gamma_size,
        }
    }

    fn buffer_file(&self, handle: u32) -> nix::Result<File> {
        let st = self.state.borrow();
        let buffer = st.buffers.get(&handle).ok_or(Errno::ENOENT)?;
        buffer.file.try_clone().map_err(io_errno)
    }
}

impl Device for VirtualDevice {
    fn path(&self) -> &str {
        &self.name
    }

    fn resources(&self) -> nix::Result<CardResources> {
        let st = self.state.borrow();
        Ok(CardResources {
            crtcs: vec![CRTC_ID],
            connectors: vec![CONNECTOR_ID],
            encoders: vec![ENCODER_ID],
            min_width: 1,
            max_width: st.topology.max_width,
            min_height: 1,
            max_height: st.topology.max_height,
        })
    }

    fn connector(&self, id: u32) -> nix::Result<ConnectorInfo> {
        if id != CONNECTOR_ID {
            return Err(Errno::ENOENT);
        }
        let st = self.state.borrow();
        let bound = st.modeset.connector_crtc != 0;
        Ok(ConnectorInfo {
            id,
            connector_type: DRM_MODE_CONNECTOR_VIRTUAL,
            connector_type_id: 1,
            connection: if st.topology.connected {
                Connection::Connected
            } else {
                Connection::Disconnected
            },
            mm_width: st.topology.mm_width,
            mm_height: st.topology.mm_height,
            modes: if st.topology.connected {
                vec![st.topology.mode.clone()]
            } else {
                Vec::new()
            },
            encoder_id: bound.then_some(ENCODER_ID),
            crtc_id: bound.then_some(st.modeset.connector_crtc),
        })
    }

    fn crtc(&self, id: u32) -> nix::Result<CrtcInfo> {
        if id != CRTC_ID {
            return Err(Errno::ENOENT);
        }
        Ok(Self::crtc_info(&self.state.borrow()))
    }

    fn plane_ids(&self) -> nix::Result<Vec<u32>> {
        let st = self.state.borrow();
        Ok((0..st.topology.planes.len() as u32)
            .map(|i| FIRST_PLANE_ID + i)
            .collect())
    }

    fn plane(&self, id: u32) -> nix::Result<PlaneInfo> {
        let st = self.state.borrow();
        let index = st.plane_index(id).ok_or(Errno::ENOENT)?;
        let p = &st.modeset.planes[index];
        Ok(PlaneInfo {
            id,
            plane_type: st.topology.planes[index],
            crtc_id: p.crtc_id,
            fb_id: p.fb_id,
            possible_crtcs: 1,
            formats: st.topology.formats.iter().map(|f| f.code()).collect(),
        })
    }

    fn properties(&self, object: ObjectRef) -> nix::Result<Vec<Property>> {
        let st = self.state.borrow();
        if st.object_kind(object.id) != Some(object.kind) {
            return Err(Errno::ENOENT);
        }
        Ok(st
            .properties
            .iter()
            .filter(|(_, (obj, _))| *obj == object.id)
            .map(|(&id, &(obj, name))| Property {
                id,
                name: name.to_string(),
                value: st.property_value(obj, name),
            })
            .collect())
    }

    fn plane_modifiers(&self, plane: u32) -> nix::Result<Option<Vec<u64>>> {
        let st = self.state.borrow();
        st.plane_index(plane).ok_or(Errno::ENOENT)?;
        Ok(st
            .topology
            .in_formats
            .as_ref()
            .map(|mods| mods.iter().map(|m| m.0).collect()))
    }

    fn create_blob(&self, data: &[u8]) -> nix::Result<u32> {
        if data.is_empty() {
            return Err(Errno::EINVAL);
        }
        let mut st = self.state.borrow_mut();
        let id = st.next_blob;
        st.next_blob += 1;
        st.blobs.insert(id, data.to_vec());
        trace!("{}: blob {id} ({} bytes)", self.name, data.len());
        Ok(id)
    }

    fn destroy_blob(&self, id: u32) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        let data = st.blobs.remove(&id).ok_or(Errno::ENOENT)?;
        if st.modeset.mode_blob == id {
            st.retained_blobs.insert(id, data);
        }
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> nix::Result<DumbBuffer> {
        if width == 0 || height == 0 || bpp == 0 {
            return Err(Errno::EINVAL);
        }
        let row_bytes = (u64::from(width) * u64::from(bpp)).div_ceil(8);
        let pitch = row_bytes.div_ceil(64) * 64;
        let size = (pitch * u64::from(height)).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let pitch = u32::try_from(pitch).map_err(|_| Errno::EINVAL)?;

        let mut st = self.state.borrow_mut();
        let handle = st.next_handle;
        let name = CString::new(format!("{}-bo{handle}", self.name)).map_err(|_| Errno::EINVAL)?;
        let fd = memfd_create(
            name.as_c_str(),
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )?;
        let file = File::from(fd);
        file.set_len(size).map_err(io_errno)?;
        fcntl(
            file.as_raw_fd(),
            FcntlArg::F_ADD_SEALS(SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_GROW),
        )?;
        let meta = file.metadata().map_err(io_errno)?;

        st.next_handle += 1;
        st.buffers.insert(
            handle,
            VirtualBuffer {
                file,
                size,
                key: (meta.dev(), meta.ino()),
            },
        );
        debug!(
            "{}: dumb buffer {width}x{height}@{bpp} -> handle {handle} size {size}",
            self.name
        );
        Ok(DumbBuffer {
            handle,
            pitch,
            size,
        })
    }

    fn handle_size(&self, handle: u32) -> nix::Result<u64> {
        let st = self.state.borrow();
        st.buffers.get(&handle).map(|b| b.size).ok_or(Errno::ENOENT)
    }

    fn map(&self, handle: u32, size: usize) -> nix::Result<Mapping> {
        let file = self.buffer_file(handle)?;
        if size as u64 > file.metadata().map_err(io_errno)?.len() {
            return Err(Errno::EINVAL);
        }
        Mapping::new(file.as_fd(), 0, size)
    }

    fn close_handle(&self, handle: u32) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        let in_use = st.framebuffers.values().any(|fb| fb.handle == handle);
        if in_use {
            debug!(
                "{}: closing handle {handle} still referenced by a framebuffer",
                self.name
            );
        }
        st.buffers.remove(&handle).map(|_| ()).ok_or(Errno::ENOENT)
    }

    fn export_fd(&self, handle: u32) -> nix::Result<OwnedFd> {
        Ok(OwnedFd::from(self.buffer_file(handle)?))
    }

    fn import_fd(&self, fd: BorrowedFd<'_>) -> nix::Result<u32> {
        let file = File::from(fd.try_clone_to_owned().map_err(io_errno)?);
        let meta = file.metadata().map_err(io_errno)?;
        let key = (meta.dev(), meta.ino());

        let mut st = self.state.borrow_mut();
        if let Some((&handle, _)) = st.buffers.iter().find(|(_, b)| b.key == key) {
            return Ok(handle);
        }
        let handle = st.next_handle;
        st.next_handle += 1;
        st.buffers.insert(
            handle,
            VirtualBuffer {
                file,
                size: meta.len(),
                key,
            },
        );
        Ok(handle)
    }

    fn add_framebuffer(&self, fb: &FramebufferSpec) -> nix::Result<u32> {
        let mut st = self.state.borrow_mut();
        let buffer = st.buffers.get(&fb.handle).ok_or(Errno::ENOENT)?;
        if fb.width == 0 || fb.height == 0 || PixelFormat::from_code(fb.format).is_none() {
            return Err(Errno::EINVAL);
        }
        if u64::from(fb.pitch) * u64::from(fb.height) > buffer.size {
            return Err(Errno::EINVAL);
        }
        if let Some(modifier) = fb.modifier {
            let known = st
                .topology
                .in_formats
                .as_ref()
                .is_some_and(|mods| mods.contains(&Modifier(modifier)));
            if !known {
                return Err(Errno::EINVAL);
            }
        }
        let id = st.next_fb;
        st.next_fb += 1;
        st.framebuffers.insert(id, *fb);
        Ok(id)
    }

    fn remove_framebuffer(&self, id: u32) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        st.framebuffers.remove(&id).ok_or(Errno::ENOENT)?;
        // RMFB disables every plane scanning out the framebuffer. The CRTC
        // cannot run without its primary plane, so losing that one switches
        // the whole pipe off, as the kernel's disable_crtcs fallback does.
        let primary = st
            .topology
            .planes
            .iter()
            .position(|&t| t == PlaneType::Primary);
        let mut primary_lost = false;
        for (index, plane) in st.modeset.planes.iter_mut().enumerate() {
            if plane.fb_id == id {
                *plane = PlaneState::default();
                primary_lost |= Some(index) == primary;
            }
        }
        if primary_lost && st.modeset.active {
            debug!("{}: RMFB {id} took the primary plane, CRTC off", self.name);
            let planes = st.modeset.planes.len();
            st.modeset = ModesetState {
                active: false,
                mode_blob: 0,
                connector_crtc: 0,
                planes: vec![PlaneState::default(); planes],
            };
            st.retained_blobs.clear();
        }
        Ok(())
    }

    fn atomic_commit(&self, values: &[PropertyValue], flags: u32) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        let mut staged = st.modeset.clone();
        for v in values {
            st.stage(&mut staged, v)?;
        }
        st.check(&staged, flags)?;
        if flags & DRM_MODE_ATOMIC_TEST_ONLY == 0 {
            st.modeset = staged;
            let in_use = st.modeset.mode_blob;
            st.retained_blobs.retain(|&id, _| id == in_use);
        }
        Ok(())
    }

    fn wait_vblank(&self, crtc_index: u32, timeout: Duration) -> nix::Result<u32> {
        let delivers = {
            let st = self.state.borrow();
            if crtc_index != 0 || !st.modeset.active {
                return Err(Errno::EINVAL);
            }
            st.topology.vblank
        };
        if !delivers {
            std::thread::sleep(timeout);
            return Err(Errno::ETIME);
        }
        let mut st = self.state.borrow_mut();
        st.vblank_sequence = st.vblank_sequence.wrapping_add(1);
        Ok(st.vblank_sequence)
    }

    fn syncobj_create(&self, signaled: bool) -> nix::Result<u32> {
        let mut st = self.state.borrow_mut();
        let handle = st.next_syncobj;
        st.next_syncobj += 1;
        st.syncobjs.insert(handle, signaled);
        Ok(handle)
    }

    fn syncobj_signal(&self, handle: u32) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        let signaled = st.syncobjs.get_mut(&handle).ok_or(Errno::ENOENT)?;
        *signaled = true;
        Ok(())
    }

    fn syncobj_wait(&self, handle: u32, timeout: Duration) -> nix::Result<()> {
        let signaled = *self
            .state
            .borrow()
            .syncobjs
            .get(&handle)
            .ok_or(Errno::ENOENT)?;
        if signaled {
            return Ok(());
        }
        std::thread::sleep(timeout);
        Err(Errno::ETIME)
    }

    fn syncobj_destroy(&self, handle: u32) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        st.syncobjs.remove(&handle).map(|_| ()).ok_or(Errno::ENOENT)
    }

    fn gamma(&self, crtc: u32, size: u32) -> nix::Result<GammaRamp> {
        let st = self.state.borrow();
        if crtc != CRTC_ID {
            return Err(Errno::ENOENT);
        }
        if size == 0 || size != st.topology.gamma_size {
            return Err(Errno::EINVAL);
        }
        Ok(st.gamma.clone())
    }

    fn set_gamma(&self, crtc: u32, ramp: &GammaRamp) -> nix::Result<()> {
        let mut st = self.state.borrow_mut();
        if crtc != CRTC_ID {
            return Err(Errno::ENOENT);
        }
        let size = st.topology.gamma_size as usize;
        if size == 0
            || ramp.red.len() != size
            || ramp.green.len() != size
            || ramp.blue.len() != size
        {
            return Err(Errno::EINVAL);
        }
        st.gamma = ramp.clone();
        Ok(())
    }
}

/// A set of virtual cards addressed by index, standing in for `/dev/dri`.
///
/// Opening the same index twice yields handles to the same card, so state
/// and leak counts can be inspected from a test while the harness runs.
#[derive(Clone, Default)]
pub struct VirtualBus {
    cards: Rc<RefCell<BTreeMap<u32, VirtualDevice>>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with `count` cards (indices `0..count`) sharing one topology.
    pub fn with_cards(count: u32, topology: VirtualTopology) -> Self {
        let bus = Self::new();
        for index in 0..count {
            bus.insert(index, topology.clone());
        }
        bus
    }

    pub fn insert(&self, index: u32, topology: VirtualTopology) -> VirtualDevice {
        let device = VirtualDevice::new(format!("virtual{index}"), topology);
        self.cards.borrow_mut().insert(index, device.clone());
        device
    }

    pub fn device(&self, index: u32) -> Option<VirtualDevice> {
        self.cards.borrow().get(&index).cloned()
    }
}

impl Backend for VirtualBus {
    fn open(&self, index: u32) -> Result<Box<dyn Device>> {
        let device = self.device(index).ok_or_else(|| Error::DeviceUnavailable {
            path: format!("virtual{index}"),
            reason: "no such virtual card".into(),
        })?;
        debug!("opened {}", device.name);
        Ok(Box::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ATOMIC_NONBLOCK;

    fn prop(dev: &VirtualDevice, object: ObjectRef, name: &str) -> u32 {
        dev.properties(object)
            .unwrap()
            .into_iter()
            .find(|p| p.name == name)
            .unwrap()
            .id
    }

    #[test]
    fn dumb_geometry_is_aligned() {
        let dev = VirtualDevice::new("t", VirtualTopology::default());
        let dumb = dev.create_dumb(100, 10, 32).unwrap();
        assert_eq!(dumb.pitch, 448);
        assert_eq!(dumb.size, 8192);
        assert_eq!(dev.handle_size(dumb.handle).unwrap(), 8192);
        assert_eq!(dev.create_dumb(0, 10, 32), Err(Errno::EINVAL));
    }

    #[test]
    fn import_of_own_export_returns_same_handle() {
        let dev = VirtualDevice::new("t", VirtualTopology::default());
        let dumb = dev.create_dumb(64, 64, 32).unwrap();
        let fd = dev.export_fd(dumb.handle).unwrap();
        assert_eq!(dev.import_fd(fd.as_fd()).unwrap(), dumb.handle);
        assert_eq!(dev.objects().handles, 1);
    }

    #[test]
    fn rejected_commit_changes_nothing() {
        let dev = VirtualDevice::new("t", VirtualTopology::default());
        let before = dev.crtc_state();
        let active = prop(&dev, ObjectRef::crtc(CRTC_ID), "ACTIVE");
        let fb_id = prop(&dev, ObjectRef::plane(FIRST_PLANE_ID), "FB_ID");
        let values = [
            PropertyValue {
                object: CRTC_ID,
                property: active,
                value: 0,
            },
            PropertyValue {
                object: FIRST_PLANE_ID,
                property: fb_id,
                value: 4242,
            },
        ];
        assert!(dev
            .atomic_commit(&values, DRM_MODE_ATOMIC_ALLOW_MODESET | ATOMIC_NONBLOCK)
            .is_err());
        assert_eq!(dev.crtc_state(), before);
    }

    #[test]
    fn modeset_requires_allow_flag() {
        let dev = VirtualDevice::new("t", VirtualTopology::default());
        let active = prop(&dev, ObjectRef::crtc(CRTC_ID), "ACTIVE");
        let off = [PropertyValue {
            object: CRTC_ID,
            property: active,
            value: 0,
        }];
        assert_eq!(dev.atomic_commit(&off, ATOMIC_NONBLOCK), Err(Errno::EINVAL));
        assert!(dev
            .atomic_commit(&off, DRM_MODE_ATOMIC_ALLOW_MODESET | DRM_MODE_ATOMIC_TEST_ONLY)
            .is_ok());
        assert!(dev.crtc_state().mode.is_some());
    }

    fn scan_out_on(dev: &VirtualDevice, plane: u32) -> u32 {
        let dumb = dev.create_dumb(64, 64, 32).unwrap();
        let fb = dev
            .add_framebuffer(&FramebufferSpec {
                width: 64,
                height: 64,
                format: PixelFormat::Argb8888.code(),
                handle: dumb.handle,
                pitch: dumb.pitch,
                modifier: None,
            })
            .unwrap();
        let object = ObjectRef::plane(plane);
        let values: Vec<PropertyValue> = [
            ("FB_ID", u64::from(fb)),
            ("CRTC_ID", u64::from(CRTC_ID)),
            ("CRTC_W", 64),
            ("CRTC_H", 64),
            ("SRC_W", 64 << 16),
            ("SRC_H", 64 << 16),
        ]
        .into_iter()
        .map(|(name, value)| PropertyValue {
            object: plane,
            property: prop(dev, object, name),
            value,
        })
        .collect();
        dev.atomic_commit(&values, ATOMIC_NONBLOCK).unwrap();
        assert_eq!(dev.plane_framebuffer(plane), Some(fb));
        fb
    }

    #[test]
    fn removing_scanned_out_primary_switches_crtc_off() {
        let dev = VirtualDevice::new("t", VirtualTopology::default());
        let overlay = FIRST_PLANE_ID + 1;
        scan_out_on(&dev, overlay);
        let fb = scan_out_on(&dev, FIRST_PLANE_ID);

        dev.remove_framebuffer(fb).unwrap();
        assert_eq!(dev.plane_framebuffer(FIRST_PLANE_ID), None);
        assert_eq!(dev.plane_framebuffer(overlay), None);
        assert_eq!(dev.crtc_state().mode, None);
        assert_eq!(
            dev.wait_vblank(0, Duration::from_millis(5)),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn removing_overlay_framebuffer_keeps_crtc() {
        let dev = VirtualDevice::new("t", VirtualTopology::default());
        let overlay = FIRST_PLANE_ID + 1;
        let fb = scan_out_on(&dev, overlay);
        dev.remove_framebuffer(fb).unwrap();
        assert_eq!(dev.plane_framebuffer(overlay), None);
        assert!(dev.crtc_state().mode.is_some());
    }

    #[test]
    fn missing_vblank_times_out() {
        let topology = VirtualTopology {
            vblank: false,
            ..Default::default()
        };
        let dev = VirtualDevice::new("t", topology);
        assert_eq!(
            dev.wait_vblank(0, Duration::from_millis(5)),
            Err(Errno::ETIME)
        );
    }

    #[test]
    fn bus_shares_card_state() {
        let bus = VirtualBus::with_cards(1, VirtualTopology::default());
        let opened = bus.open(0).unwrap();
        let dumb = opened.create_dumb(16, 16, 32).unwrap();
        assert_eq!(bus.device(0).unwrap().objects().handles, 1);
        opened.close_handle(dumb.handle).unwrap();
        assert_eq!(bus.device(0).unwrap().objects(), VirtualObjects::default());
        assert!(bus.open(3).is_err());
    }
}
