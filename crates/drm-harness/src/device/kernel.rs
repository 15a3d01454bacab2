// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! [`Device`] implementation on top of a real `/dev/dri/card*` node.

use super::ioctl::{self, retry};
use super::{
    Backend, CardResources, Connection, ConnectorInfo, CrtcInfo, Device, DumbBuffer,
    FramebufferSpec, GammaRamp, ModeInfo, ObjectRef, PlaneInfo, PlaneType, Property,
    PropertyValue,
};
use crate::buffer::Mapping;
use crate::error::{Error, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::time::TimeValLike;
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{lseek, read, Whence};
use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Opens `card<N>` nodes under a DRI directory (normally `/dev/dri`).
#[derive(Debug, Clone)]
pub struct KernelBackend {
    dir: PathBuf,
}

impl KernelBackend {
    pub fn new() -> Self {
        Self::with_dir("/dev/dri")
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn node_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("card{index}"))
    }
}

impl Default for KernelBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for KernelBackend {
    fn open(&self, index: u32) -> Result<Box<dyn Device>> {
        let device = KernelDevice::open(self.node_path(index))?;
        Ok(Box::new(device))
    }
}

struct KernelDevice {
    fd: OwnedFd,
    path: String,
}

impl KernelDevice {
    fn open(path: PathBuf) -> Result<Self> {
        let display = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::DeviceUnavailable {
                path: display.clone(),
                reason: e.to_string(),
            })?;
        let device = Self {
            fd: file.into(),
            path: display,
        };

        let driver = device.driver_name().map_err(|e| Error::DeviceUnavailable {
            path: device.path.clone(),
            reason: format!("not a DRM device: {e}"),
        })?;
        info!("opened {} (driver {driver})", device.path);

        for cap in [
            ioctl::DRM_CLIENT_CAP_UNIVERSAL_PLANES,
            ioctl::DRM_CLIENT_CAP_ATOMIC,
        ] {
            if let Err(e) = device.set_client_cap(cap, 1) {
                warn!("{}: client capability {cap} rejected: {e}", device.path);
            }
        }
        // SAFETY: DRM_IOCTL_SET_MASTER takes no argument.
        if let Err(e) = retry(|| unsafe { ioctl::drm_set_master(device.raw()) }) {
            warn!(
                "{}: could not become DRM master ({e}); commits may be refused",
                device.path
            );
        }
        Ok(device)
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn driver_name(&self) -> nix::Result<String> {
        let mut version = ioctl::DrmVersion::zeroed();
        // SAFETY: all buffer pointers are null with zero lengths, so the kernel
        // only fills in the counts.
        retry(|| unsafe { ioctl::drm_version(self.raw(), &mut version) })?;
        let mut name = vec![0u8; version.name_len];
        let len = name.len();
        let mut version = ioctl::DrmVersion::zeroed();
        version.name_len = len;
        version.name = name.as_mut_ptr().cast();
        // SAFETY: `name` is `name_len` bytes long and outlives the call.
        retry(|| unsafe { ioctl::drm_version(self.raw(), &mut version) })?;
        name.truncate(version.name_len.min(len));
        Ok(String::from_utf8_lossy(&name).into_owned())
    }

    fn get_cap(&self, capability: u64) -> nix::Result<u64> {
        let mut cap = ioctl::DrmGetCap {
            capability,
            value: 0,
        };
        // SAFETY: `cap` is a valid drm_get_cap for the duration of the call.
        retry(|| unsafe { ioctl::drm_get_cap(self.raw(), &mut cap) })?;
        Ok(cap.value)
    }

    fn set_client_cap(&self, capability: u64, value: u64) -> nix::Result<()> {
        let cap = ioctl::DrmSetClientCap { capability, value };
        // SAFETY: `cap` is a valid drm_set_client_cap for the duration of the call.
        retry(|| unsafe { ioctl::drm_set_client_cap(self.raw(), &cap) })
    }

    fn encoder_crtc(&self, encoder_id: u32) -> nix::Result<Option<u32>> {
        let mut enc = ioctl::DrmModeGetEncoder {
            encoder_id,
            ..Default::default()
        };
        // SAFETY: `enc` is a valid drm_mode_get_encoder for the duration of the call.
        retry(|| unsafe { ioctl::drm_mode_get_encoder(self.raw(), &mut enc) })?;
        Ok((enc.crtc_id != 0).then_some(enc.crtc_id))
    }

    fn property_name(&self, prop_id: u32) -> nix::Result<String> {
        let mut prop = ioctl::DrmModeGetProperty {
            prop_id,
            ..Default::default()
        };
        // SAFETY: value and enum arrays are absent (zero counts, null pointers).
        retry(|| unsafe { ioctl::drm_mode_get_property(self.raw(), &mut prop) })?;
        let len = prop.name.iter().position(|&b| b == 0).unwrap_or(prop.name.len());
        Ok(String::from_utf8_lossy(&prop.name[..len]).into_owned())
    }

    fn blob(&self, blob_id: u32) -> nix::Result<Vec<u8>> {
        let mut blob = ioctl::DrmModeGetBlob {
            blob_id,
            ..Default::default()
        };
        // SAFETY: a zero-length query only reports the blob length.
        retry(|| unsafe { ioctl::drm_mode_get_prop_blob(self.raw(), &mut blob) })?;
        let mut data = vec![0u8; blob.length as usize];
        blob.data = data.as_mut_ptr() as u64;
        // SAFETY: `data` holds `length` bytes and outlives the call.
        retry(|| unsafe { ioctl::drm_mode_get_prop_blob(self.raw(), &mut blob) })?;
        data.truncate(blob.length as usize);
        Ok(data)
    }
}

/// Extract the distinct modifiers listed in an `IN_FORMATS` blob.
pub(crate) fn parse_in_formats(data: &[u8]) -> Option<Vec<u64>> {
    let u32_at = |o: usize| -> Option<u32> {
        data.get(o..o + 4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    };
    if data.len() < size_of::<ioctl::DrmFormatModifierBlob>() {
        return None;
    }
    let count = u32_at(16)? as usize;
    let offset = u32_at(20)? as usize;
    let mut modifiers = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + i * 24 + 16;
        let bytes: [u8; 8] = data.get(at..at + 8)?.try_into().ok()?;
        let modifier = u64::from_ne_bytes(bytes);
        if !modifiers.contains(&modifier) {
            modifiers.push(modifier);
        }
    }
    Some(modifiers)
}

/// Find the sequence number of the first VBLANK event in a `read` of the
/// device file.
pub(crate) fn parse_vblank_sequence(data: &[u8]) -> Option<u32> {
    let u32_at = |o: usize| -> Option<u32> {
        data.get(o..o + 4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    };
    let mut at = 0;
    let header = size_of::<ioctl::DrmEvent>();
    while at + header <= data.len() {
        let kind = u32_at(at)?;
        let length = u32_at(at + 4)? as usize;
        if length < header {
            return None;
        }
        if kind == ioctl::DRM_EVENT_VBLANK && length >= size_of::<ioctl::DrmEventVblank>() {
            return u32_at(at + 24);
        }
        at += length;
    }
    None
}

impl Device for KernelDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn resources(&self) -> nix::Result<CardResources> {
        let mut res = ioctl::DrmModeCardRes::default();
        // SAFETY: all id arrays are absent on the counting pass.
        retry(|| unsafe { ioctl::drm_mode_get_resources(self.raw(), &mut res) })?;

        let mut crtcs = vec![0u32; res.count_crtcs as usize];
        let mut connectors = vec![0u32; res.count_connectors as usize];
        let mut encoders = vec![0u32; res.count_encoders as usize];
        let mut fill = ioctl::DrmModeCardRes {
            crtc_id_ptr: crtcs.as_mut_ptr() as u64,
            connector_id_ptr: connectors.as_mut_ptr() as u64,
            encoder_id_ptr: encoders.as_mut_ptr() as u64,
            count_crtcs: res.count_crtcs,
            count_connectors: res.count_connectors,
            count_encoders: res.count_encoders,
            ..Default::default()
        };
        // SAFETY: each pointer refers to a vector with exactly the advertised count.
        retry(|| unsafe { ioctl::drm_mode_get_resources(self.raw(), &mut fill) })?;
        crtcs.truncate(fill.count_crtcs.min(res.count_crtcs) as usize);
        connectors.truncate(fill.count_connectors.min(res.count_connectors) as usize);
        encoders.truncate(fill.count_encoders.min(res.count_encoders) as usize);

        Ok(CardResources {
            crtcs,
            connectors,
            encoders,
            min_width: fill.min_width,
            max_width: fill.max_width,
            min_height: fill.min_height,
            max_height: fill.max_height,
        })
    }

    fn connector(&self, id: u32) -> nix::Result<ConnectorInfo> {
        let mut conn = ioctl::DrmModeGetConnector {
            connector_id: id,
            ..Default::default()
        };
        // SAFETY: counting pass, no arrays supplied.
        retry(|| unsafe { ioctl::drm_mode_get_connector(self.raw(), &mut conn) })?;

        let mut modes = vec![ioctl::DrmModeModeInfo::default(); conn.count_modes as usize];
        let mut encoders = vec![0u32; conn.count_encoders as usize];
        let mut fill = ioctl::DrmModeGetConnector {
            connector_id: id,
            modes_ptr: modes.as_mut_ptr() as u64,
            count_modes: conn.count_modes,
            encoders_ptr: encoders.as_mut_ptr() as u64,
            count_encoders: conn.count_encoders,
            ..Default::default()
        };
        // SAFETY: arrays sized to the counts from the first pass.
        retry(|| unsafe { ioctl::drm_mode_get_connector(self.raw(), &mut fill) })?;
        modes.truncate(fill.count_modes.min(conn.count_modes) as usize);

        let encoder_id = (fill.encoder_id != 0).then_some(fill.encoder_id);
        let crtc_id = match encoder_id {
            Some(enc) => self.encoder_crtc(enc)?,
            None => None,
        };

        Ok(ConnectorInfo {
            id,
            connector_type: fill.connector_type,
            connector_type_id: fill.connector_type_id,
            connection: Connection::from_raw(fill.connection),
            mm_width: fill.mm_width,
            mm_height: fill.mm_height,
            modes: modes.iter().map(ModeInfo::from_raw).collect(),
            encoder_id,
            crtc_id,
        })
    }

    fn crtc(&self, id: u32) -> nix::Result<CrtcInfo> {
        let mut crtc = ioctl::DrmModeCrtc {
            crtc_id: id,
            ..Default::default()
        };
        // SAFETY: no connector array is supplied.
        retry(|| unsafe { ioctl::drm_mode_get_crtc(self.raw(), &mut crtc) })?;
        Ok(CrtcInfo {
            id,
            fb_id: crtc.fb_id,
            x: crtc.x,
            y: crtc.y,
            mode: (crtc.mode_valid != 0).then(|| ModeInfo::from_raw(&crtc.mode)),
            gamma_size: crtc.gamma_size,
        })
    }

    fn plane_ids(&self) -> nix::Result<Vec<u32>> {
        let mut res = ioctl::DrmModeGetPlaneRes::default();
        // SAFETY: counting pass.
        retry(|| unsafe { ioctl::drm_mode_get_plane_resources(self.raw(), &mut res) })?;
        let mut ids = vec![0u32; res.count_planes as usize];
        let mut fill = ioctl::DrmModeGetPlaneRes {
            plane_id_ptr: ids.as_mut_ptr() as u64,
            count_planes: res.count_planes,
        };
        // SAFETY: `ids` holds `count_planes` entries.
        retry(|| unsafe { ioctl::drm_mode_get_plane_resources(self.raw(), &mut fill) })?;
        ids.truncate(fill.count_planes.min(res.count_planes) as usize);
        Ok(ids)
    }

    fn plane(&self, id: u32) -> nix::Result<PlaneInfo> {
        let mut plane = ioctl::DrmModeGetPlane {
            plane_id: id,
            ..Default::default()
        };
        // SAFETY: counting pass.
        retry(|| unsafe { ioctl::drm_mode_get_plane(self.raw(), &mut plane) })?;
        let mut formats = vec![0u32; plane.count_format_types as usize];
        let mut fill = ioctl::DrmModeGetPlane {
            plane_id: id,
            count_format_types: plane.count_format_types,
            format_type_ptr: formats.as_mut_ptr() as u64,
            ..Default::default()
        };
        // SAFETY: `formats` holds `count_format_types` entries.
        retry(|| unsafe { ioctl::drm_mode_get_plane(self.raw(), &mut fill) })?;
        formats.truncate(fill.count_format_types.min(plane.count_format_types) as usize);

        let plane_type = self
            .properties(ObjectRef::plane(id))?
            .into_iter()
            .find(|p| p.name == "type")
            .and_then(|p| PlaneType::from_raw(p.value))
            .ok_or(Errno::EINVAL)?;

        Ok(PlaneInfo {
            id,
            plane_type,
            crtc_id: fill.crtc_id,
            fb_id: fill.fb_id,
            possible_crtcs: fill.possible_crtcs,
            formats,
        })
    }

    fn properties(&self, object: ObjectRef) -> nix::Result<Vec<Property>> {
        let mut props = ioctl::DrmModeObjGetProperties {
            obj_id: object.id,
            obj_type: object.kind.raw(),
            ..Default::default()
        };
        // SAFETY: counting pass.
        retry(|| unsafe { ioctl::drm_mode_obj_get_properties(self.raw(), &mut props) })?;
        let count = props.count_props as usize;
        let mut ids = vec![0u32; count];
        let mut values = vec![0u64; count];
        let mut fill = ioctl::DrmModeObjGetProperties {
            props_ptr: ids.as_mut_ptr() as u64,
            prop_values_ptr: values.as_mut_ptr() as u64,
            count_props: props.count_props,
            obj_id: object.id,
            obj_type: object.kind.raw(),
        };
        // SAFETY: both arrays hold `count_props` entries.
        retry(|| unsafe { ioctl::drm_mode_obj_get_properties(self.raw(), &mut fill) })?;
        let count = count.min(fill.count_props as usize);

        ids.iter()
            .zip(values.iter())
            .take(count)
            .map(|(&id, &value)| {
                Ok(Property {
                    id,
                    name: self.property_name(id)?,
                    value,
                })
            })
            .collect()
    }

    fn plane_modifiers(&self, plane: u32) -> nix::Result<Option<Vec<u64>>> {
        if self.get_cap(ioctl::DRM_CAP_ADDFB2_MODIFIERS).unwrap_or(0) == 0 {
            return Ok(None);
        }
        let Some(prop) = self
            .properties(ObjectRef::plane(plane))?
            .into_iter()
            .find(|p| p.name == "IN_FORMATS")
        else {
            return Ok(None);
        };
        let data = self.blob(prop.value as u32)?;
        Ok(parse_in_formats(&data))
    }

    fn create_blob(&self, data: &[u8]) -> nix::Result<u32> {
        let mut blob = ioctl::DrmModeCreateBlob {
            data: data.as_ptr() as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        // SAFETY: the kernel copies `length` bytes from `data` during the call.
        retry(|| unsafe { ioctl::drm_mode_create_prop_blob(self.raw(), &mut blob) })?;
        Ok(blob.blob_id)
    }

    fn destroy_blob(&self, blob_id: u32) -> nix::Result<()> {
        let mut blob = ioctl::DrmModeDestroyBlob { blob_id };
        // SAFETY: plain id argument.
        retry(|| unsafe { ioctl::drm_mode_destroy_prop_blob(self.raw(), &mut blob) })
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> nix::Result<DumbBuffer> {
        let mut create = ioctl::DrmModeCreateDumb {
            width,
            height,
            bpp,
            ..Default::default()
        };
        // SAFETY: `create` is a valid drm_mode_create_dumb.
        retry(|| unsafe { ioctl::drm_mode_create_dumb(self.raw(), &mut create) })?;
        debug!(
            "{}: dumb buffer {width}x{height}@{bpp} -> handle {} pitch {} size {}",
            self.path, create.handle, create.pitch, create.size
        );
        Ok(DumbBuffer {
            handle: create.handle,
            pitch: create.pitch,
            size: create.size,
        })
    }

    fn handle_size(&self, handle: u32) -> nix::Result<u64> {
        let fd = self.export_fd(handle)?;
        let end = lseek(fd.as_raw_fd(), 0, Whence::SeekEnd)?;
        u64::try_from(end).map_err(|_| Errno::EINVAL)
    }

    fn map(&self, handle: u32, size: usize) -> nix::Result<Mapping> {
        let mut map = ioctl::DrmModeMapDumb {
            handle,
            ..Default::default()
        };
        // SAFETY: `map` is a valid drm_mode_map_dumb.
        match retry(|| unsafe { ioctl::drm_mode_map_dumb(self.raw(), &mut map) }) {
            Ok(()) => {
                let offset = libc::off_t::try_from(map.offset).map_err(|_| Errno::EOVERFLOW)?;
                Mapping::new(self.fd.as_fd(), offset, size)
            }
            Err(e) => {
                // Imported PRIME objects are not dumb buffers; map the dma-buf.
                debug!("{}: MAP_DUMB on handle {handle} failed ({e}), mapping dma-buf", self.path);
                let fd = self.export_fd(handle)?;
                Mapping::new(fd.as_fd(), 0, size)
            }
        }
    }

    fn close_handle(&self, handle: u32) -> nix::Result<()> {
        let close = ioctl::DrmGemClose { handle, pad: 0 };
        // SAFETY: `close` is a valid drm_gem_close.
        retry(|| unsafe { ioctl::drm_gem_close(self.raw(), &close) })
    }

    fn export_fd(&self, handle: u32) -> nix::Result<OwnedFd> {
        let mut prime = ioctl::DrmPrimeHandle {
            handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        // SAFETY: `prime` is a valid drm_prime_handle.
        retry(|| unsafe { ioctl::drm_prime_handle_to_fd(self.raw(), &mut prime) })?;
        if prime.fd < 0 {
            return Err(Errno::EBADF);
        }
        // SAFETY: the kernel just created this descriptor and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    fn import_fd(&self, fd: BorrowedFd<'_>) -> nix::Result<u32> {
        let mut prime = ioctl::DrmPrimeHandle {
            handle: 0,
            flags: 0,
            fd: fd.as_raw_fd(),
        };
        // SAFETY: `prime` is a valid drm_prime_handle and `fd` stays open for the call.
        retry(|| unsafe { ioctl::drm_prime_fd_to_handle(self.raw(), &mut prime) })?;
        Ok(prime.handle)
    }

    fn add_framebuffer(&self, fb: &FramebufferSpec) -> nix::Result<u32> {
        let mut cmd = ioctl::DrmModeFbCmd2 {
            width: fb.width,
            height: fb.height,
            pixel_format: fb.format,
            ..Default::default()
        };
        cmd.handles[0] = fb.handle;
        cmd.pitches[0] = fb.pitch;
        if let Some(modifier) = fb.modifier {
            cmd.flags |= ioctl::DRM_MODE_FB_MODIFIERS;
            cmd.modifier[0] = modifier;
        }
        // SAFETY: `cmd` is a valid drm_mode_fb_cmd2.
        retry(|| unsafe { ioctl::drm_mode_add_fb2(self.raw(), &mut cmd) })?;
        Ok(cmd.fb_id)
    }

    fn remove_framebuffer(&self, id: u32) -> nix::Result<()> {
        let mut id = id;
        // SAFETY: RMFB takes a pointer to the framebuffer id.
        retry(|| unsafe { ioctl::drm_mode_rm_fb(self.raw(), &mut id) })
    }

    fn atomic_commit(&self, values: &[PropertyValue], flags: u32) -> nix::Result<()> {
        // The kernel wants properties grouped per object.
        let mut objects: Vec<u32> = Vec::new();
        for v in values {
            if !objects.contains(&v.object) {
                objects.push(v.object);
            }
        }
        let mut counts = Vec::with_capacity(objects.len());
        let mut props = Vec::with_capacity(values.len());
        let mut prop_values = Vec::with_capacity(values.len());
        for &object in &objects {
            let mut count = 0u32;
            for v in values.iter().filter(|v| v.object == object) {
                props.push(v.property);
                prop_values.push(v.value);
                count += 1;
            }
            counts.push(count);
        }

        let mut atomic = ioctl::DrmModeAtomic {
            flags,
            count_objs: objects.len() as u32,
            objs_ptr: objects.as_ptr() as u64,
            count_props_ptr: counts.as_ptr() as u64,
            props_ptr: props.as_ptr() as u64,
            prop_values_ptr: prop_values.as_ptr() as u64,
            ..Default::default()
        };
        // SAFETY: all four arrays outlive the call and their lengths agree with
        // `count_objs` and the per-object counts.
        retry(|| unsafe { ioctl::drm_mode_atomic(self.raw(), &mut atomic) })
    }

    fn wait_vblank(&self, crtc_index: u32, timeout: Duration) -> nix::Result<u32> {
        let crtc_bits = match crtc_index {
            0 => 0,
            1 => ioctl::DRM_VBLANK_SECONDARY,
            n => (n << ioctl::DRM_VBLANK_HIGH_CRTC_SHIFT) & ioctl::DRM_VBLANK_HIGH_CRTC_MASK,
        };
        let mut request = ioctl::DrmWaitVblank {
            type_: ioctl::DRM_VBLANK_RELATIVE | ioctl::DRM_VBLANK_EVENT | crtc_bits,
            sequence: 1,
            signal: 0x5642,
            tval_usec: 0,
        };
        // SAFETY: `request` is a valid drm_wait_vblank.
        retry(|| unsafe { ioctl::drm_wait_vblank(self.raw(), &mut request) })?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1024];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Errno::ETIME);
            }
            let ms = u16::try_from(remaining.as_millis().max(1)).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => return Err(Errno::ETIME),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
            let n = read(self.raw(), &mut buf)?;
            if let Some(sequence) = parse_vblank_sequence(&buf[..n]) {
                return Ok(sequence);
            }
        }
    }

    fn syncobj_create(&self, signaled: bool) -> nix::Result<u32> {
        let mut create = ioctl::DrmSyncobjCreate {
            handle: 0,
            flags: if signaled {
                ioctl::DRM_SYNCOBJ_CREATE_SIGNALED
            } else {
                0
            },
        };
        // SAFETY: `create` is a valid drm_syncobj_create.
        retry(|| unsafe { ioctl::drm_syncobj_create(self.raw(), &mut create) })?;
        Ok(create.handle)
    }

    fn syncobj_signal(&self, handle: u32) -> nix::Result<()> {
        let handles = [handle];
        let mut array = ioctl::DrmSyncobjArray {
            handles: handles.as_ptr() as u64,
            count_handles: 1,
            pad: 0,
        };
        // SAFETY: `handles` holds one entry and outlives the call.
        retry(|| unsafe { ioctl::drm_syncobj_signal(self.raw(), &mut array) })
    }

    fn syncobj_wait(&self, handle: u32, timeout: Duration) -> nix::Result<()> {
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
        let timeout_ns = i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX);
        let handles = [handle];
        let mut wait = ioctl::DrmSyncobjWait {
            handles: handles.as_ptr() as u64,
            timeout_nsec: now.num_nanoseconds().saturating_add(timeout_ns),
            count_handles: 1,
            flags: ioctl::DRM_SYNCOBJ_WAIT_FLAGS_WAIT_ALL,
            ..Default::default()
        };
        // SAFETY: `handles` holds one entry and outlives the call.
        retry(|| unsafe { ioctl::drm_syncobj_wait(self.raw(), &mut wait) })
    }

    fn syncobj_destroy(&self, handle: u32) -> nix::Result<()> {
        let mut destroy = ioctl::DrmSyncobjDestroy { handle, pad: 0 };
        // SAFETY: `destroy` is a valid drm_syncobj_destroy.
        retry(|| unsafe { ioctl::drm_syncobj_destroy(self.raw(), &mut destroy) })
    }

    fn gamma(&self, crtc: u32, size: u32) -> nix::Result<GammaRamp> {
        let mut ramp = GammaRamp {
            red: vec![0; size as usize],
            green: vec![0; size as usize],
            blue: vec![0; size as usize],
        };
        let mut lut = ioctl::DrmModeCrtcLut {
            crtc_id: crtc,
            gamma_size: size,
            red: ramp.red.as_mut_ptr() as u64,
            green: ramp.green.as_mut_ptr() as u64,
            blue: ramp.blue.as_mut_ptr() as u64,
        };
        // SAFETY: each channel holds `gamma_size` entries.
        retry(|| unsafe { ioctl::drm_mode_get_gamma(self.raw(), &mut lut) })?;
        Ok(ramp)
    }

    fn set_gamma(&self, crtc: u32, ramp: &GammaRamp) -> nix::Result<()> {
        if ramp.green.len() != ramp.len() || ramp.blue.len() != ramp.len() {
            return Err(Errno::EINVAL);
        }
        let mut lut = ioctl::DrmModeCrtcLut {
            crtc_id: crtc,
            gamma_size: ramp.len() as u32,
            red: ramp.red.as_ptr() as u64,
            green: ramp.green.as_ptr() as u64,
            blue: ramp.blue.as_ptr() as u64,
        };
        // SAFETY: the kernel only reads the channels, each `gamma_size` long.
        retry(|| unsafe { ioctl::drm_mode_set_gamma(self.raw(), &mut lut) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_ne_bytes());
    }

    #[test]
    fn in_formats_blob_modifiers() {
        let mut blob = Vec::new();
        // header: version, flags, count_formats, formats_offset, count_modifiers, modifiers_offset
        for v in [1, 0, 1, 24, 3, 32] {
            push_u32(&mut blob, v);
        }
        push_u32(&mut blob, 0x3432_5241);
        push_u32(&mut blob, 0);
        for modifier in [0u64, 0x0100_0000_0000_0001, 0] {
            blob.extend_from_slice(&1u64.to_ne_bytes());
            push_u32(&mut blob, 0);
            push_u32(&mut blob, 0);
            blob.extend_from_slice(&modifier.to_ne_bytes());
        }
        assert_eq!(
            parse_in_formats(&blob),
            Some(vec![0, 0x0100_0000_0000_0001])
        );
        assert_eq!(parse_in_formats(&blob[..40]), None);
        assert_eq!(parse_in_formats(&blob[..20]), None);
    }

    #[test]
    fn vblank_event_is_found_after_other_events() {
        let mut data = Vec::new();
        // a flip-complete event first
        push_u32(&mut data, 0x02);
        push_u32(&mut data, 32);
        data.extend_from_slice(&[0u8; 24]);
        // then the vblank event
        push_u32(&mut data, ioctl::DRM_EVENT_VBLANK);
        push_u32(&mut data, 32);
        data.extend_from_slice(&0x5642u64.to_ne_bytes());
        push_u32(&mut data, 0);
        push_u32(&mut data, 0);
        push_u32(&mut data, 77);
        push_u32(&mut data, 40);
        assert_eq!(parse_vblank_sequence(&data), Some(77));
        assert_eq!(parse_vblank_sequence(&data[..32]), None);
    }

    #[test]
    fn truncated_vblank_event_is_ignored() {
        let mut data = Vec::new();
        push_u32(&mut data, ioctl::DRM_EVENT_VBLANK);
        push_u32(&mut data, 24);
        data.extend_from_slice(&[0u8; 16]);
        assert_eq!(parse_vblank_sequence(&data), None);
    }

    #[test]
    fn missing_node_is_unavailable() {
        let backend = KernelBackend::with_dir("/nonexistent/dri");
        match backend.open(0) {
            Err(Error::DeviceUnavailable { path, .. }) => {
                assert_eq!(path, "/nonexistent/dri/card0")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening a missing node succeeded"),
        }
    }
}
