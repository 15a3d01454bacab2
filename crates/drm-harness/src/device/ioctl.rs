// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Raw DRM uAPI structures and ioctl requests (`drm.h`, `drm_mode.h`).

use nix::errno::Errno;
use nix::libc::{c_char, c_int, c_long, size_t};
use nix::{ioctl_none, ioctl_readwrite, ioctl_write_ptr};

const DRM_IOCTL_BASE: u8 = b'd';

// =============================================================================
// Constants
// =============================================================================

pub const DRM_CAP_ADDFB2_MODIFIERS: u64 = 0x10;

pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
pub const DRM_CLIENT_CAP_ATOMIC: u64 = 3;

pub const DRM_MODE_OBJECT_CRTC: u32 = 0xcccc_cccc;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0_c0c0;
pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeee_eeee;

pub const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;

pub const DRM_MODE_ATOMIC_TEST_ONLY: u32 = 0x0100;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;
pub const DRM_MODE_ATOMIC_ALLOW_MODESET: u32 = 0x0400;

pub const DRM_VBLANK_RELATIVE: u32 = 0x0000_0001;
pub const DRM_VBLANK_EVENT: u32 = 0x0400_0000;
pub const DRM_VBLANK_SECONDARY: u32 = 0x2000_0000;
pub const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
pub const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

pub const DRM_EVENT_VBLANK: u32 = 0x01;

pub const DRM_SYNCOBJ_CREATE_SIGNALED: u32 = 1 << 0;
pub const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_ALL: u32 = 1 << 0;

// =============================================================================
// Structures
// =============================================================================

#[repr(C)]
pub struct DrmVersion {
    pub version_major: c_int,
    pub version_minor: c_int,
    pub version_patchlevel: c_int,
    pub name_len: size_t,
    pub name: *mut c_char,
    pub date_len: size_t,
    pub date: *mut c_char,
    pub desc_len: size_t,
    pub desc: *mut c_char,
}

impl DrmVersion {
    pub fn zeroed() -> Self {
        // SAFETY: every field is an integer or a raw pointer, for which all-zero
        // bytes are a valid value.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Default)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmGetCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmSetClientCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmPrimeHandle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmWaitVblank {
    pub type_: u32,
    pub sequence: u32,
    /// `request.signal` on input, `reply.tval_sec` on output.
    pub signal: c_long,
    pub tval_usec: c_long,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeCardRes {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct DrmModeModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; 32],
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeCrtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: DrmModeModeInfo,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeCrtcLut {
    pub crtc_id: u32,
    pub gamma_size: u32,
    pub red: u64,
    pub green: u64,
    pub blue: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeGetEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeGetConnector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeGetProperty {
    pub values_ptr: u64,
    pub enum_blob_ptr: u64,
    pub prop_id: u32,
    pub flags: u32,
    pub name: [u8; 32],
    pub count_values: u32,
    pub count_enum_blobs: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeGetBlob {
    pub blob_id: u32,
    pub length: u32,
    pub data: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeObjGetProperties {
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_props: u32,
    pub obj_id: u32,
    pub obj_type: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeCreateDumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeMapDumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeGetPlaneRes {
    pub plane_id_ptr: u64,
    pub count_planes: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeGetPlane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
    pub count_format_types: u32,
    pub format_type_ptr: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeFbCmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeAtomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeCreateBlob {
    pub data: u64,
    pub length: u32,
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmModeDestroyBlob {
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmSyncobjCreate {
    pub handle: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmSyncobjDestroy {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmSyncobjWait {
    pub handles: u64,
    pub timeout_nsec: i64,
    pub count_handles: u32,
    pub flags: u32,
    pub first_signaled: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmSyncobjArray {
    pub handles: u64,
    pub count_handles: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmEvent {
    pub type_: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Default)]
pub struct DrmEventVblank {
    pub base: DrmEvent,
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

/// Header of the `IN_FORMATS` plane property blob.
#[repr(C)]
#[derive(Default)]
pub struct DrmFormatModifierBlob {
    pub version: u32,
    pub flags: u32,
    pub count_formats: u32,
    pub formats_offset: u32,
    pub count_modifiers: u32,
    pub modifiers_offset: u32,
}

// =============================================================================
// Requests
// =============================================================================

ioctl_readwrite!(drm_version, DRM_IOCTL_BASE, 0x00, DrmVersion);
ioctl_write_ptr!(drm_gem_close, DRM_IOCTL_BASE, 0x09, DrmGemClose);
ioctl_readwrite!(drm_get_cap, DRM_IOCTL_BASE, 0x0c, DrmGetCap);
ioctl_write_ptr!(drm_set_client_cap, DRM_IOCTL_BASE, 0x0d, DrmSetClientCap);
ioctl_none!(drm_set_master, DRM_IOCTL_BASE, 0x1e);
ioctl_readwrite!(drm_prime_handle_to_fd, DRM_IOCTL_BASE, 0x2d, DrmPrimeHandle);
ioctl_readwrite!(drm_prime_fd_to_handle, DRM_IOCTL_BASE, 0x2e, DrmPrimeHandle);
ioctl_readwrite!(drm_wait_vblank, DRM_IOCTL_BASE, 0x3a, DrmWaitVblank);

ioctl_readwrite!(drm_mode_get_resources, DRM_IOCTL_BASE, 0xa0, DrmModeCardRes);
ioctl_readwrite!(drm_mode_get_crtc, DRM_IOCTL_BASE, 0xa1, DrmModeCrtc);
ioctl_readwrite!(drm_mode_get_gamma, DRM_IOCTL_BASE, 0xa4, DrmModeCrtcLut);
ioctl_readwrite!(drm_mode_set_gamma, DRM_IOCTL_BASE, 0xa5, DrmModeCrtcLut);
ioctl_readwrite!(drm_mode_get_encoder, DRM_IOCTL_BASE, 0xa6, DrmModeGetEncoder);
ioctl_readwrite!(drm_mode_get_connector, DRM_IOCTL_BASE, 0xa7, DrmModeGetConnector);
ioctl_readwrite!(drm_mode_get_property, DRM_IOCTL_BASE, 0xaa, DrmModeGetProperty);
ioctl_readwrite!(drm_mode_get_prop_blob, DRM_IOCTL_BASE, 0xac, DrmModeGetBlob);
ioctl_readwrite!(drm_mode_rm_fb, DRM_IOCTL_BASE, 0xaf, u32);
ioctl_readwrite!(drm_mode_create_dumb, DRM_IOCTL_BASE, 0xb2, DrmModeCreateDumb);
ioctl_readwrite!(drm_mode_map_dumb, DRM_IOCTL_BASE, 0xb3, DrmModeMapDumb);
ioctl_readwrite!(drm_mode_get_plane_resources, DRM_IOCTL_BASE, 0xb5, DrmModeGetPlaneRes);
ioctl_readwrite!(drm_mode_get_plane, DRM_IOCTL_BASE, 0xb6, DrmModeGetPlane);
ioctl_readwrite!(drm_mode_add_fb2, DRM_IOCTL_BASE, 0xb8, DrmModeFbCmd2);
ioctl_readwrite!(drm_mode_obj_get_properties, DRM_IOCTL_BASE, 0xb9, DrmModeObjGetProperties);
ioctl_readwrite!(drm_mode_atomic, DRM_IOCTL_BASE, 0xbc, DrmModeAtomic);
ioctl_readwrite!(drm_mode_create_prop_blob, DRM_IOCTL_BASE, 0xbd, DrmModeCreateBlob);
ioctl_readwrite!(drm_mode_destroy_prop_blob, DRM_IOCTL_BASE, 0xbe, DrmModeDestroyBlob);
ioctl_readwrite!(drm_syncobj_create, DRM_IOCTL_BASE, 0xbf, DrmSyncobjCreate);
ioctl_readwrite!(drm_syncobj_destroy, DRM_IOCTL_BASE, 0xc0, DrmSyncobjDestroy);
ioctl_readwrite!(drm_syncobj_wait, DRM_IOCTL_BASE, 0xc3, DrmSyncobjWait);
ioctl_readwrite!(drm_syncobj_signal, DRM_IOCTL_BASE, 0xc5, DrmSyncobjArray);

/// Repeat an ioctl while the kernel reports `EINTR` or `EAGAIN`, as libdrm does.
pub fn retry<F>(mut call: F) -> nix::Result<()>
where
    F: FnMut() -> nix::Result<c_int>,
{
    loop {
        match call() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes_match_uapi() {
        assert_eq!(size_of::<DrmModeModeInfo>(), 68);
        assert_eq!(size_of::<DrmModeCrtc>(), 104);
        assert_eq!(size_of::<DrmModeCardRes>(), 64);
        assert_eq!(size_of::<DrmModeGetConnector>(), 80);
        assert_eq!(size_of::<DrmModeGetProperty>(), 64);
        assert_eq!(size_of::<DrmModeGetPlane>(), 32);
        assert_eq!(size_of::<DrmModeGetPlaneRes>(), 16);
        assert_eq!(size_of::<DrmModeFbCmd2>(), 104);
        assert_eq!(size_of::<DrmModeAtomic>(), 56);
        assert_eq!(size_of::<DrmModeCreateDumb>(), 32);
        assert_eq!(size_of::<DrmModeObjGetProperties>(), 32);
        assert_eq!(size_of::<DrmPrimeHandle>(), 12);
        assert_eq!(size_of::<DrmSyncobjWait>(), 32);
        assert_eq!(size_of::<DrmEventVblank>(), 32);
    }

    #[test]
    fn retry_repeats_interrupted_calls() {
        let mut calls = 0;
        let result = retry(|| {
            calls += 1;
            if calls < 3 {
                Err(Errno::EINTR)
            } else {
                Ok(0)
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);

        let result = retry(|| Err(Errno::EINVAL));
        assert_eq!(result, Err(Errno::EINVAL));
    }
}
