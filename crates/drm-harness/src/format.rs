// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Pixel formats, layout modifiers and compression codes.
//!
//! DRM identifies pixel formats by little-endian fourcc codes (`AR24` is
//! `0x34325241`). Every format the harness knows how to allocate is listed in
//! [`PixelFormat`] together with the dumb-buffer geometry used to size it.

use four_char_code::{four_char_code, FourCharCode};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Rgb565,
    Nv12,
    Nv21,
    Yuv420,
    Yuv422,
    Yuv444,
    Yuyv,
    Yvyu,
    Uyvy,
    Vyuy,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 12] = [
        PixelFormat::Argb8888,
        PixelFormat::Xrgb8888,
        PixelFormat::Rgb565,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Yuv420,
        PixelFormat::Yuv422,
        PixelFormat::Yuv444,
        PixelFormat::Yuyv,
        PixelFormat::Yvyu,
        PixelFormat::Uyvy,
        PixelFormat::Vyuy,
    ];

    /// The DRM fourcc, e.g. `AR24`.
    pub fn fourcc(self) -> FourCharCode {
        match self {
            PixelFormat::Argb8888 => four_char_code!("AR24"),
            PixelFormat::Xrgb8888 => four_char_code!("XR24"),
            PixelFormat::Rgb565 => four_char_code!("RG16"),
            PixelFormat::Nv12 => four_char_code!("NV12"),
            PixelFormat::Nv21 => four_char_code!("NV21"),
            PixelFormat::Yuv420 => four_char_code!("YU12"),
            PixelFormat::Yuv422 => four_char_code!("YU16"),
            PixelFormat::Yuv444 => four_char_code!("YU24"),
            PixelFormat::Yuyv => four_char_code!("YUYV"),
            PixelFormat::Yvyu => four_char_code!("YVYU"),
            PixelFormat::Uyvy => four_char_code!("UYVY"),
            PixelFormat::Vyuy => four_char_code!("VYUY"),
        }
    }

    /// The value passed to the kernel in `ADDFB2` and reported by `GETPLANE`.
    ///
    /// `FourCharCode` packs the first character into the high byte; DRM
    /// stores it in the low byte.
    pub fn code(self) -> u32 {
        self.fourcc().as_u32().swap_bytes()
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let fourcc = FourCharCode::new(code.swap_bytes()).ok()?;
        Self::ALL.into_iter().find(|f| f.fourcc() == fourcc)
    }

    /// Parse either the fourcc name (`NV12`) or a descriptive alias (`argb8888`).
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        Self::ALL.into_iter().find(|f| {
            f.fourcc().to_string() == upper || format!("{f:?}").to_ascii_uppercase() == upper
        })
    }

    /// Bits per pixel of the first plane, as requested from `CREATE_DUMB`.
    pub fn bpp(self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 32,
            PixelFormat::Rgb565
            | PixelFormat::Yuyv
            | PixelFormat::Yvyu
            | PixelFormat::Uyvy
            | PixelFormat::Vyuy => 16,
            PixelFormat::Nv12
            | PixelFormat::Nv21
            | PixelFormat::Yuv420
            | PixelFormat::Yuv422
            | PixelFormat::Yuv444 => 8,
        }
    }

    /// Total rows of a single dumb allocation holding every plane, as a
    /// fraction of the image height.
    pub fn height_factor(self) -> (u32, u32) {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420 => (3, 2),
            PixelFormat::Yuv422 => (2, 1),
            PixelFormat::Yuv444 => (3, 1),
            _ => (1, 1),
        }
    }

    /// Row count to request for a `height`-row image.
    pub fn alloc_height(self, height: u32) -> u32 {
        let (num, den) = self.height_factor();
        (height * num).div_ceil(den)
    }

    pub fn is_planar(self) -> bool {
        self.height_factor() != (1, 1)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.fourcc().to_string())
    }
}

/// A DRM format modifier describing the memory layout of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Modifier(pub u64);

const fn vendor_modifier(vendor: u64, value: u64) -> u64 {
    (vendor << 56) | (value & 0x00ff_ffff_ffff_ffff)
}

const DRM_FORMAT_MOD_VENDOR_INTEL: u64 = 0x01;

impl Modifier {
    pub const LINEAR: Modifier = Modifier(0);
    pub const INVALID: Modifier = Modifier(0x00ff_ffff_ffff_ffff);
    pub const X_TILED: Modifier = Modifier(vendor_modifier(DRM_FORMAT_MOD_VENDOR_INTEL, 1));
    pub const Y_TILED: Modifier = Modifier(vendor_modifier(DRM_FORMAT_MOD_VENDOR_INTEL, 2));
    pub const YF_TILED: Modifier = Modifier(vendor_modifier(DRM_FORMAT_MOD_VENDOR_INTEL, 3));

    /// Layouts assumed when the device cannot report its own.
    pub const REFERENCE_TABLE: [Modifier; 4] = [
        Modifier::LINEAR,
        Modifier::X_TILED,
        Modifier::Y_TILED,
        Modifier::YF_TILED,
    ];

    pub fn is_linear(self) -> bool {
        self == Modifier::LINEAR
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "linear" => Some(Modifier::LINEAR),
            "x-tiled" | "x_tiled" => Some(Modifier::X_TILED),
            "y-tiled" | "y_tiled" => Some(Modifier::Y_TILED),
            "yf-tiled" | "yf_tiled" => Some(Modifier::YF_TILED),
            other => {
                let hex = other.strip_prefix("0x")?;
                u64::from_str_radix(hex, 16).ok().map(Modifier)
            }
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Modifier::LINEAR => f.write_str("LINEAR"),
            Modifier::INVALID => f.write_str("INVALID"),
            Modifier::X_TILED => f.write_str("X_TILED"),
            Modifier::Y_TILED => f.write_str("Y_TILED"),
            Modifier::YF_TILED => f.write_str("YF_TILED"),
            Modifier(raw) => write!(f, "{raw:#018x}"),
        }
    }
}

/// Texture compression scheme attached to a buffer configuration.
///
/// DRM has no query for these, so support is always decided by
/// [`Compression::REFERENCE_TABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Etc1,
    Etc2,
    Astc,
    Bc1,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc6h,
    Bc7,
}

impl Compression {
    pub const REFERENCE_TABLE: [Compression; 5] = [
        Compression::None,
        Compression::Etc1,
        Compression::Etc2,
        Compression::Astc,
        Compression::Bc1,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        let c = match name.to_ascii_lowercase().as_str() {
            "none" => Compression::None,
            "etc1" => Compression::Etc1,
            "etc2" => Compression::Etc2,
            "astc" => Compression::Astc,
            "bc1" => Compression::Bc1,
            "bc2" => Compression::Bc2,
            "bc3" => Compression::Bc3,
            "bc4" => Compression::Bc4,
            "bc5" => Compression::Bc5,
            "bc6h" => Compression::Bc6h,
            "bc7" => Compression::Bc7,
            _ => return None,
        };
        Some(c)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
