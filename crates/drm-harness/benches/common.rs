// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Shared benchmark infrastructure for the sharing benchmarks.

#![allow(dead_code)]

use criterion::Throughput;
use drm_harness::{
    DeviceContext, KernelBackend, PixelFormat, TestConfig, VirtualBus, VirtualTopology,
};
use std::sync::OnceLock;

// =============================================================================
// Hardware Availability Cache
// =============================================================================

static CARD0_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Check if /dev/dri/card0 can be driven (cached).
pub fn card0_available() -> bool {
    *CARD0_AVAILABLE.get_or_init(|| DeviceContext::initialize(&KernelBackend::new(), 0).is_ok())
}

// =============================================================================
// Target abstraction
// =============================================================================

/// Where a benchmark allocates its buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Virtual,
    Kernel,
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Virtual => "virtual",
            Target::Kernel => "card0",
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Target::Virtual => true,
            Target::Kernel => card0_available(),
        }
    }

    /// Open a context on this target. Virtual contexts get a private bus
    /// with two cards.
    pub fn open(&self) -> Option<(DeviceContext, Option<VirtualBus>)> {
        match self {
            Target::Virtual => {
                let bus = VirtualBus::with_cards(2, VirtualTopology::default());
                let ctx = DeviceContext::initialize(&bus, 0).ok()?;
                Some((ctx, Some(bus)))
            }
            Target::Kernel => {
                let ctx = DeviceContext::initialize(&KernelBackend::new(), 0).ok()?;
                Some((ctx, None))
            }
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Benchmark configuration
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BenchConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl BenchConfig {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn test_config(&self) -> TestConfig {
        TestConfig::new(self.width, self.height, self.format)
    }

    /// Bytes allocated for one buffer, before driver pitch alignment.
    pub fn buf_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.format.alloc_height(self.height))
            * u64::from(self.format.bpp() / 8)
    }

    pub fn throughput(&self) -> Throughput {
        Throughput::Bytes(self.buf_size())
    }

    pub fn id(&self) -> String {
        format!("{}x{}/{}", self.width, self.height, self.format)
    }
}
