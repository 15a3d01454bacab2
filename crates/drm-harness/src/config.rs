// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Test and harness configuration.

use crate::format::{Compression, Modifier, PixelFormat};
use std::time::Duration;

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_ITERATIONS: u32 = 100;

/// Upper bound for every blocking wait (VBLANK, syncobj).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Description of the buffers a single test allocates.
///
/// Values are fixed at construction; the `with_*` methods return a modified
/// copy instead of mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestConfig {
    width: u32,
    height: u32,
    format: PixelFormat,
    modifier: Modifier,
    compression: Compression,
    iterations: u32,
}

impl TestConfig {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            modifier: Modifier::LINEAR,
            compression: Compression::None,
            iterations: DEFAULT_ITERATIONS,
        }
    }

    pub fn with_modifier(self, modifier: Modifier) -> Self {
        Self { modifier, ..self }
    }

    pub fn with_compression(self, compression: Compression) -> Self {
        Self {
            compression,
            ..self
        }
    }

    pub fn with_iterations(self, iterations: u32) -> Self {
        Self { iterations, ..self }
    }

    pub fn with_format(self, format: PixelFormat) -> Self {
        Self { format, ..self }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Short identifier used in test and metric names.
    pub fn id(&self) -> String {
        format!(
            "{}x{}/{}/{}",
            self.width, self.height, self.format, self.modifier
        )
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, PixelFormat::Argb8888)
    }
}

/// Settings for one harness run, normally built from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Index of the card driven by every test (`/dev/dri/card<N>`).
    pub device_index: u32,
    /// Index of the card that imports buffers in the cross-device test.
    pub secondary_index: u32,
    pub width: u32,
    pub height: u32,
    /// Format, layout and compression of the reference buffers.
    pub format: PixelFormat,
    pub modifier: Modifier,
    pub compression: Compression,
    pub iterations: u32,
    pub timeout: Duration,
    /// Run only the test with this filter key; `None` or `all` runs everything.
    pub test_filter: Option<String>,
    /// Drive in-process virtual cards instead of `/dev/dri`.
    pub virtual_mode: bool,
}

impl HarnessConfig {
    /// The reference configuration every engine runs with.
    pub fn reference(&self) -> TestConfig {
        TestConfig::new(self.width, self.height, self.format)
            .with_modifier(self.modifier)
            .with_compression(self.compression)
            .with_iterations(self.iterations)
    }

    /// The planar configuration used for the second buffer-sharing pass.
    pub fn planar(&self) -> TestConfig {
        self.reference().with_format(PixelFormat::Nv12)
    }

    /// Whether no single test was asked for.
    pub fn runs_all(&self) -> bool {
        matches!(self.test_filter.as_deref(), None | Some("all"))
    }

    pub fn selects(&self, key: &str) -> bool {
        self.runs_all() || self.test_filter.as_deref() == Some(key)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            secondary_index: 1,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            format: PixelFormat::Argb8888,
            modifier: Modifier::LINEAR,
            compression: Compression::None,
            iterations: DEFAULT_ITERATIONS,
            timeout: DEFAULT_TIMEOUT,
            test_filter: None,
            virtual_mode: false,
        }
    }
}
