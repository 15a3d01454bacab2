// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Conformance tests for Linux DRM/KMS drivers.
//!
//! The harness exercises buffer allocation, PRIME export and import,
//! cross-device sharing and the atomic mode-setting pipeline of one card
//! and reports each test as pass, fail or skip. Every kernel object it
//! creates is owned by a guard and tracked, so a test that leaks a handle,
//! mapping or descriptor fails even when its own checks pass.
//!
//! Tests run against either the kernel (`/dev/dri/card<N>`) through
//! [`KernelBackend`] or in-process cards through [`VirtualBus`].
//!
//! ```no_run
//! use drm_harness::{runner, HarnessConfig, KernelBackend, Report};
//!
//! let mut report = Report::new();
//! let passed = runner::run(&KernelBackend::new(), &HarnessConfig::default(), &mut report);
//! println!("{report}");
//! assert!(passed);
//! ```

pub mod atomic;
pub mod buffer;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod format;
pub mod perf;
pub mod report;
pub mod runner;
pub mod sharing;

pub use buffer::{BufferObject, Descriptor, Mapping, Outstanding, ResourceLedger};
pub use config::{HarnessConfig, TestConfig};
pub use device::{Backend, Device, KernelBackend, VirtualBus, VirtualDevice, VirtualTopology};
pub use discovery::{Card, CapabilitySet, DeviceContext, DisplayResources, Source, Support};
pub use error::{Error, Result};
pub use format::{Compression, Modifier, PixelFormat};
pub use report::{Outcome, Report, Reporter, Subsystem};
