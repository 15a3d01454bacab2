// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! The test matrix and its runner.

use crate::atomic::{self, DisplayTiming};
use crate::config::{HarnessConfig, TestConfig};
use crate::device::{Backend, PlaneType};
use crate::discovery::DeviceContext;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::perf;
use crate::report::{Outcome, Reporter, Subsystem};
use crate::sharing;
use log::{error, info};
use std::time::Instant;

/// Every accepted `--test` value.
pub const TEST_KEYS: [&str; 12] = [
    "buffer_sharing",
    "format_conversion",
    "performance",
    "plane_config",
    "crtc",
    "connector",
    "mode",
    "vblank",
    "sync",
    "color",
    "cross_device",
    "all",
];

/// One entry of the test matrix with the inputs it runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestKind {
    BufferSharing(TestConfig),
    FormatConversion(TestConfig, TestConfig),
    Performance(TestConfig),
    PlaneConfiguration(TestConfig, PlaneType),
    CrtcConfiguration(TestConfig),
    ConnectorProperties,
    ModeSetting,
    VblankHandling,
    SyncPrimitives,
    ColorManagement,
    CrossDeviceSharing(TestConfig),
}

impl TestKind {
    /// The `--test` filter key selecting this test.
    pub fn key(&self) -> &'static str {
        match self {
            TestKind::BufferSharing(_) => "buffer_sharing",
            TestKind::FormatConversion(..) => "format_conversion",
            TestKind::Performance(_) => "performance",
            TestKind::PlaneConfiguration(..) => "plane_config",
            TestKind::CrtcConfiguration(_) => "crtc",
            TestKind::ConnectorProperties => "connector",
            TestKind::ModeSetting => "mode",
            TestKind::VblankHandling => "vblank",
            TestKind::SyncPrimitives => "sync",
            TestKind::ColorManagement => "color",
            TestKind::CrossDeviceSharing(_) => "cross_device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub kind: TestKind,
}

impl TestCase {
    fn new(name: impl Into<String>, kind: TestKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Name of the record summarising a full run.
pub const ALL_FEATURES: &str = "All DRM Features";

/// Every test selected by `config`, in run order.
pub fn matrix(config: &HarnessConfig) -> Vec<TestCase> {
    let reference = config.reference();
    let planar = config.planar();
    let xrgb = reference.with_format(PixelFormat::Xrgb8888);
    let plane = |kind: PlaneType| {
        TestCase::new(
            format!("{kind:?} Plane Configuration"),
            TestKind::PlaneConfiguration(reference, kind),
        )
    };
    let all = vec![
        TestCase::new(
            format!("Buffer Sharing ({})", reference.format()),
            TestKind::BufferSharing(reference),
        ),
        TestCase::new(
            format!("Buffer Sharing ({})", planar.format()),
            TestKind::BufferSharing(planar),
        ),
        TestCase::new(
            format!("Format Conversion ({} -> {})", reference.format(), xrgb.format()),
            TestKind::FormatConversion(reference, xrgb),
        ),
        TestCase::new(
            format!("Format Conversion ({} -> {})", reference.format(), planar.format()),
            TestKind::FormatConversion(reference, planar),
        ),
        TestCase::new("Buffer Sharing Performance", TestKind::Performance(reference)),
        plane(PlaneType::Primary),
        plane(PlaneType::Overlay),
        plane(PlaneType::Cursor),
        TestCase::new("CRTC Configuration", TestKind::CrtcConfiguration(reference)),
        TestCase::new("Connector Properties", TestKind::ConnectorProperties),
        TestCase::new("Mode Setting", TestKind::ModeSetting),
        TestCase::new("VBLANK Handling", TestKind::VblankHandling),
        TestCase::new("Sync Primitives", TestKind::SyncPrimitives),
        TestCase::new("Color Management", TestKind::ColorManagement),
        TestCase::new("Cross-Device Sharing", TestKind::CrossDeviceSharing(reference)),
    ];
    all.into_iter()
        .filter(|case| config.selects(case.kind.key()))
        .collect()
}

fn execute(
    ctx: &DeviceContext,
    backend: &dyn Backend,
    config: &HarnessConfig,
    kind: &TestKind,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    match kind {
        TestKind::BufferSharing(c) => sharing::test_buffer_sharing(ctx, c),
        TestKind::FormatConversion(src, dst) => sharing::test_format_conversion(ctx, src, dst),
        TestKind::Performance(c) => {
            let stats = perf::measure_buffer_sharing_latency(ctx, c, c.iterations())?;
            reporter.record_metric(
                "Buffer sharing latency",
                stats.mean().as_secs_f64() * 1e6,
                "us",
            );
            Ok(())
        }
        TestKind::PlaneConfiguration(c, plane) => atomic::test_plane_configuration(ctx, c, *plane),
        TestKind::CrtcConfiguration(c) => atomic::test_crtc_configuration(ctx, c),
        TestKind::ConnectorProperties => {
            let expected = ctx.resources()?.connector.clone();
            atomic::test_connector_properties(ctx, &expected)
        }
        TestKind::ModeSetting => {
            let expected = ctx
                .resources()?
                .connector
                .preferred_mode()
                .map(DisplayTiming::from_mode)
                .ok_or_else(|| Error::ResourceNotFound("preferred mode".into()))?;
            atomic::test_mode_setting(ctx, &expected)
        }
        TestKind::VblankHandling => atomic::test_vblank_handling(ctx, config.timeout),
        TestKind::SyncPrimitives => atomic::test_sync_primitives(ctx, config.timeout),
        TestKind::ColorManagement => atomic::test_color_management(ctx),
        TestKind::CrossDeviceSharing(c) => {
            sharing::test_cross_device_sharing(ctx, backend, config.secondary_index, c)
        }
    }
}

/// Run one test, check the card for leaked resources and report it.
pub fn run_case(
    ctx: &DeviceContext,
    backend: &dyn Backend,
    config: &HarnessConfig,
    case: &TestCase,
    reporter: &mut dyn Reporter,
) -> Outcome {
    let start = Instant::now();
    let result = execute(ctx, backend, config, &case.kind, reporter);
    let duration = start.elapsed();

    let (mut outcome, mut message) = match result {
        Ok(()) => (Outcome::Pass, String::new()),
        Err(e) if e.is_skip() => (Outcome::Skip, e.to_string()),
        Err(e) => (Outcome::Fail, e.to_string()),
    };
    if let Ok(card) = ctx.card() {
        let outstanding = card.outstanding();
        if !outstanding.is_clean() {
            error!("{}: {} leaked {outstanding}", card.path(), case.name);
            outcome = Outcome::Fail;
            message = format!("leaked {outstanding}");
        }
    }
    reporter.record_result(&case.name, Subsystem::Graphics, outcome, duration, &message);
    outcome
}

/// Run every selected test against an initialised context. Returns true
/// when none failed; skips count as passes.
pub fn run_all(
    ctx: &DeviceContext,
    backend: &dyn Backend,
    config: &HarnessConfig,
    reporter: &mut dyn Reporter,
) -> bool {
    let mut passed = true;
    for case in matrix(config) {
        passed &= run_case(ctx, backend, config, &case, reporter) != Outcome::Fail;
    }
    passed
}

/// Open the configured card, run the matrix and tear everything down.
/// A discovery failure is reported as a single failed test. When no single
/// test was asked for, the conjunction is also recorded as
/// [`ALL_FEATURES`].
pub fn run(backend: &dyn Backend, config: &HarnessConfig, reporter: &mut dyn Reporter) -> bool {
    let start = Instant::now();
    let mut ctx = match DeviceContext::initialize(backend, config.device_index) {
        Ok(ctx) => ctx,
        Err(e) => {
            reporter.record_result(
                "DRM Initialization",
                Subsystem::Graphics,
                Outcome::Fail,
                start.elapsed(),
                &e.to_string(),
            );
            return false;
        }
    };
    info!("discovery took {:?}", start.elapsed());
    let passed = run_all(&ctx, backend, config, reporter);
    if config.runs_all() {
        let (outcome, message) = if passed {
            (Outcome::Pass, "")
        } else {
            (Outcome::Fail, "one or more tests failed")
        };
        reporter.record_result(
            ALL_FEATURES,
            Subsystem::Graphics,
            outcome,
            start.elapsed(),
            message,
        );
    }
    ctx.teardown();
    passed
}
