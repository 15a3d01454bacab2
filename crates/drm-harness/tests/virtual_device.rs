// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests against in-process virtual cards.
//!
//! These run everywhere; the same paths against real hardware live in
//! `hardware_tests.rs`.
//!
//! Run with: cargo test --test virtual_device

#![cfg(target_os = "linux")]

use drm_harness::atomic::{self, AtomicTransaction, Framebuffer, TransactionState};
use drm_harness::device::{ObjectRef, PlaneType, ATOMIC_ALLOW_MODESET, ATOMIC_NONBLOCK};
use drm_harness::perf::measure_buffer_sharing_latency;
use drm_harness::runner::{self, matrix};
use drm_harness::sharing::{self, SHARING_PATTERN};
use drm_harness::{
    BufferObject, Card, DeviceContext, Error, HarnessConfig, Modifier, Outcome, PixelFormat,
    Report, TestConfig, VirtualBus, VirtualTopology,
};
use std::time::{Duration, Instant};

const SHORT_WAIT: Duration = Duration::from_millis(50);

/// Scheduling margin allowed on top of a bounded wait.
const MARGIN: Duration = Duration::from_millis(500);

fn bus() -> VirtualBus {
    VirtualBus::with_cards(1, VirtualTopology::default())
}

fn context(bus: &VirtualBus) -> DeviceContext {
    let _ = env_logger::try_init();
    DeviceContext::initialize(bus, 0).expect("virtual card 0 should initialize")
}

fn harness(filter: &str) -> HarnessConfig {
    HarnessConfig {
        width: 640,
        height: 480,
        iterations: 10,
        timeout: SHORT_WAIT,
        test_filter: Some(filter.to_string()),
        ..Default::default()
    }
}

// ============================================================================
// Buffer lifecycle
// ============================================================================

#[test]
fn test_reference_buffer_round_trip() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let config = TestConfig::default();
    assert_eq!(config.id(), "1920x1080/AR24/LINEAR");

    let mut original = BufferObject::create(card, &config).unwrap();
    assert!(original.size() >= 1920 * 1080 * 4);
    original.fill(0xFF00_00FF).unwrap();

    let descriptor = original.export().unwrap();
    let imported = BufferObject::import_descriptor(card, &descriptor, &config);
    descriptor.close();
    let imported = imported.unwrap();
    assert!(imported.verify(0xFF00_00FF));
    assert!(!imported.verify(0xFF00_FF00));

    drop(imported);
    drop(original);
    assert!(card.outstanding().is_clean());
    assert_eq!(bus.device(0).unwrap().objects().handles, 0);
}

#[test]
fn test_destroy_is_idempotent() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();

    let mut buffer = BufferObject::create(card, &TestConfig::new(64, 64, PixelFormat::Argb8888))
        .unwrap();
    buffer.destroy().unwrap();
    assert!(buffer.is_destroyed());
    assert!(buffer.mapping().is_none());
    buffer.destroy().unwrap();
    assert!(!buffer.verify(0));
    assert!(buffer.fill(0).is_err());
    drop(buffer);
    assert!(card.outstanding().is_clean());
}

#[test]
fn test_reimported_objects_destroy_independently() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let config = TestConfig::new(128, 128, PixelFormat::Xrgb8888);

    let mut original = BufferObject::create(card, &config).unwrap();
    original.fill(SHARING_PATTERN).unwrap();
    let mut first = BufferObject::import_handle(card, original.handle(), &config).unwrap();
    let second = BufferObject::import_handle(card, original.handle(), &config).unwrap();
    assert_eq!(first.handle(), original.handle());

    first.destroy().unwrap();
    original.destroy().unwrap();
    assert_eq!(bus.device(0).unwrap().objects().handles, 1);
    assert!(second.verify(SHARING_PATTERN));
    drop(second);
    assert_eq!(bus.device(0).unwrap().objects().handles, 0);
    assert!(card.outstanding().is_clean());
}

#[test]
fn test_unknown_handle_import_fails() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let result = BufferObject::import_handle(card, 77, &TestConfig::default());
    assert!(matches!(result, Err(Error::ImportFailed { .. })));
    assert!(card.outstanding().is_clean());
}

#[test]
fn test_allocation_failure_leaves_nothing() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let result = BufferObject::create(card, &TestConfig::new(0, 16, PixelFormat::Argb8888));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert!(card.outstanding().is_clean());
}

#[test]
fn test_descriptor_counts_until_closed() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let buffer = BufferObject::create(card, &TestConfig::new(32, 32, PixelFormat::Argb8888))
        .unwrap();

    let descriptor = buffer.export().unwrap();
    assert_eq!(card.outstanding().descriptors, 1);
    descriptor.close();
    assert_eq!(card.outstanding().descriptors, 0);
    {
        let _dropped = buffer.export().unwrap();
        assert_eq!(card.outstanding().descriptors, 1);
    }
    assert_eq!(card.outstanding().descriptors, 0);
}

macro_rules! format_round_trip {
    ($($format:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                fn [<test_round_trip_ $format:snake>]() {
                    let bus = bus();
                    let ctx = context(&bus);
                    let config = TestConfig::new(320, 240, PixelFormat::$format);
                    sharing::test_buffer_sharing(&ctx, &config).unwrap();
                    assert!(ctx.card().unwrap().outstanding().is_clean());
                    assert_eq!(bus.device(0).unwrap().objects().handles, 0);
                }
            )*
        }
    };
}

format_round_trip!(
    Argb8888, Xrgb8888, Rgb565, Nv12, Nv21, Yuv420, Yuv422, Yuv444, Yuyv, Yvyu, Uyvy, Vyuy,
);

// ============================================================================
// Sharing engine
// ============================================================================

#[test]
fn test_cross_device_content_is_identical() {
    let bus = VirtualBus::with_cards(2, VirtualTopology::default());
    let ctx = context(&bus);
    let config = TestConfig::new(256, 128, PixelFormat::Argb8888);
    sharing::test_cross_device_sharing(&ctx, &bus, 1, &config).unwrap();
    assert!(ctx.card().unwrap().outstanding().is_clean());
    assert_eq!(bus.device(0).unwrap().objects().handles, 0);
    assert_eq!(bus.device(1).unwrap().objects().handles, 0);
}

#[test]
fn test_cross_device_write_is_visible_on_exporter() {
    let bus = VirtualBus::with_cards(2, VirtualTopology::default());
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let other = Card::open(&bus, 1).unwrap();
    let config = TestConfig::new(64, 64, PixelFormat::Argb8888);

    let original = BufferObject::create(card, &config).unwrap();
    let descriptor = original.export().unwrap();
    let imported = BufferObject::import_descriptor(&other, &descriptor, &config);
    descriptor.close();
    let mut imported = imported.unwrap();
    imported.fill(0x1234_5678).unwrap();
    assert!(original.verify(0x1234_5678));

    drop(imported);
    assert!(other.outstanding().is_clean());
}

// ============================================================================
// Atomic engine
// ============================================================================

#[test]
fn test_overlay_missing_is_skip() {
    let topology = VirtualTopology {
        planes: vec![PlaneType::Primary, PlaneType::Cursor],
        ..Default::default()
    };
    let bus = VirtualBus::with_cards(1, topology);
    let mut report = Report::new();
    assert!(runner::run(&bus, &harness("plane_config"), &mut report));

    let overlay = report.result("Overlay Plane Configuration").unwrap();
    assert_eq!(overlay.outcome, Outcome::Skip);
    let primary = report.result("Primary Plane Configuration").unwrap();
    assert_eq!(primary.outcome, Outcome::Pass);
    assert_eq!(
        report.result("Cursor Plane Configuration").unwrap().outcome,
        Outcome::Pass
    );
}

#[test]
fn test_oversized_commit_changes_nothing() {
    let topology = VirtualTopology {
        max_width: 1280,
        ..Default::default()
    };
    let bus = VirtualBus::with_cards(1, topology);
    let ctx = context(&bus);
    let device = bus.device(0).unwrap();
    let before = device.crtc_state();

    let result = atomic::test_crtc_configuration(&ctx, &TestConfig::default());
    assert!(matches!(result, Err(Error::CommitFailed { .. })), "{result:?}");
    assert_eq!(device.crtc_state(), before);

    let objects = device.objects();
    assert_eq!(objects.framebuffers, 0);
    assert_eq!(objects.blobs, 0);
    assert_eq!(objects.handles, 0);
    assert!(ctx.card().unwrap().outstanding().is_clean());
}

#[test]
fn test_invalid_geometry_rejects_whole_transaction() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let res = ctx.resources().unwrap();
    let device = bus.device(0).unwrap();
    let config = TestConfig::new(320, 240, PixelFormat::Argb8888);

    let buffer = BufferObject::create(card, &config).unwrap();
    let fb = Framebuffer::add(card, &buffer).unwrap();
    let primary = ObjectRef::plane(res.primary.id);

    let mut txn = AtomicTransaction::new(card);
    txn.add(primary, "FB_ID", u64::from(fb.id())).unwrap();
    txn.add(primary, "CRTC_ID", u64::from(res.crtc.id)).unwrap();
    txn.add(primary, "CRTC_W", 320).unwrap();
    txn.add(primary, "CRTC_H", 240).unwrap();
    // source rectangle larger than the framebuffer
    txn.add(primary, "SRC_W", 640 << 16).unwrap();
    txn.add(primary, "SRC_H", 240 << 16).unwrap();
    assert!(matches!(
        txn.commit(ATOMIC_NONBLOCK),
        Err(Error::CommitFailed { .. })
    ));
    assert_eq!(txn.state(), TransactionState::Freed);
    assert_eq!(device.plane_framebuffer(res.primary.id), None);
}

#[test]
fn test_unknown_property_frees_transaction() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let crtc = ObjectRef::crtc(ctx.resources().unwrap().crtc.id);

    let mut txn = AtomicTransaction::new(card);
    txn.add(crtc, "ACTIVE", 1).unwrap();
    assert!(matches!(
        txn.add(crtc, "NOT_A_PROPERTY", 1),
        Err(Error::PropertyNotFound { .. })
    ));
    assert_eq!(txn.state(), TransactionState::Freed);
    assert!(matches!(
        txn.commit(ATOMIC_ALLOW_MODESET),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_crtc_then_mode_setting() {
    let bus = bus();
    let ctx = context(&bus);
    let device = bus.device(0).unwrap();
    let before = device.crtc_state();
    atomic::test_crtc_configuration(&ctx, &TestConfig::default()).unwrap();

    let res = ctx.resources().unwrap();
    assert_eq!(device.crtc_state(), before);
    assert_eq!(device.plane_framebuffer(res.primary.id), None);
    assert_eq!(device.objects().framebuffers, 0);

    let expected = atomic::DisplayTiming {
        hdisplay: 1920,
        vdisplay: 1080,
        vrefresh: 60,
    };
    atomic::test_mode_setting(&ctx, &expected).unwrap();
    let wrong = atomic::DisplayTiming {
        vrefresh: 50,
        ..expected
    };
    assert!(matches!(
        atomic::test_mode_setting(&ctx, &wrong),
        Err(Error::VerificationFailed(_))
    ));
}

#[test]
fn test_removing_scanned_out_primary_stops_display() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let res = ctx.resources().unwrap();
    let config = TestConfig::new(640, 480, PixelFormat::Argb8888);

    let buffer = BufferObject::create(card, &config).unwrap();
    let fb = Framebuffer::add(card, &buffer).unwrap();
    let primary = ObjectRef::plane(res.primary.id);
    let mut txn = AtomicTransaction::new(card);
    for (name, value) in [
        ("FB_ID", u64::from(fb.id())),
        ("CRTC_ID", u64::from(res.crtc.id)),
        ("CRTC_W", 640),
        ("CRTC_H", 480),
        ("SRC_W", 640 << 16),
        ("SRC_H", 480 << 16),
    ] {
        txn.add(primary, name, value).unwrap();
    }
    txn.commit(ATOMIC_NONBLOCK).unwrap();
    drop(fb);

    // RMFB of the scanned-out primary switched the CRTC off
    let timing = atomic::DisplayTiming::from_mode(res.connector.preferred_mode().unwrap());
    assert!(matches!(
        atomic::test_mode_setting(&ctx, &timing),
        Err(Error::VerificationFailed(_))
    ));
    assert!(atomic::test_vblank_handling(&ctx, SHORT_WAIT).is_err());
}

#[test]
fn test_pipeline_tests_keep_display_for_later_tests() {
    let bus = bus();
    let ctx = context(&bus);
    let config = TestConfig::default();
    atomic::test_crtc_configuration(&ctx, &config).unwrap();
    for kind in [PlaneType::Primary, PlaneType::Overlay, PlaneType::Cursor] {
        atomic::test_plane_configuration(&ctx, &config, kind).unwrap();
    }

    let res = ctx.resources().unwrap();
    let timing = atomic::DisplayTiming::from_mode(res.connector.preferred_mode().unwrap());
    atomic::test_mode_setting(&ctx, &timing).unwrap();
    atomic::test_vblank_handling(&ctx, SHORT_WAIT).unwrap();
}

#[test]
fn test_configured_modifier_reaches_framebuffer() {
    let bus = bus();
    let ctx = context(&bus);
    let card = ctx.card().unwrap();
    let device = bus.device(0).unwrap();
    let config = HarnessConfig {
        width: 640,
        height: 480,
        modifier: Modifier::X_TILED,
        ..Default::default()
    }
    .reference();
    assert_eq!(config.id(), "640x480/AR24/X_TILED");

    let buffer = BufferObject::create(card, &config).unwrap();
    let fb = Framebuffer::add(card, &buffer).unwrap();
    let spec = device.framebuffer(fb.id()).unwrap();
    assert_eq!(spec.modifier, Some(Modifier::X_TILED.0));
    assert_eq!(spec.format, PixelFormat::Argb8888.code());
    drop(fb);

    atomic::test_plane_configuration(&ctx, &config, PlaneType::Overlay).unwrap();
    let unreported = config.with_modifier(Modifier::Y_TILED);
    let err = atomic::test_plane_configuration(&ctx, &unreported, PlaneType::Overlay).unwrap_err();
    assert!(err.is_skip(), "{err}");
}

#[test]
fn test_vblank_wait_is_bounded() {
    let topology = VirtualTopology {
        vblank: false,
        ..Default::default()
    };
    let bus = VirtualBus::with_cards(1, topology);
    let ctx = context(&bus);

    let start = Instant::now();
    let result = atomic::test_vblank_handling(&ctx, SHORT_WAIT);
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert!(elapsed >= SHORT_WAIT);
    assert!(elapsed < SHORT_WAIT + MARGIN, "waited {elapsed:?}");
}

#[test]
fn test_sync_primitives_release_syncobj() {
    let bus = bus();
    let ctx = context(&bus);
    let start = Instant::now();
    atomic::test_sync_primitives(&ctx, SHORT_WAIT).unwrap();
    assert!(start.elapsed() < SHORT_WAIT + MARGIN);
    assert_eq!(bus.device(0).unwrap().objects().syncobjs, 0);
}

#[test]
fn test_gamma_restored_after_check() {
    let bus = bus();
    let ctx = context(&bus);
    let device = bus.device(0).unwrap();
    let mut custom = drm_harness::device::GammaRamp::linear(256);
    custom.red.reverse();
    device.load_gamma(custom.clone());

    atomic::test_color_management(&ctx).unwrap();

    use drm_harness::device::Device;
    let crtc = ctx.resources().unwrap().crtc.id;
    assert_eq!(device.gamma(crtc, 256).unwrap(), custom);
}

#[test]
fn test_gamma_unsupported_is_skip() {
    let topology = VirtualTopology {
        gamma_size: 0,
        ..Default::default()
    };
    let bus = VirtualBus::with_cards(1, topology);
    let ctx = context(&bus);
    let err = atomic::test_color_management(&ctx).unwrap_err();
    assert!(err.is_skip(), "{err}");
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_disconnected_card_is_unavailable() {
    let topology = VirtualTopology {
        connected: false,
        ..Default::default()
    };
    let bus = VirtualBus::with_cards(1, topology);
    assert!(matches!(
        DeviceContext::initialize(&bus, 0),
        Err(Error::DeviceUnavailable { .. })
    ));
}

#[test]
fn test_unbound_crtc_is_not_found() {
    let topology = VirtualTopology {
        crtc_bound: false,
        ..Default::default()
    };
    let bus = VirtualBus::with_cards(1, topology);
    assert!(matches!(
        DeviceContext::initialize(&bus, 0),
        Err(Error::ResourceNotFound(_))
    ));
}

#[test]
fn test_reported_modifiers_are_authoritative() {
    use drm_harness::{Source, Support};

    let bus = bus();
    let ctx = context(&bus);
    let caps = ctx.capabilities().unwrap();
    assert_eq!(caps.modifier_source(), Source::Reported);
    assert_eq!(caps.modifier_support(Modifier::X_TILED), Support::Supported);
    assert_eq!(caps.format_support(PixelFormat::Nv21), Support::Unsupported);

    let bus = VirtualBus::with_cards(
        1,
        VirtualTopology {
            in_formats: None,
            ..Default::default()
        },
    );
    let ctx = context(&bus);
    let caps = ctx.capabilities().unwrap();
    assert_eq!(caps.modifier_source(), Source::Assumed);
    assert_eq!(caps.modifier_support(Modifier::X_TILED), Support::Unknown);
}

// ============================================================================
// Performance and runner
// ============================================================================

#[test]
fn test_latency_is_positive_and_sane() {
    let bus = bus();
    let ctx = context(&bus);
    let stats = measure_buffer_sharing_latency(&ctx, &TestConfig::default(), 100).unwrap();
    assert_eq!(stats.iterations, 100);
    assert!(stats.mean_nanos() > 0);
    assert!(stats.mean() < Duration::from_millis(50), "{stats}");
    assert!(ctx.card().unwrap().outstanding().is_clean());
}

#[test]
fn test_latency_failure_surfaces_error() {
    let bus = bus();
    let ctx = context(&bus);
    let config = TestConfig::new(0, 0, PixelFormat::Argb8888);
    assert!(measure_buffer_sharing_latency(&ctx, &config, 10).is_err());
}

#[test]
fn test_full_matrix_passes() {
    let bus = VirtualBus::with_cards(2, VirtualTopology::default());
    let mut report = Report::new();
    assert!(runner::run(&bus, &harness("all"), &mut report), "{report}");
    assert_eq!(report.results().len(), matrix(&harness("all")).len() + 1);
    assert_eq!(report.count(Outcome::Fail), 0);
    assert_eq!(
        report.result(runner::ALL_FEATURES).unwrap().outcome,
        Outcome::Pass
    );
    assert_eq!(report.result("Mode Setting").unwrap().outcome, Outcome::Pass);
    assert_eq!(report.metrics()[0].unit, "us");

    for index in 0..2 {
        let objects = bus.device(index).unwrap().objects();
        assert_eq!(objects.handles, 0, "card {index}");
        assert_eq!(objects.framebuffers, 0, "card {index}");
        assert_eq!(objects.syncobjs, 0, "card {index}");
    }
}

#[test]
fn test_failures_do_not_stop_the_matrix() {
    let topology = VirtualTopology {
        vblank: false,
        ..Default::default()
    };
    // no secondary card and no VBLANK: two failures plus the aggregate,
    // everything else runs
    let bus = VirtualBus::with_cards(1, topology);
    let config = harness("all");
    let mut report = Report::new();
    assert!(!runner::run(&bus, &config, &mut report));
    assert_eq!(report.results().len(), matrix(&config).len() + 1);
    assert_eq!(
        report.result("VBLANK Handling").unwrap().outcome,
        Outcome::Fail
    );
    assert_eq!(
        report.result("Cross-Device Sharing").unwrap().outcome,
        Outcome::Fail
    );
    assert_eq!(
        report.result(runner::ALL_FEATURES).unwrap().outcome,
        Outcome::Fail
    );
    assert_eq!(report.count(Outcome::Fail), 3);
}

#[test]
fn test_filter_runs_one_test() {
    let bus = bus();
    let mut report = Report::new();
    assert!(runner::run(&bus, &harness("sync"), &mut report));
    assert_eq!(report.results().len(), 1);
    assert_eq!(report.results()[0].name, "Sync Primitives");
}
