// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use clap::builder::PossibleValuesParser;
use clap::Parser;
use drm_harness::{
    runner, Backend, Compression, HarnessConfig, KernelBackend, Modifier, PixelFormat, Report,
    VirtualBus, VirtualTopology,
};
use log::info;
use std::process::ExitCode;
use std::time::Duration;

/// DRM buffer sharing and atomic mode-setting conformance tests
#[derive(Parser, Debug)]
#[command(name = "drm-harness", version)]
#[command(about = "Buffer sharing and atomic mode-setting tests for DRM drivers", long_about = None)]
struct Args {
    /// Test to run
    #[arg(short, long, default_value = "all", value_parser = PossibleValuesParser::new(runner::TEST_KEYS))]
    test: String,

    /// Card index under /dev/dri
    #[arg(short, long, default_value_t = 0)]
    device: u32,

    /// Card that imports buffers in the cross-device test
    #[arg(short, long, default_value_t = 1)]
    secondary: u32,

    /// Buffer width in pixels
    #[arg(short = 'W', long, default_value_t = 1920)]
    width: u32,

    /// Buffer height in pixels
    #[arg(short = 'H', long, default_value_t = 1080)]
    height: u32,

    /// Pixel format of the reference buffers, e.g. AR24 or argb8888
    #[arg(short, long, default_value = "AR24", value_parser = parse_format)]
    format: PixelFormat,

    /// Layout modifier (linear, x-tiled, y-tiled, yf-tiled or a 0x value)
    #[arg(short, long, default_value = "linear", value_parser = parse_modifier)]
    modifier: Modifier,

    /// Texture compression tag (none, etc1, etc2, astc, bc1..bc7)
    #[arg(short, long, default_value = "none", value_parser = parse_compression)]
    compression: Compression,

    /// Iterations of the latency measurement
    #[arg(short, long, default_value_t = 100)]
    iterations: u32,

    /// Upper bound for VBLANK and syncobj waits
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Run against two in-process virtual cards
    #[arg(long = "virtual")]
    virtual_mode: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,
}

impl From<Args> for HarnessConfig {
    fn from(args: Args) -> Self {
        Self {
            device_index: args.device,
            secondary_index: args.secondary,
            width: args.width,
            height: args.height,
            format: args.format,
            modifier: args.modifier,
            compression: args.compression,
            iterations: args.iterations,
            timeout: Duration::from_millis(args.timeout_ms),
            test_filter: Some(args.test),
            virtual_mode: args.virtual_mode,
        }
    }
}

fn parse_format(s: &str) -> Result<PixelFormat, String> {
    PixelFormat::from_name(s).ok_or_else(|| format!("unknown pixel format {s:?}"))
}

fn parse_modifier(s: &str) -> Result<Modifier, String> {
    Modifier::from_name(s).ok_or_else(|| format!("unknown modifier {s:?}"))
}

fn parse_compression(s: &str) -> Result<Compression, String> {
    Compression::from_name(s).ok_or_else(|| format!("unknown compression {s:?}"))
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    info!("drm-harness v{}", env!("CARGO_PKG_VERSION"));
    let config = HarnessConfig::from(args);

    let backend: Box<dyn Backend> = if config.virtual_mode {
        let bus = VirtualBus::new();
        bus.insert(config.device_index, VirtualTopology::default());
        bus.insert(config.secondary_index, VirtualTopology::default());
        Box::new(bus)
    } else {
        Box::new(KernelBackend::new())
    };

    let mut report = Report::new();
    let passed = runner::run(backend.as_ref(), &config, &mut report);
    println!("{report}");

    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
