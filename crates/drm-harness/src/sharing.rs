// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Buffer sharing through PRIME descriptors.

use crate::buffer::BufferObject;
use crate::config::TestConfig;
use crate::device::Backend;
use crate::discovery::{Card, DeviceContext};
use crate::error::{Error, Result};
use log::{debug, error};

/// Pattern written before a same-device round trip.
pub const SHARING_PATTERN: u32 = 0xff00_00ff;

/// Pattern written before handing a buffer to another card.
pub const CROSS_DEVICE_PATTERN: u32 = 0xff00_ff00;

fn verify(buffer: &BufferObject<'_>, pattern: u32, what: &str) -> Result<()> {
    if buffer.verify(pattern) {
        Ok(())
    } else {
        Err(Error::VerificationFailed(format!(
            "{what}: handle {} does not hold {pattern:#010x}",
            buffer.handle()
        )))
    }
}

/// Create, export and re-import a buffer on the same card, then check the
/// two objects can be destroyed independently.
pub fn test_buffer_sharing(ctx: &DeviceContext, config: &TestConfig) -> Result<()> {
    let card = ctx.card()?;
    let mut original = BufferObject::create(card, config)?;
    original.fill(SHARING_PATTERN)?;

    let descriptor = original.export()?;
    let imported = BufferObject::import_descriptor(card, &descriptor, config);
    descriptor.close();
    let mut imported = imported?;
    verify(&imported, SHARING_PATTERN, "descriptor import")?;

    let mut reopened = BufferObject::import_handle(card, original.handle(), config)?;
    verify(&reopened, SHARING_PATTERN, "handle import")?;

    imported.destroy()?;
    reopened.destroy()?;
    verify(&original, SHARING_PATTERN, "original after destroying imports")?;
    original.destroy()
}

/// Hand a filled buffer to card `secondary` and read it back there.
pub fn test_cross_device_sharing(
    ctx: &DeviceContext,
    backend: &dyn Backend,
    secondary: u32,
    config: &TestConfig,
) -> Result<()> {
    let card = ctx.card()?;
    let mut original = BufferObject::create(card, config)?;
    original.fill(CROSS_DEVICE_PATTERN)?;
    let descriptor = original.export()?;

    let other = Card::open(backend, secondary)?;
    debug!("{} -> {}: sharing handle {}", card.path(), other.path(), original.handle());
    let imported = BufferObject::import_descriptor(&other, &descriptor, config);
    descriptor.close();
    let imported = imported?;
    let result = verify(&imported, CROSS_DEVICE_PATTERN, "cross-device import");
    drop(imported);

    let outstanding = other.outstanding();
    if !outstanding.is_clean() {
        error!("{}: {outstanding} left after cross-device import", other.path());
        return Err(Error::VerificationFailed(format!(
            "{} leaked {outstanding}",
            other.path()
        )));
    }
    result
}

/// Export a buffer described by `src` and import it as `dst`. The memory
/// must arrive unchanged; converting pixels is the driver's business.
pub fn test_format_conversion(
    ctx: &DeviceContext,
    src: &TestConfig,
    dst: &TestConfig,
) -> Result<()> {
    let card = ctx.card()?;
    let mut source = BufferObject::create(card, src)?;
    source.fill(SHARING_PATTERN)?;
    let descriptor = source.export()?;
    let target = BufferObject::import_descriptor(card, &descriptor, dst);
    descriptor.close();
    let target = target?;
    debug!(
        "format conversion {} -> {}: {} bytes",
        src.format(),
        target.format(),
        target.size()
    );
    verify(&target, SHARING_PATTERN, "converted import")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{VirtualBus, VirtualTopology};
    use crate::format::PixelFormat;

    #[test]
    fn same_device_round_trip_leaves_nothing() {
        let bus = VirtualBus::with_cards(1, VirtualTopology::default());
        let ctx = DeviceContext::initialize(&bus, 0).unwrap();
        test_buffer_sharing(&ctx, &TestConfig::new(320, 240, PixelFormat::Argb8888)).unwrap();
        test_buffer_sharing(&ctx, &TestConfig::new(320, 240, PixelFormat::Nv12)).unwrap();
        assert!(ctx.card().unwrap().outstanding().is_clean());
        assert_eq!(bus.device(0).unwrap().objects().handles, 0);
    }

    #[test]
    fn missing_secondary_fails_closed() {
        let bus = VirtualBus::with_cards(1, VirtualTopology::default());
        let ctx = DeviceContext::initialize(&bus, 0).unwrap();
        let config = TestConfig::new(64, 64, PixelFormat::Argb8888);
        assert!(matches!(
            test_cross_device_sharing(&ctx, &bus, 1, &config),
            Err(Error::DeviceUnavailable { .. })
        ));
        assert!(ctx.card().unwrap().outstanding().is_clean());
    }

    #[test]
    fn conversion_keeps_content() {
        let bus = VirtualBus::with_cards(1, VirtualTopology::default());
        let ctx = DeviceContext::initialize(&bus, 0).unwrap();
        let src = TestConfig::new(128, 64, PixelFormat::Argb8888);
        test_format_conversion(&ctx, &src, &src.with_format(PixelFormat::Xrgb8888)).unwrap();
        test_format_conversion(&ctx, &src, &src.with_format(PixelFormat::Nv12)).unwrap();
        assert!(ctx.card().unwrap().outstanding().is_clean());
    }
}
