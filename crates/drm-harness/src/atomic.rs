// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Atomic mode-setting transactions and the display pipeline tests.
//!
//! Each test allocates what it scans out, wraps every kernel object in a
//! guard and returns `Ok(())` on pass. Guards are declared in acquisition
//! order so they are released in reverse: framebuffer before buffer, blob
//! before framebuffer. Tests that scan out a buffer put the display back the
//! way they found it before their framebuffer goes away.

use crate::buffer::BufferObject;
use crate::config::TestConfig;
use crate::device::{
    ConnectorInfo, FramebufferSpec, GammaRamp, ModeInfo, ObjectRef, PlaneType, Property,
    PropertyValue, ATOMIC_ALLOW_MODESET, ATOMIC_NONBLOCK,
};
use crate::discovery::{Card, DeviceContext, Support};
use crate::error::{Error, Result};
use log::{debug, trace, warn};
use nix::errno::Errno;
use std::collections::HashMap;
use std::time::Duration;

/// Pattern written to every buffer scanned out by the pipeline tests.
const SCANOUT_PATTERN: u32 = 0xff20_4060;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Allocated; triples may still be added.
    Built,
    /// Complete and about to be submitted.
    Populated,
    Committed,
    /// Abandoned or rejected; never submitted again.
    Freed,
}

/// An ordered set of property changes submitted as one atomic commit.
pub struct AtomicTransaction<'c> {
    card: &'c Card,
    values: Vec<PropertyValue>,
    state: TransactionState,
    properties: HashMap<ObjectRef, Vec<Property>>,
}

impl<'c> AtomicTransaction<'c> {
    pub fn new(card: &'c Card) -> Self {
        Self {
            card,
            values: Vec::new(),
            state: TransactionState::Built,
            properties: HashMap::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn property_id(&mut self, object: ObjectRef, name: &str) -> Result<u32> {
        if !self.properties.contains_key(&object) {
            let props = self
                .card
                .device()
                .properties(object)
                .map_err(Error::device("OBJ_GETPROPERTIES"))?;
            self.properties.insert(object, props);
        }
        self.properties
            .get(&object)
            .and_then(|props| props.iter().find(|p| p.name == name))
            .map(|p| p.id)
            .ok_or_else(|| Error::PropertyNotFound {
                object: object.id,
                name: name.to_string(),
            })
    }

    /// Append one `(object, property, value)` triple. A failure abandons
    /// the whole transaction.
    pub fn add(&mut self, object: ObjectRef, name: &str, value: u64) -> Result<()> {
        if self.state != TransactionState::Built {
            return Err(Error::InvalidArgument(format!(
                "add to a {:?} transaction",
                self.state
            )));
        }
        match self.property_id(object, name) {
            Ok(property) => {
                trace!("atomic: {}.{name} = {value}", object.id);
                self.values.push(PropertyValue {
                    object: object.id,
                    property,
                    value,
                });
                Ok(())
            }
            Err(e) => {
                self.free();
                Err(e)
            }
        }
    }

    /// Submit every triple as one kernel request.
    pub fn commit(&mut self, flags: u32) -> Result<()> {
        if self.state != TransactionState::Built || self.values.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "commit of a {:?} transaction with {} properties",
                self.state,
                self.values.len()
            )));
        }
        self.state = TransactionState::Populated;
        match self.card.device().atomic_commit(&self.values, flags) {
            Ok(()) => {
                debug!(
                    "{}: committed {} properties (flags {flags:#x})",
                    self.card.path(),
                    self.values.len()
                );
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(source) => {
                self.free();
                Err(Error::CommitFailed { source })
            }
        }
    }

    fn free(&mut self) {
        self.values.clear();
        self.properties.clear();
        self.state = TransactionState::Freed;
    }
}

impl Drop for AtomicTransaction<'_> {
    fn drop(&mut self) {
        if self.state != TransactionState::Freed {
            self.free();
        }
    }
}

/// A framebuffer wrapping a buffer object, removed on drop.
pub struct Framebuffer<'c> {
    card: &'c Card,
    id: u32,
}

impl<'c> Framebuffer<'c> {
    pub fn add(card: &'c Card, buffer: &BufferObject<'_>) -> Result<Self> {
        let modifier = buffer.modifier();
        let spec = FramebufferSpec {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format().code(),
            handle: buffer.handle(),
            pitch: buffer.pitch(),
            modifier: (!modifier.is_linear()).then_some(modifier.0),
        };
        let id = card
            .device()
            .add_framebuffer(&spec)
            .map_err(Error::device("ADDFB2"))?;
        Ok(Self { card, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for Framebuffer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.card.device().remove_framebuffer(self.id) {
            warn!("{}: RMFB {}: {e}", self.card.path(), self.id);
        }
    }
}

/// A property blob, destroyed on drop.
pub struct PropertyBlob<'c> {
    card: &'c Card,
    id: u32,
}

impl<'c> PropertyBlob<'c> {
    pub fn new(card: &'c Card, data: &[u8]) -> Result<Self> {
        let id = card
            .device()
            .create_blob(data)
            .map_err(Error::device("CREATEPROPBLOB"))?;
        Ok(Self { card, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PropertyBlob<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.card.device().destroy_blob(self.id) {
            warn!("{}: DESTROYPROPBLOB {}: {e}", self.card.path(), self.id);
        }
    }
}

struct SyncObject<'c> {
    card: &'c Card,
    handle: u32,
}

impl Drop for SyncObject<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.card.device().syncobj_destroy(self.handle) {
            warn!("{}: SYNCOBJ_DESTROY {}: {e}", self.card.path(), self.handle);
        }
    }
}

/// Plane properties a scan-out commit writes.
const PLANE_GEOMETRY: [&str; 10] = [
    "FB_ID", "CRTC_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W",
    "SRC_H",
];

/// Display state captured before a pipeline test commits and committed back
/// when dropped, before the test's framebuffer is removed.
///
/// RMFB on a framebuffer that is still scanned out disables its plane, and
/// for a primary plane usually the whole CRTC.
struct SavedDisplay<'c> {
    card: &'c Card,
    values: Vec<(ObjectRef, &'static str, u64)>,
    /// Copy of the CRTC's mode; the original blob may not outlive the swap.
    mode: Option<PropertyBlob<'c>>,
    armed: bool,
}

impl<'c> SavedDisplay<'c> {
    /// Capture the geometry of `plane`, plus the `(crtc, connector)` routing
    /// and mode when `modeset` is given.
    fn capture(card: &'c Card, plane: u32, modeset: Option<(u32, u32)>) -> Result<Self> {
        let mut saved = Self {
            card,
            values: Vec::new(),
            mode: None,
            armed: false,
        };
        saved.read(ObjectRef::plane(plane), &PLANE_GEOMETRY)?;
        if let Some((crtc, connector)) = modeset {
            saved.read(ObjectRef::crtc(crtc), &["ACTIVE"])?;
            saved.read(ObjectRef::connector(connector), &["CRTC_ID"])?;
            let mode = card
                .device()
                .crtc(crtc)
                .map_err(Error::device("GETCRTC"))?
                .mode;
            let blob = match mode {
                Some(mode) => Some(PropertyBlob::new(card, &mode.to_blob())?),
                None => None,
            };
            let id = blob.as_ref().map_or(0, |b| b.id());
            saved.values.push((ObjectRef::crtc(crtc), "MODE_ID", u64::from(id)));
            saved.mode = blob;
        }
        Ok(saved)
    }

    fn read(&mut self, object: ObjectRef, names: &[&'static str]) -> Result<()> {
        let props = self
            .card
            .device()
            .properties(object)
            .map_err(Error::device("OBJ_GETPROPERTIES"))?;
        for &name in names {
            if let Some(p) = props.iter().find(|p| p.name == name) {
                self.values.push((object, name, p.value));
            }
        }
        Ok(())
    }

    /// Restore on drop; only needed once the test's commit went through.
    fn arm(&mut self) {
        self.armed = true;
    }

    fn restore(&self) -> Result<()> {
        let mut txn = AtomicTransaction::new(self.card);
        for &(object, name, value) in &self.values {
            txn.add(object, name, value)?;
        }
        txn.commit(ATOMIC_ALLOW_MODESET)
    }
}

impl Drop for SavedDisplay<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.restore() {
            Ok(()) => debug!("{}: display state restored", self.card.path()),
            Err(e) => warn!("{}: restoring display state: {e}", self.card.path()),
        }
    }
}

/// Expected timings of the active display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTiming {
    pub hdisplay: u16,
    pub vdisplay: u16,
    pub vrefresh: u32,
}

impl DisplayTiming {
    pub fn from_mode(mode: &ModeInfo) -> Self {
        Self {
            hdisplay: mode.hdisplay,
            vdisplay: mode.vdisplay,
            vrefresh: mode.vrefresh,
        }
    }
}

/// Add the ten properties that put `fb` full-size on `plane`. Source
/// coordinates are 16.16 fixed point.
fn add_plane_properties(
    txn: &mut AtomicTransaction<'_>,
    plane: u32,
    crtc: u32,
    fb: &Framebuffer<'_>,
    config: &TestConfig,
) -> Result<()> {
    let plane = ObjectRef::plane(plane);
    let (w, h) = (u64::from(config.width()), u64::from(config.height()));
    txn.add(plane, "FB_ID", u64::from(fb.id()))?;
    txn.add(plane, "CRTC_ID", u64::from(crtc))?;
    txn.add(plane, "CRTC_X", 0)?;
    txn.add(plane, "CRTC_Y", 0)?;
    txn.add(plane, "CRTC_W", w)?;
    txn.add(plane, "CRTC_H", h)?;
    txn.add(plane, "SRC_X", 0)?;
    txn.add(plane, "SRC_Y", 0)?;
    txn.add(plane, "SRC_W", w << 16)?;
    txn.add(plane, "SRC_H", h << 16)
}

/// Full mode set: activate the CRTC with its mode, route the connector to
/// it and scan out a fresh buffer on the primary plane.
pub fn test_crtc_configuration(ctx: &DeviceContext, config: &TestConfig) -> Result<()> {
    let card = ctx.card()?;
    let res = ctx.resources()?;
    let mode = res
        .crtc
        .mode
        .as_ref()
        .or_else(|| res.connector.preferred_mode())
        .ok_or_else(|| Error::ResourceNotFound("display mode".into()))?;

    let mut buffer = BufferObject::create(card, config)?;
    buffer.fill(SCANOUT_PATTERN)?;
    let fb = Framebuffer::add(card, &buffer)?;
    let blob = PropertyBlob::new(card, &mode.to_blob())?;

    let mut saved = SavedDisplay::capture(
        card,
        res.primary.id,
        Some((res.crtc.id, res.connector.id)),
    )?;

    let crtc = ObjectRef::crtc(res.crtc.id);
    let mut txn = AtomicTransaction::new(card);
    txn.add(crtc, "ACTIVE", 1)?;
    txn.add(crtc, "MODE_ID", u64::from(blob.id()))?;
    txn.add(ObjectRef::connector(res.connector.id), "CRTC_ID", u64::from(res.crtc.id))?;
    add_plane_properties(&mut txn, res.primary.id, res.crtc.id, &fb, config)?;
    txn.commit(ATOMIC_ALLOW_MODESET | ATOMIC_NONBLOCK)?;
    saved.arm();
    Ok(())
}

/// Scan out a fresh buffer on the plane of type `kind`. A missing plane or
/// a format the plane does not take is a skip.
pub fn test_plane_configuration(
    ctx: &DeviceContext,
    config: &TestConfig,
    kind: PlaneType,
) -> Result<()> {
    let card = ctx.card()?;
    let res = ctx.resources()?;
    let plane = res.plane(kind)?;
    if !plane.formats.contains(&config.format().code()) {
        return Err(Error::Unsupported(format!(
            "{} on {kind:?} plane {}",
            config.format(),
            plane.id
        )));
    }
    if ctx.capabilities()?.modifier_support(config.modifier()) == Support::Unsupported {
        return Err(Error::Unsupported(format!(
            "modifier {} on {kind:?} plane {}",
            config.modifier(),
            plane.id
        )));
    }

    let mut buffer = BufferObject::create(card, config)?;
    buffer.fill(SCANOUT_PATTERN)?;
    let fb = Framebuffer::add(card, &buffer)?;
    let mut saved = SavedDisplay::capture(card, plane.id, None)?;

    let mut txn = AtomicTransaction::new(card);
    add_plane_properties(&mut txn, plane.id, res.crtc.id, &fb, config)?;
    txn.commit(ATOMIC_NONBLOCK)?;
    saved.arm();
    Ok(())
}

/// Re-read the connector and compare it with `expected`.
pub fn test_connector_properties(ctx: &DeviceContext, expected: &ConnectorInfo) -> Result<()> {
    let card = ctx.card()?;
    let current = card
        .device()
        .connector(expected.id)
        .map_err(Error::device("GETCONNECTOR"))?;

    let mut mismatches = Vec::new();
    if current.connector_type != expected.connector_type {
        mismatches.push(format!(
            "type {} != {}",
            current.connector_type, expected.connector_type
        ));
    }
    if current.connection != expected.connection {
        mismatches.push(format!(
            "connection {:?} != {:?}",
            current.connection, expected.connection
        ));
    }
    if (current.mm_width, current.mm_height) != (expected.mm_width, expected.mm_height) {
        mismatches.push(format!(
            "size {}x{}mm != {}x{}mm",
            current.mm_width, current.mm_height, expected.mm_width, expected.mm_height
        ));
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(Error::VerificationFailed(format!(
            "connector {}: {}",
            expected.id,
            mismatches.join(", ")
        )))
    }
}

/// Compare the CRTC's active mode with `expected`.
pub fn test_mode_setting(ctx: &DeviceContext, expected: &DisplayTiming) -> Result<()> {
    let card = ctx.card()?;
    let crtc = ctx.resources()?.crtc.id;
    let mode = card
        .device()
        .crtc(crtc)
        .map_err(Error::device("GETCRTC"))?
        .mode
        .ok_or_else(|| Error::VerificationFailed(format!("CRTC {crtc} has no active mode")))?;
    let actual = DisplayTiming::from_mode(&mode);
    if actual == *expected {
        Ok(())
    } else {
        Err(Error::VerificationFailed(format!(
            "mode {actual:?}, expected {expected:?}"
        )))
    }
}

/// Request one VBLANK event and wait for it at most `timeout`.
pub fn test_vblank_handling(ctx: &DeviceContext, timeout: Duration) -> Result<()> {
    let card = ctx.card()?;
    let index = ctx.resources()?.crtc_index as u32;
    match card.device().wait_vblank(index, timeout) {
        Ok(sequence) => {
            debug!("{}: vblank sequence {sequence}", card.path());
            Ok(())
        }
        Err(Errno::ETIME) => Err(Error::Timeout {
            what: "VBLANK event",
            timeout,
        }),
        Err(source) => Err(Error::Device {
            op: "WAIT_VBLANK",
            source,
        }),
    }
}

/// Create a sync object, signal it and wait on it at most `timeout`.
pub fn test_sync_primitives(ctx: &DeviceContext, timeout: Duration) -> Result<()> {
    let card = ctx.card()?;
    let device = card.device();
    let sync = SyncObject {
        card,
        handle: device
            .syncobj_create(false)
            .map_err(Error::device("SYNCOBJ_CREATE"))?,
    };
    device
        .syncobj_signal(sync.handle)
        .map_err(Error::device("SYNCOBJ_SIGNAL"))?;
    match device.syncobj_wait(sync.handle, timeout) {
        Ok(()) => Ok(()),
        Err(Errno::ETIME) => Err(Error::Timeout {
            what: "syncobj signal",
            timeout,
        }),
        Err(source) => Err(Error::Device {
            op: "SYNCOBJ_WAIT",
            source,
        }),
    }
}

/// Load a linear gamma ramp, read it back and compare every entry, then
/// restore the previous ramp.
pub fn test_color_management(ctx: &DeviceContext) -> Result<()> {
    let card = ctx.card()?;
    let crtc = &ctx.resources()?.crtc;
    if crtc.gamma_size == 0 {
        return Err(Error::Unsupported(format!("gamma on CRTC {}", crtc.id)));
    }
    let device = card.device();
    let saved = device
        .gamma(crtc.id, crtc.gamma_size)
        .map_err(Error::device("GETGAMMA"))?;
    let ramp = GammaRamp::linear(crtc.gamma_size as usize);
    device
        .set_gamma(crtc.id, &ramp)
        .map_err(Error::device("SETGAMMA"))?;
    let readback = device.gamma(crtc.id, crtc.gamma_size);
    if let Err(e) = device.set_gamma(crtc.id, &saved) {
        warn!("{}: restoring gamma of CRTC {}: {e}", card.path(), crtc.id);
    }

    let readback = readback.map_err(Error::device("GETGAMMA"))?;
    if readback == ramp {
        Ok(())
    } else {
        let first = (0..ramp.len())
            .find(|&i| {
                readback.red.get(i) != Some(&ramp.red[i])
                    || readback.green.get(i) != Some(&ramp.green[i])
                    || readback.blue.get(i) != Some(&ramp.blue[i])
            })
            .unwrap_or(ramp.len());
        Err(Error::VerificationFailed(format!(
            "gamma entry {first} of {} differs after readback",
            ramp.len()
        )))
    }
}
