// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Device and display-resource discovery.
//!
//! [`DeviceContext::initialize`] opens a card, picks the first connected
//! connector and the CRTC driving it, classifies the planes usable on that
//! CRTC and snapshots the [`CapabilitySet`]. Everything else borrows the
//! context and cannot outlive it.

use crate::buffer::{Outstanding, ResourceLedger};
use crate::config::TestConfig;
use crate::device::{
    Backend, Connection, ConnectorInfo, CrtcInfo, Device, PlaneInfo, PlaneType,
};
use crate::error::{Error, Result};
use crate::format::{Compression, Modifier, PixelFormat};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// One opened display device plus the bookkeeping shared by every buffer
/// created on it.
pub struct Card {
    device: Box<dyn Device>,
    ledger: ResourceLedger,
    /// References held by live buffer objects, per kernel handle. The kernel
    /// hands out one handle per memory object, so a re-import shares it.
    handles: RefCell<HashMap<u32, usize>>,
}

impl Card {
    pub fn open(backend: &dyn Backend, index: u32) -> Result<Self> {
        Ok(Self::new(backend.open(index)?))
    }

    pub fn new(device: Box<dyn Device>) -> Self {
        Self {
            device,
            ledger: ResourceLedger::default(),
            handles: RefCell::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &str {
        self.device.path()
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn outstanding(&self) -> Outstanding {
        self.ledger.outstanding()
    }

    pub(crate) fn retain_handle(&self, handle: u32) {
        *self.handles.borrow_mut().entry(handle).or_insert(0) += 1;
        self.ledger.handle(true);
    }

    pub(crate) fn knows_handle(&self, handle: u32) -> bool {
        self.handles.borrow().contains_key(&handle)
    }

    /// Drop one reference; the kernel handle is closed with the last one.
    pub(crate) fn release_handle(&self, handle: u32) -> nix::Result<()> {
        self.ledger.handle(false);
        let last = {
            let mut handles = self.handles.borrow_mut();
            match handles.get_mut(&handle) {
                Some(refs) if *refs > 1 => {
                    *refs -= 1;
                    false
                }
                _ => {
                    handles.remove(&handle);
                    true
                }
            }
        };
        if last {
            debug!("{}: closing handle {handle}", self.path());
            self.device.close_handle(handle)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("path", &self.path())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// The connector, CRTC and planes of the active display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayResources {
    pub connector: ConnectorInfo,
    pub crtc: CrtcInfo,
    /// Position of `crtc` in the card's CRTC list, as used by plane masks and
    /// VBLANK requests.
    pub crtc_index: usize,
    pub primary: PlaneInfo,
    pub overlay: Option<PlaneInfo>,
    pub cursor: Option<PlaneInfo>,
    /// Every plane usable with `crtc`.
    pub planes: Vec<PlaneInfo>,
    pub max_width: u32,
    pub max_height: u32,
}

impl DisplayResources {
    pub fn discover(card: &Card) -> Result<Self> {
        let device = card.device();
        let unavailable = |reason: String| Error::DeviceUnavailable {
            path: card.path().to_string(),
            reason,
        };
        let res = device
            .resources()
            .map_err(|e| unavailable(format!("no mode-setting resources: {e}")))?;

        let connector = res
            .connectors
            .iter()
            .filter_map(|&id| match device.connector(id) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("{}: connector {id}: {e}", card.path());
                    None
                }
            })
            .find(|c| c.connection == Connection::Connected)
            .ok_or_else(|| unavailable("no connected connector".into()))?;

        let (crtc_index, crtc_id) = res
            .crtcs
            .iter()
            .copied()
            .enumerate()
            .find(|&(_, id)| Some(id) == connector.crtc_id)
            .ok_or_else(|| {
                Error::ResourceNotFound(format!("CRTC bound to connector {}", connector.id))
            })?;
        let crtc = device.crtc(crtc_id).map_err(Error::device("GETCRTC"))?;

        let mut planes = Vec::new();
        for id in device.plane_ids().map_err(Error::device("GETPLANERESOURCES"))? {
            let plane = device.plane(id).map_err(Error::device("GETPLANE"))?;
            if plane.supports_crtc_index(crtc_index) {
                planes.push(plane);
            }
        }
        let first = |kind: PlaneType| planes.iter().find(|p| p.plane_type == kind).cloned();
        let primary = first(PlaneType::Primary)
            .ok_or_else(|| Error::ResourceNotFound("primary plane".into()))?;
        let overlay = first(PlaneType::Overlay);
        let cursor = first(PlaneType::Cursor);

        info!(
            "{}: connector {} on CRTC {} ({} planes, overlay: {}, cursor: {})",
            card.path(),
            connector.id,
            crtc.id,
            planes.len(),
            overlay.is_some(),
            cursor.is_some()
        );

        Ok(Self {
            connector,
            crtc,
            crtc_index,
            primary,
            overlay,
            cursor,
            planes,
            max_width: res.max_width,
            max_height: res.max_height,
        })
    }

    /// The plane of the given type, or `ResourceNotFound` when the display
    /// has none.
    pub fn plane(&self, kind: PlaneType) -> Result<&PlaneInfo> {
        let plane = match kind {
            PlaneType::Primary => Some(&self.primary),
            PlaneType::Overlay => self.overlay.as_ref(),
            PlaneType::Cursor => self.cursor.as_ref(),
        };
        plane.ok_or_else(|| Error::ResourceNotFound(format!("{kind:?} plane")))
    }
}

/// Where a capability list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Queried from the device.
    Reported,
    /// Taken from a reference table because the device has no query.
    Assumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Supported,
    Unsupported,
    /// Only an assumed table speaks to it; the hardware was not asked.
    Unknown,
}

impl Support {
    fn and(self, other: Support) -> Support {
        match (self, other) {
            (Support::Unsupported, _) | (_, Support::Unsupported) => Support::Unsupported,
            (Support::Unknown, _) | (_, Support::Unknown) => Support::Unknown,
            _ => Support::Supported,
        }
    }
}

/// Pixel formats, modifiers and compression codes the active display takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    formats: Vec<PixelFormat>,
    modifiers: Vec<Modifier>,
    modifier_source: Source,
    compression: Vec<Compression>,
}

impl CapabilitySet {
    pub fn query(card: &Card, resources: &DisplayResources) -> Self {
        let mut formats = Vec::new();
        for code in resources.planes.iter().flat_map(|p| p.formats.iter()) {
            match PixelFormat::from_code(*code) {
                Some(f) if !formats.contains(&f) => formats.push(f),
                Some(_) => {}
                None => debug!("ignoring plane format {code:#010x}"),
            }
        }

        let mut reported: Option<Vec<Modifier>> = None;
        for plane in &resources.planes {
            match card.device().plane_modifiers(plane.id) {
                Ok(Some(mods)) => {
                    let list = reported.get_or_insert_with(Vec::new);
                    for m in mods.into_iter().map(Modifier) {
                        if !list.contains(&m) {
                            list.push(m);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("{}: IN_FORMATS of plane {}: {e}", card.path(), plane.id),
            }
        }
        let (modifiers, modifier_source) = match reported {
            Some(mods) => (mods, Source::Reported),
            None => {
                warn!(
                    "{}: no modifier report, assuming the reference table",
                    card.path()
                );
                (Modifier::REFERENCE_TABLE.to_vec(), Source::Assumed)
            }
        };

        Self {
            formats,
            modifiers,
            modifier_source,
            compression: Compression::REFERENCE_TABLE.to_vec(),
        }
    }

    pub fn formats(&self) -> &[PixelFormat] {
        &self.formats
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    pub fn modifier_source(&self) -> Source {
        self.modifier_source
    }

    pub fn compression(&self) -> &[Compression] {
        &self.compression
    }

    /// Compression is never queryable through KMS.
    pub fn compression_source(&self) -> Source {
        Source::Assumed
    }

    pub fn format_support(&self, format: PixelFormat) -> Support {
        if self.formats.contains(&format) {
            Support::Supported
        } else {
            Support::Unsupported
        }
    }

    pub fn modifier_support(&self, modifier: Modifier) -> Support {
        match self.modifier_source {
            Source::Reported if self.modifiers.contains(&modifier) => Support::Supported,
            Source::Reported => Support::Unsupported,
            Source::Assumed => Support::Unknown,
        }
    }

    pub fn compression_support(&self, compression: Compression) -> Support {
        if compression == Compression::None {
            Support::Supported
        } else {
            Support::Unknown
        }
    }

    /// Combined answer for everything a test configuration asks for.
    pub fn supports(&self, config: &TestConfig) -> Support {
        self.format_support(config.format())
            .and(self.modifier_support(config.modifier()))
            .and(self.compression_support(config.compression()))
    }
}

/// The opened primary card and its discovered display.
pub struct DeviceContext {
    capabilities: Option<CapabilitySet>,
    resources: Option<DisplayResources>,
    card: Option<Card>,
}

impl DeviceContext {
    /// Open card `index` of `backend` and discover its active display.
    pub fn initialize(backend: &dyn Backend, index: u32) -> Result<Self> {
        let card = Card::open(backend, index)?;
        let resources = DisplayResources::discover(&card)?;
        let capabilities = Self::query(&card, &resources);
        Ok(Self {
            capabilities: Some(capabilities),
            resources: Some(resources),
            card: Some(card),
        })
    }

    fn query(card: &Card, resources: &DisplayResources) -> CapabilitySet {
        let capabilities = CapabilitySet::query(card, resources);
        debug!(
            "{}: {} formats, {} modifiers ({:?})",
            card.path(),
            capabilities.formats().len(),
            capabilities.modifiers().len(),
            capabilities.modifier_source()
        );
        capabilities
    }

    pub fn card(&self) -> Result<&Card> {
        self.card
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable {
                path: "<torn down>".into(),
                reason: "device context was torn down".into(),
            })
    }

    pub fn resources(&self) -> Result<&DisplayResources> {
        self.resources
            .as_ref()
            .ok_or_else(|| Error::ResourceNotFound("display resources".into()))
    }

    pub fn capabilities(&self) -> Result<&CapabilitySet> {
        self.capabilities
            .as_ref()
            .ok_or_else(|| Error::ResourceNotFound("capability set".into()))
    }

    /// Re-discover the display and replace the snapshots if the connector
    /// changed. Returns whether anything changed. On error the previous
    /// snapshots stay in place.
    pub fn refresh_capabilities(&mut self) -> Result<bool> {
        let card = self.card()?;
        let fresh = DisplayResources::discover(card)?;
        let changed = match &self.resources {
            Some(old) => old.connector != fresh.connector,
            None => true,
        };
        if changed {
            info!("connector {} changed, re-querying capabilities", fresh.connector.id);
            let capabilities = Self::query(card, &fresh);
            self.capabilities = Some(capabilities);
            self.resources = Some(fresh);
        }
        Ok(changed)
    }

    /// Release capabilities, display resources and finally the device, in
    /// that order. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.capabilities.take().is_some() {
            debug!("released capability set");
        }
        if self.resources.take().is_some() {
            debug!("released display resources");
        }
        if let Some(card) = self.card.take() {
            let outstanding = card.outstanding();
            if !outstanding.is_clean() {
                warn!("{}: closing with {outstanding} outstanding", card.path());
            }
            debug!("closing {}", card.path());
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{VirtualBus, VirtualTopology};

    fn bus(topology: VirtualTopology) -> VirtualBus {
        VirtualBus::with_cards(1, topology)
    }

    #[test]
    fn discovers_full_pipeline() {
        let ctx = DeviceContext::initialize(&bus(VirtualTopology::default()), 0).unwrap();
        let res = ctx.resources().unwrap();
        assert_eq!(res.crtc_index, 0);
        assert!(res.overlay.is_some());
        assert!(res.cursor.is_some());
        assert_eq!(res.plane(PlaneType::Primary).unwrap().id, res.primary.id);
    }

    #[test]
    fn disconnected_display_is_unavailable() {
        let topology = VirtualTopology {
            connected: false,
            ..Default::default()
        };
        assert!(matches!(
            DeviceContext::initialize(&bus(topology), 0),
            Err(Error::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn unbound_connector_has_no_crtc() {
        let topology = VirtualTopology {
            crtc_bound: false,
            ..Default::default()
        };
        assert!(matches!(
            DeviceContext::initialize(&bus(topology), 0),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn missing_overlay_is_a_skip() {
        let topology = VirtualTopology {
            planes: vec![PlaneType::Primary, PlaneType::Cursor],
            ..Default::default()
        };
        let ctx = DeviceContext::initialize(&bus(topology), 0).unwrap();
        let err = ctx.resources().unwrap().plane(PlaneType::Overlay).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn modifier_support_depends_on_report() {
        let ctx = DeviceContext::initialize(&bus(VirtualTopology::default()), 0).unwrap();
        let caps = ctx.capabilities().unwrap();
        assert_eq!(caps.modifier_source(), Source::Reported);
        assert_eq!(caps.modifier_support(Modifier::X_TILED), Support::Supported);
        assert_eq!(caps.modifier_support(Modifier::Y_TILED), Support::Unsupported);
        assert_eq!(caps.format_support(PixelFormat::Nv12), Support::Supported);
        assert_eq!(caps.format_support(PixelFormat::Yuv444), Support::Unsupported);

        let topology = VirtualTopology {
            in_formats: None,
            ..Default::default()
        };
        let ctx = DeviceContext::initialize(&bus(topology), 0).unwrap();
        let caps = ctx.capabilities().unwrap();
        assert_eq!(caps.modifier_source(), Source::Assumed);
        assert_eq!(caps.modifiers(), &Modifier::REFERENCE_TABLE);
        assert_eq!(caps.modifier_support(Modifier::LINEAR), Support::Unknown);
        assert_eq!(
            caps.supports(&TestConfig::default().with_compression(Compression::Etc2)),
            Support::Unknown
        );
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut ctx = DeviceContext::initialize(&bus(VirtualTopology::default()), 0).unwrap();
        ctx.teardown();
        ctx.teardown();
        assert!(ctx.card().is_err());
        assert!(ctx.resources().is_err());
    }

    #[test]
    fn failed_refresh_keeps_snapshots() {
        let bus = bus(VirtualTopology::default());
        let mut ctx = DeviceContext::initialize(&bus, 0).unwrap();
        let device = bus.device(0).unwrap();
        let before = ctx.resources().unwrap().connector.clone();

        device.set_connected(false);
        assert!(matches!(
            ctx.refresh_capabilities(),
            Err(Error::DeviceUnavailable { .. })
        ));
        assert_eq!(ctx.resources().unwrap().connector, before);
        assert!(ctx.capabilities().is_ok());

        device.set_connected(true);
        assert!(!ctx.refresh_capabilities().unwrap());
    }

    #[test]
    fn refresh_picks_up_new_panel() {
        let bus = bus(VirtualTopology::default());
        let mut ctx = DeviceContext::initialize(&bus, 0).unwrap();
        bus.device(0).unwrap().set_physical_size(600, 340);
        assert!(ctx.refresh_capabilities().unwrap());
        assert_eq!(ctx.resources().unwrap().connector.mm_width, 600);
        assert!(ctx.capabilities().is_ok());
    }

    #[test]
    fn refresh_without_change() {
        let mut ctx = DeviceContext::initialize(&bus(VirtualTopology::default()), 0).unwrap();
        assert!(!ctx.refresh_capabilities().unwrap());
        assert!(ctx.capabilities().is_ok());
    }
}
