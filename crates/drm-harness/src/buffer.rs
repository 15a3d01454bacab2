// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Buffer objects, their mappings and exported descriptors.
//!
//! Every kernel resource is owned by a guard that releases it on drop:
//! [`Mapping`] unmaps, [`Descriptor`] closes its file descriptor and
//! [`BufferObject`] unmaps before it gives its kernel handle back to the
//! [`Card`]. Each acquisition and release is counted in the card's
//! [`ResourceLedger`] so tests can assert that nothing was leaked.

use crate::config::TestConfig;
use crate::discovery::Card;
use crate::error::{Error, Result};
use crate::format::{Compression, Modifier, PixelFormat};
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{c_void, off_t};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::cell::Cell;
use std::fmt;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

/// A shared read/write memory mapping, unmapped on drop.
pub struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    /// Map `len` bytes of `fd` starting at `offset`.
    pub fn new(fd: BorrowedFd<'_>, offset: off_t, len: usize) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: a fresh shared mapping chosen by the kernel; it aliases no
        // Rust object and is only reachable through this guard.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )?
        };
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` readable bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len) }
    }

    /// The mapping as 32-bit words. Trailing bytes past the last whole word
    /// are not included.
    pub fn words(&self) -> &[u32] {
        // SAFETY: mappings are page aligned, so u32 alignment holds.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast(), self.len / 4) }
    }

    pub fn words_mut(&mut self) -> &mut [u32] {
        // SAFETY: page aligned and exclusively borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len / 4) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a live mapping created in `new`.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap of {} bytes failed: {e}", self.len);
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Outstanding resources on one card at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outstanding {
    pub handles: usize,
    pub mappings: usize,
    pub descriptors: usize,
}

impl Outstanding {
    pub fn is_clean(&self) -> bool {
        *self == Outstanding::default()
    }
}

impl fmt::Display for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} handles, {} mappings, {} descriptors",
            self.handles, self.mappings, self.descriptors
        )
    }
}

/// Per-card counters of live buffer handles, mappings and descriptors.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    handles: Cell<usize>,
    mappings: Cell<usize>,
    descriptors: Cell<usize>,
}

fn bump(cell: &Cell<usize>, up: bool) {
    let v = cell.get();
    cell.set(if up { v + 1 } else { v.saturating_sub(1) });
}

impl ResourceLedger {
    pub fn outstanding(&self) -> Outstanding {
        Outstanding {
            handles: self.handles.get(),
            mappings: self.mappings.get(),
            descriptors: self.descriptors.get(),
        }
    }

    pub(crate) fn handle(&self, acquired: bool) {
        bump(&self.handles, acquired);
    }

    pub(crate) fn mapping(&self, acquired: bool) {
        bump(&self.mappings, acquired);
    }

    pub(crate) fn descriptor(&self, acquired: bool) {
        bump(&self.descriptors, acquired);
    }
}

/// An exported DMA-BUF descriptor. Closed exactly once, on [`close`] or drop.
///
/// [`close`]: Descriptor::close
pub struct Descriptor<'c> {
    fd: OwnedFd,
    ledger: &'c ResourceLedger,
}

impl<'c> Descriptor<'c> {
    fn new(fd: OwnedFd, ledger: &'c ResourceLedger) -> Self {
        ledger.descriptor(true);
        Self { fd, ledger }
    }

    /// Take ownership of a DMA-BUF obtained elsewhere (a DMA heap, another
    /// process) and count it against `card`.
    pub fn from_fd(card: &'c Card, fd: OwnedFd) -> Self {
        Self::new(fd, card.ledger())
    }

    pub fn close(self) {}
}

impl AsFd for Descriptor<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Descriptor<'_> {
    fn drop(&mut self) {
        debug!("closing descriptor {}", self.fd.as_raw_fd());
        self.ledger.descriptor(false);
    }
}

impl fmt::Debug for Descriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&self.fd).finish()
    }
}

/// A kernel buffer on one card with its process-local mapping.
///
/// Created by [`create`](Self::create) or one of the `import_*`
/// constructors; released by [`destroy`](Self::destroy) or on drop. Two
/// objects importing the same memory are independent: each owns its own
/// mapping and its own reference to the handle.
pub struct BufferObject<'c> {
    card: &'c Card,
    handle: u32,
    released: bool,
    mapping: Option<Mapping>,
    size: usize,
    pitch: u32,
    width: u32,
    height: u32,
    format: PixelFormat,
    modifier: Modifier,
    compression: Compression,
}

impl<'c> BufferObject<'c> {
    /// Take ownership of one reference to `handle`. The guard exists before
    /// the mapping so a mapping failure still releases the handle.
    fn adopt(card: &'c Card, handle: u32, size: usize, pitch: u32, config: &TestConfig) -> Self {
        card.retain_handle(handle);
        Self {
            card,
            handle,
            released: false,
            mapping: None,
            size,
            pitch,
            width: config.width(),
            height: config.height(),
            format: config.format(),
            modifier: config.modifier(),
            compression: config.compression(),
        }
    }

    fn map(&mut self) -> Result<()> {
        let mapping = self
            .card
            .device()
            .map(self.handle, self.size)
            .map_err(|source| Error::MappingFailed {
                handle: self.handle,
                size: self.size,
                source,
            })?;
        self.card.ledger().mapping(true);
        self.mapping = Some(mapping);
        Ok(())
    }

    /// Allocate and map a dumb buffer described by `config`.
    pub fn create(card: &'c Card, config: &TestConfig) -> Result<Self> {
        if config.width() == 0 || config.height() == 0 {
            return Err(Error::InvalidArgument(format!(
                "zero-sized buffer {}",
                config.id()
            )));
        }
        let format = config.format();
        let dumb = card
            .device()
            .create_dumb(config.width(), format.alloc_height(config.height()), format.bpp())
            .map_err(|source| Error::AllocationFailed {
                width: config.width(),
                height: config.height(),
                format: format.to_string(),
                source,
            })?;
        let mut bo = Self::adopt(card, dumb.handle, 0, dumb.pitch, config);
        bo.size = usize::try_from(dumb.size).map_err(|_| Error::AllocationFailed {
            width: config.width(),
            height: config.height(),
            format: format.to_string(),
            source: Errno::EOVERFLOW,
        })?;
        bo.map()?;
        debug!(
            "{}: created {} handle {} size {}",
            card.path(),
            config.id(),
            bo.handle,
            bo.size
        );
        Ok(bo)
    }

    /// Import a descriptor, possibly exported by another card. The caller
    /// still owns `descriptor` and closes it afterwards.
    pub fn import_descriptor(
        card: &'c Card,
        descriptor: &Descriptor<'_>,
        config: &TestConfig,
    ) -> Result<Self> {
        let handle = card
            .device()
            .import_fd(descriptor.as_fd())
            .map_err(|source| Error::ImportFailed { source })?;
        let mut bo = Self::adopt(card, handle, 0, 0, config);
        bo.finish_import()?;
        Ok(bo)
    }

    /// Open another reference to a handle already known to `card`.
    pub fn import_handle(card: &'c Card, handle: u32, config: &TestConfig) -> Result<Self> {
        if !card.knows_handle(handle) {
            return Err(Error::ImportFailed {
                source: Errno::ENOENT,
            });
        }
        let mut bo = Self::adopt(card, handle, 0, 0, config);
        bo.finish_import()?;
        Ok(bo)
    }

    fn finish_import(&mut self) -> Result<()> {
        let size = self
            .card
            .device()
            .handle_size(self.handle)
            .map_err(|source| Error::ImportFailed { source })?;
        self.size = usize::try_from(size).map_err(|_| Error::ImportFailed {
            source: Errno::EOVERFLOW,
        })?;
        let rows = self.format.alloc_height(self.height).max(1) as usize;
        self.pitch = u32::try_from(self.size / rows).unwrap_or(u32::MAX);
        self.map()?;
        debug!(
            "{}: imported handle {} size {}",
            self.card.path(),
            self.handle,
            self.size
        );
        Ok(())
    }

    /// Export the buffer as a DMA-BUF descriptor.
    pub fn export(&self) -> Result<Descriptor<'c>> {
        if self.released {
            return Err(Error::InvalidArgument(format!(
                "export of destroyed handle {}",
                self.handle
            )));
        }
        let fd = self
            .card
            .device()
            .export_fd(self.handle)
            .map_err(|source| Error::ExportFailed {
                handle: self.handle,
                source,
            })?;
        Ok(Descriptor::new(fd, self.card.ledger()))
    }

    /// Write `pattern` to every 32-bit word of the mapping.
    pub fn fill(&mut self, pattern: u32) -> Result<()> {
        let mapping = self.mapping.as_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("handle {} is not mapped", self.handle))
        })?;
        mapping.words_mut().fill(pattern);
        Ok(())
    }

    /// True when every 32-bit word of the mapping equals `pattern`.
    pub fn verify(&self, pattern: u32) -> bool {
        match &self.mapping {
            Some(mapping) => mapping.words().iter().all(|&w| w == pattern),
            None => false,
        }
    }

    /// Unmap, then release the handle. Calling it again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.released {
            debug!("handle {} already destroyed", self.handle);
            return Ok(());
        }
        if self.mapping.take().is_some() {
            self.card.ledger().mapping(false);
        }
        self.released = true;
        self.card
            .release_handle(self.handle)
            .map_err(Error::device("GEM_CLOSE"))
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
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

    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.released
    }
}

impl Drop for BufferObject<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("releasing handle {}: {e}", self.handle);
        }
    }
}

impl fmt::Debug for BufferObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("modifier", &self.modifier)
            .field("mapped", &self.mapping.is_some())
            .field("released", &self.released)
            .finish()
    }
}
