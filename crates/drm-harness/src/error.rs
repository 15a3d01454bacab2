// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use std::time::Duration;
use thiserror::Error;

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by discovery, the buffer manager and the test engines.
#[derive(Error, Debug)]
pub enum Error {
    #[error("display device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    #[error("{0} not found")]
    ResourceNotFound(String),

    #[error("buffer allocation failed ({width}x{height} {format}): {source}")]
    AllocationFailed {
        width: u32,
        height: u32,
        format: String,
        source: Errno,
    },

    #[error("mapping {size} bytes of handle {handle} failed: {source}")]
    MappingFailed {
        handle: u32,
        size: usize,
        source: Errno,
    },

    #[error("exporting handle {handle} failed: {source}")]
    ExportFailed { handle: u32, source: Errno },

    #[error("import failed: {source}")]
    ImportFailed { source: Errno },

    #[error("atomic commit failed: {source}")]
    CommitFailed { source: Errno },

    #[error("object {object} has no property {name:?}")]
    PropertyNotFound { object: u32, name: String },

    #[error("{what} did not complete within {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op} failed: {source}")]
    Device { op: &'static str, source: Errno },
}

impl Error {
    /// Wrap an errno returned by a primitive device operation.
    pub fn device(op: &'static str) -> impl FnOnce(Errno) -> Error {
        move |source| Error::Device { op, source }
    }

    /// True when the failure means "nothing to test here" rather than a
    /// driver defect: an absent optional resource or an unsupported format.
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::ResourceNotFound(_) | Error::Unsupported(_))
    }
}
