// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Export/import latency measurement.

use crate::buffer::BufferObject;
use crate::config::TestConfig;
use crate::discovery::DeviceContext;
use crate::error::{Error, Result};
use log::debug;
use std::fmt;
use std::time::{Duration, Instant};

/// Timing of the export+import segment over a number of iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub iterations: u32,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl LatencyStats {
    pub fn mean(&self) -> Duration {
        self.total / self.iterations.max(1)
    }

    pub fn mean_nanos(&self) -> u128 {
        self.mean().as_nanos()
    }

    fn record(&mut self, sample: Duration) {
        self.iterations += 1;
        self.total += sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} iterations, mean {:?} (min {:?}, max {:?})",
            self.iterations,
            self.mean(),
            self.min,
            self.max
        )
    }
}

/// Allocate a buffer per iteration and time only its export and re-import.
///
/// The first failing iteration aborts the measurement with its error.
pub fn measure_buffer_sharing_latency(
    ctx: &DeviceContext,
    config: &TestConfig,
    iterations: u32,
) -> Result<LatencyStats> {
    if iterations == 0 {
        return Err(Error::InvalidArgument("zero iterations".into()));
    }
    let card = ctx.card()?;
    let mut stats = LatencyStats {
        iterations: 0,
        total: Duration::ZERO,
        min: Duration::MAX,
        max: Duration::ZERO,
    };

    for i in 0..iterations {
        let original = BufferObject::create(card, config)?;

        let start = Instant::now();
        let descriptor = original.export()?;
        let imported = BufferObject::import_descriptor(card, &descriptor, config);
        let elapsed = start.elapsed();

        descriptor.close();
        drop(imported?);
        drop(original);
        stats.record(elapsed);
        if i == 0 {
            debug!("first export+import took {elapsed:?}");
        }
    }
    debug!("{}: {stats}", config.id());
    Ok(stats)
}
