// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Result and metric reporting.

use log::{info, warn};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Graphics,
    Audio,
    Video,
    Usb,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Subsystem::Graphics => "graphics",
            Subsystem::Audio => "audio",
            Subsystem::Video => "video",
            Subsystem::Usb => "usb",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Skip => "SKIP",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestRecord {
    pub name: String,
    pub subsystem: Subsystem,
    pub outcome: Outcome,
    pub duration: Duration,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Receives every test result and performance metric of a run.
pub trait Reporter {
    fn record_result(
        &mut self,
        name: &str,
        subsystem: Subsystem,
        outcome: Outcome,
        duration: Duration,
        message: &str,
    );

    fn record_metric(&mut self, name: &str, value: f64, unit: &str);
}

/// In-memory reporter keeping records in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Report {
    results: Vec<TestRecord>,
    metrics: Vec<Metric>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[TestRecord] {
        &self.results
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn result(&self, name: &str) -> Option<&TestRecord> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// True when no recorded test failed.
    pub fn passed(&self) -> bool {
        self.count(Outcome::Fail) == 0
    }
}

impl Reporter for Report {
    fn record_result(
        &mut self,
        name: &str,
        subsystem: Subsystem,
        outcome: Outcome,
        duration: Duration,
        message: &str,
    ) {
        match outcome {
            Outcome::Fail => warn!("[{subsystem}] {name}: {outcome} ({duration:?}) {message}"),
            _ => info!("[{subsystem}] {name}: {outcome} ({duration:?}) {message}"),
        }
        self.results.push(TestRecord {
            name: name.to_string(),
            subsystem,
            outcome,
            duration,
            message: message.to_string(),
        });
    }

    fn record_metric(&mut self, name: &str, value: f64, unit: &str) {
        info!("{name}: {value:.3} {unit}");
        self.metrics.push(Metric {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
        });
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            write!(
                f,
                "{:<4} {:<45} {:>9.2} ms",
                r.outcome,
                r.name,
                r.duration.as_secs_f64() * 1000.0
            )?;
            if !r.message.is_empty() {
                write!(f, "  {}", r.message)?;
            }
            writeln!(f)?;
        }
        for m in &self.metrics {
            writeln!(f, "     {:<45} {:>9.3} {}", m.name, m.value, m.unit)?;
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.count(Outcome::Pass),
            self.count(Outcome::Fail),
            self.count(Outcome::Skip)
        )
    }
}
