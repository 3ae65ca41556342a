//! Hot-swappable zone configuration.
//!
//! The registry is the single mutation point for the active crossing line
//! and containment polygon. Readers take a snapshot (a clone under the lock)
//! so concurrent reconfiguration can never expose mixed old/new geometry.
//! Every successful reconfiguration bumps the version; correlation state
//! keyed to the old geometry is invalidated by comparing versions.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_LINE_START: (f32, f32) = (0.0, 250.0);
pub const DEFAULT_LINE_END: (f32, f32) = (800.0, 250.0);
pub const DEFAULT_POLYGON: [(f32, f32); 4] = [
    (200.0, 150.0),
    (600.0, 150.0),
    (600.0, 450.0),
    (200.0, 450.0),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ZoneConfigError {
    #[error("crossing line endpoints must be distinct")]
    DegenerateLine,
    #[error("crossing line coordinates must be finite")]
    NonFiniteLine,
    #[error("containment polygon needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),
    #[error("containment polygon coordinates must be finite")]
    NonFinitePolygon,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Clone, Debug, Serialize)]
pub struct CrossingLine {
    pub start: (f32, f32),
    pub end: (f32, f32),
    pub in_count: u64,
    pub out_count: u64,
}

/// Atomic view of the full zone configuration.
#[derive(Clone, Debug, Serialize)]
pub struct ZoneState {
    pub line: CrossingLine,
    pub polygon: Vec<(f32, f32)>,
    pub visible: bool,
    pub version: u64,
}

pub struct ZoneRegistry {
    inner: Mutex<ZoneState>,
    reset_counters_on_reconfigure: bool,
}

impl ZoneRegistry {
    pub fn new(reset_counters_on_reconfigure: bool) -> Self {
        Self {
            inner: Mutex::new(ZoneState {
                line: CrossingLine {
                    start: DEFAULT_LINE_START,
                    end: DEFAULT_LINE_END,
                    in_count: 0,
                    out_count: 0,
                },
                polygon: DEFAULT_POLYGON.to_vec(),
                visible: true,
                version: 0,
            }),
            reset_counters_on_reconfigure,
        }
    }

    pub fn snapshot(&self) -> ZoneState {
        self.lock().clone()
    }

    /// Replace the crossing line. Counters reset unless the registry was
    /// configured to carry them across reconfigurations.
    pub fn reconfigure_line(
        &self,
        start: (f32, f32),
        end: (f32, f32),
    ) -> Result<(), ZoneConfigError> {
        if ![start.0, start.1, end.0, end.1]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(ZoneConfigError::NonFiniteLine);
        }
        if start == end {
            return Err(ZoneConfigError::DegenerateLine);
        }

        let mut state = self.lock();
        let (in_count, out_count) = if self.reset_counters_on_reconfigure {
            (0, 0)
        } else {
            (state.line.in_count, state.line.out_count)
        };
        state.line = CrossingLine {
            start,
            end,
            in_count,
            out_count,
        };
        state.version += 1;
        info!(
            "Crossing line reconfigured: ({}, {}) -> ({}, {})",
            start.0, start.1, end.0, end.1
        );
        Ok(())
    }

    /// Replace the containment polygon.
    pub fn reconfigure_polygon(&self, vertices: Vec<(f32, f32)>) -> Result<(), ZoneConfigError> {
        if vertices.len() < 3 {
            return Err(ZoneConfigError::TooFewVertices(vertices.len()));
        }
        if !vertices
            .iter()
            .all(|(x, y)| x.is_finite() && y.is_finite())
        {
            return Err(ZoneConfigError::NonFinitePolygon);
        }

        let mut state = self.lock();
        info!("Containment polygon reconfigured: {} vertices", vertices.len());
        state.polygon = vertices;
        state.version += 1;
        Ok(())
    }

    pub fn set_visible(&self, visible: bool) {
        self.lock().visible = visible;
    }

    /// Bump one crossing counter and return both counts after the update.
    /// Counters only ever move forward between reconfigurations.
    pub fn record_crossing(&self, direction: Direction) -> (u64, u64) {
        let mut state = self.lock();
        match direction {
            Direction::In => state.line.in_count += 1,
            Direction::Out => state.line.out_count += 1,
        }
        (state.line.in_count, state.line.out_count)
    }

    /// Zero both counters in place without touching geometry.
    pub fn reset_counters(&self) {
        let mut state = self.lock();
        state.line.in_count = 0;
        state.line.out_count = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ZoneState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
