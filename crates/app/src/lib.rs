//! Site safety video analytics pipeline.
//!
//! Captures a video stream, periodically runs detection and identity
//! tracking, correlates tracked people against a crossing line and a
//! containment polygon, and fans annotated per-cycle messages out to every
//! subscribed viewer. The module split:
//! - `geometry` / `zones`: zone primitives and the hot-swappable registry.
//! - `scheduler`: every-Nth-frame detection, downscaling, pacing.
//! - `orchestrator`: the injected detector/tracker capabilities on their
//!   worker thread, with bounded deadlines.
//! - `safety`: crossing and PPE-violation correlation.
//! - `broadcast` / `server`: viewer registry, fan-out, and the HTTP/SSE
//!   surface.
//! - `pipeline`: the sequential driver loop and its supervisor.

pub mod broadcast;
pub mod config;
pub mod data;
pub mod encoding;
pub mod geometry;
pub mod orchestrator;
pub mod pipeline;
pub mod safety;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod watchdog;
pub mod zones;
