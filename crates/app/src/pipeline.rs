//! The pipeline driver: one sequential control loop per cycle, supervised
//! for restarts.
//!
//! Within a cycle everything runs in order (capture, scheduling, detection,
//! correlation, encoding, broadcast), so exactly one frame is alive at a
//! time and a slow stage shows up as reduced throughput instead of memory
//! growth. Every blocking step is individually bounded (capture read, open,
//! detector deadline), so the loop always comes back around to notice
//! shutdown and restart requests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Once,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use detect_core::{Detector, Tracker};
use tracing::{error, info, warn};
use video_ingest::{Acquired, ConnectionState, ResilientCapture};

use crate::{
    broadcast::ViewerRegistry,
    config::SharedConfig,
    data::{BroadcastPayload, DetectionRecord, FrameMessage},
    encoding,
    orchestrator::{CycleDetections, Orchestrator},
    safety::SafetyMonitor,
    scheduler,
    watchdog::{spawn_watchdog, DriverHealth, RestartState},
    zones::ZoneRegistry,
};

/// Pause between acquire attempts while the source is unavailable; the
/// capture cooldown does the real rate limiting, this only keeps the loop
/// from spinning hot.
const SOURCE_RETRY_TICK: Duration = Duration::from_millis(250);

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

pub type DetectorFactory = Box<dyn Fn() -> Result<Box<dyn Detector>> + Send>;
pub type TrackerFactory = Box<dyn Fn() -> Box<dyn Tracker> + Send>;

/// Shared state the pipeline exposes to the HTTP surface.
pub struct PipelineStatus {
    capture_state: AtomicU8,
    last_sequence: AtomicU64,
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self {
            capture_state: AtomicU8::new(0),
            last_sequence: AtomicU64::new(0),
        }
    }

    fn set_capture_state(&self, state: ConnectionState) {
        let value = match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        };
        self.capture_state.store(value, Ordering::Relaxed);
    }

    pub fn capture_label(&self) -> &'static str {
        match self.capture_state.load(Ordering::Relaxed) {
            2 => ConnectionState::Connected.label(),
            1 => ConnectionState::Connecting.label(),
            _ => ConnectionState::Disconnected.label(),
        }
    }

    fn set_last_sequence(&self, sequence: u64) {
        self.last_sequence.store(sequence, Ordering::Relaxed);
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Relaxed)
    }
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the driver shares with the rest of the process.
pub struct PipelineHandles {
    pub config: SharedConfig,
    pub zones: Arc<ZoneRegistry>,
    pub viewers: Arc<ViewerRegistry>,
    pub status: Arc<PipelineStatus>,
    pub restart: Arc<RestartState>,
    pub health: Arc<DriverHealth>,
    pub shutdown: Arc<AtomicBool>,
}

enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Run the pipeline until shutdown, recycling it on watchdog triggers,
/// operator restarts, and recoverable faults.
pub fn run(
    handles: &PipelineHandles,
    mut capture: ResilientCapture,
    detector_factory: DetectorFactory,
    tracker_factory: TrackerFactory,
) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let handler_shutdown = handles.shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler({
            let handler_shutdown = handler_shutdown.clone();
            move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let watchdog = spawn_watchdog(
        handles.health.clone(),
        handles.restart.clone(),
        handles.shutdown.clone(),
    );

    let mut cycle: u64 = 0;
    let mut attempt: u32 = 0;

    loop {
        if handles.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match run_once(
            handles,
            &mut capture,
            &mut cycle,
            &detector_factory,
            &tracker_factory,
        ) {
            Ok(PipelineOutcome::Graceful) => break,
            Ok(PipelineOutcome::Restart(reason)) => {
                attempt = attempt.saturating_add(1);
                warn!("Pipeline restarting (reason: {reason}), attempt #{attempt}");
                metrics::counter!("sitewatch_pipeline_restarts_total").increment(1);
                thread::sleep(RESTART_BACKOFF);
            }
            Err(err) => {
                error!("Pipeline error: {err:?}");
                if handles.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                attempt = attempt.saturating_add(1);
                thread::sleep(RESTART_BACKOFF);
            }
        }
    }

    capture.release();
    handles.status.set_capture_state(capture.state());
    let _ = watchdog.join();
    info!("Pipeline stopped");
    Ok(())
}

fn run_once(
    handles: &PipelineHandles,
    capture: &mut ResilientCapture,
    cycle: &mut u64,
    detector_factory: &DetectorFactory,
    tracker_factory: &TrackerFactory,
) -> Result<PipelineOutcome> {
    let initial = handles.config.snapshot();
    let detector = detector_factory().context("failed to initialise detector")?;
    let orchestrator = Orchestrator::spawn(
        detector,
        tracker_factory(),
        initial.tracking_enabled,
        initial.detector_timeout,
    );
    let mut tracking_enabled = initial.tracking_enabled;
    // Side-state follows the tracker's lifetime: a fresh tracker numbers
    // identities from scratch, and inherited sides would turn those new
    // identities into phantom crossings.
    let mut safety = SafetyMonitor::new();
    info!("Pipeline cycle loop started");

    loop {
        if handles.shutdown.load(Ordering::Relaxed) {
            capture.release();
            return Ok(PipelineOutcome::Graceful);
        }
        if let Some(reason) = handles.restart.take() {
            capture.release();
            return Ok(PipelineOutcome::Restart(reason));
        }

        handles.health.beat();
        *cycle += 1;
        let cfg = handles.config.snapshot();

        if cfg.tracking_enabled != tracking_enabled {
            tracking_enabled = cfg.tracking_enabled;
            orchestrator.set_tracking(tracking_enabled);
            handles.zones.reset_counters();
            safety.reset();
            info!(
                "Tracking {}; tracker state and crossing counters reset",
                if tracking_enabled { "enabled" } else { "disabled" }
            );
        }

        let cycle_start = Instant::now();
        let frame = match capture.acquire() {
            Acquired::Frame(frame) => frame,
            Acquired::Unavailable => {
                handles.status.set_capture_state(capture.state());
                metrics::counter!("sitewatch_capture_unavailable_total").increment(1);
                thread::sleep(SOURCE_RETRY_TICK);
                continue;
            }
        };
        handles.status.set_capture_state(capture.state());
        handles.status.set_last_sequence(frame.sequence);

        let viewer_count = handles.viewers.count();
        metrics::gauge!("sitewatch_viewers").set(viewer_count as f64);
        if viewer_count == 0 {
            // Nobody is watching: skip detection and broadcast entirely and
            // settle into the slower idle cadence.
            if let Some(delay) = scheduler::remaining_budget(cycle_start, cfg.idle_cycle()) {
                thread::sleep(delay);
            }
            continue;
        }

        let frame = scheduler::downscale_to_width(frame, cfg.max_width);
        let run_detection = scheduler::should_run_detection(frame.sequence, cfg.every_nth_frame);

        let outcome = if run_detection {
            let detect_start = Instant::now();
            let outcome = orchestrator.process(&frame, cfg.confidence_threshold);
            metrics::histogram!("sitewatch_stage_seconds", "stage" => "detect")
                .record(detect_start.elapsed().as_secs_f64());
            outcome
        } else {
            CycleDetections::empty(frame.sequence)
        };

        let events = if run_detection && tracking_enabled {
            safety.evaluate(
                *cycle,
                frame.timestamp_ms,
                &outcome.tracked,
                &outcome.ppe,
                &handles.zones,
            )
        } else {
            Vec::new()
        };

        let records = build_records(outcome, cfg.max_detections);
        let zone_state = handles.zones.snapshot();

        match encoding::annotate_and_encode(&frame, &records, &zone_state, cfg.jpeg_quality) {
            Ok(jpeg) => {
                let encoded = BASE64.encode(&jpeg);
                let message = FrameMessage {
                    kind: "video_frame",
                    sequence: frame.sequence,
                    timestamp_ms: frame.timestamp_ms,
                    frame: &encoded,
                    detections: &records,
                    zone_state: &zone_state,
                    events: &events,
                };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        let broadcast_start = Instant::now();
                        let delivered = handles.viewers.broadcast(Arc::new(BroadcastPayload {
                            sequence: frame.sequence,
                            json,
                        }));
                        metrics::histogram!("sitewatch_stage_seconds", "stage" => "broadcast")
                            .record(broadcast_start.elapsed().as_secs_f64());
                        metrics::counter!("sitewatch_messages_sent_total")
                            .increment(delivered as u64);
                    }
                    Err(err) => error!("Failed to serialize frame message: {err}"),
                }
            }
            Err(err) => {
                error!("Frame annotation failed: {err:#}");
                metrics::counter!("sitewatch_encode_failures_total").increment(1);
            }
        }

        metrics::histogram!("sitewatch_cycle_seconds").record(cycle_start.elapsed().as_secs_f64());
        if let Some(delay) = scheduler::remaining_budget(cycle_start, cfg.target_cycle()) {
            thread::sleep(delay);
        }
    }
}

/// Flatten one cycle's detections into wire records, best first, capped at
/// `max_detections`.
fn build_records(outcome: CycleDetections, max_detections: usize) -> Vec<DetectionRecord> {
    let CycleDetections {
        tracked,
        people,
        ppe,
        ..
    } = outcome;

    let mut records: Vec<DetectionRecord> = Vec::with_capacity(tracked.len() + people.len() + ppe.len());
    records.extend(tracked.into_iter().map(|person| DetectionRecord {
        class: person.detection.class,
        confidence: person.detection.confidence,
        bbox: person.detection.bbox,
        track_id: Some(person.track_id),
    }));
    records.extend(people.into_iter().chain(ppe).map(|detection| DetectionRecord {
        class: detection.class,
        confidence: detection.confidence,
        bbox: detection.bbox,
        track_id: None,
    }));

    records.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    records.truncate(max_detections);
    records
}

#[cfg(test)]
mod tests {
    use detect_core::{BoundingBox, Detection, TrackedPerson};

    use super::*;

    fn det(class: &str, confidence: f32) -> Detection {
        Detection {
            class: class.into(),
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    #[test]
    fn records_are_sorted_by_confidence_and_capped() {
        let outcome = CycleDetections {
            sequence: 1,
            tracked: vec![TrackedPerson::new(det("person", 0.6), 4)],
            people: Vec::new(),
            ppe: vec![det("helmet", 0.9), det("safety_vest", 0.2), det("helmet", 0.7)],
        };

        let records = build_records(outcome, 3);
        assert_eq!(records.len(), 3);
        assert!((records[0].confidence - 0.9).abs() < f32::EPSILON);
        assert!((records[1].confidence - 0.7).abs() < f32::EPSILON);
        assert_eq!(records[2].track_id, Some(4));
    }
}
