//! Detection/tracking orchestration.
//!
//! The injected detector and tracker capabilities live on a long-lived
//! worker thread; the tracker keeps its association state there across
//! cycles. The driver submits one job per detection cycle and waits with a
//! hard deadline, so a hung model can cost at most one timeout rather than
//! stalling the loop. Responses that arrive after their deadline are drained
//! and discarded on the next call.
//!
//! Failure policy: any detector or tracker error is logged, counted, and
//! collapses to an empty result for that cycle. Nothing in here can take the
//! pipeline down.

use std::{
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use detect_core::{Detection, Detector, ImageView, TrackedPerson, Tracker};
use tracing::{debug, error, warn};
use video_ingest::Frame;

use crate::config::ALLOWED_CLASSES;

/// Everything detection produced for one cycle, already filtered and split.
pub struct CycleDetections {
    pub sequence: u64,
    /// People with identities; populated only while tracking is enabled.
    pub tracked: Vec<TrackedPerson>,
    /// People without identities; populated only while tracking is disabled.
    pub people: Vec<Detection>,
    /// Non-person detections (PPE and the like).
    pub ppe: Vec<Detection>,
}

impl CycleDetections {
    pub(crate) fn empty(sequence: u64) -> Self {
        Self {
            sequence,
            tracked: Vec::new(),
            people: Vec::new(),
            ppe: Vec::new(),
        }
    }
}

struct ProcessJob {
    sequence: u64,
    data: Vec<u8>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

enum WorkerRequest {
    Process(ProcessJob),
    SetTracking(bool),
}

pub struct Orchestrator {
    jobs: Sender<WorkerRequest>,
    results: Receiver<CycleDetections>,
    timeout: Duration,
}

impl Orchestrator {
    /// Move the capabilities onto their worker thread.
    pub fn spawn(
        detector: Box<dyn Detector>,
        tracker: Box<dyn Tracker>,
        tracking_enabled: bool,
        timeout: Duration,
    ) -> Self {
        let (job_tx, job_rx) = bounded::<WorkerRequest>(2);
        let (result_tx, result_rx) = bounded::<CycleDetections>(2);

        thread::Builder::new()
            .name("sitewatch-detect".into())
            .spawn(move || worker_loop(detector, tracker, tracking_enabled, job_rx, result_tx))
            .expect("failed to spawn detection worker");

        Self {
            jobs: job_tx,
            results: result_rx,
            timeout,
        }
    }

    /// Run detection for one frame, returning within the configured timeout.
    pub fn process(&self, frame: &Frame, confidence_threshold: f32) -> CycleDetections {
        // Late results from previous cycles are worthless; drop them first.
        while let Ok(stale) = self.results.try_recv() {
            debug!("Dropping stale detection result for frame #{}", stale.sequence);
        }

        let job = ProcessJob {
            sequence: frame.sequence,
            data: frame.data.clone(),
            width: frame.width,
            height: frame.height,
            confidence_threshold,
        };
        match self.jobs.try_send(WorkerRequest::Process(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Detection worker still busy; treating frame #{} as empty",
                    frame.sequence
                );
                metrics::counter!("sitewatch_detector_timeouts_total").increment(1);
                return CycleDetections::empty(frame.sequence);
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Detection worker terminated unexpectedly");
                return CycleDetections::empty(frame.sequence);
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results.recv_timeout(remaining) {
                Ok(result) if result.sequence == frame.sequence => return result,
                Ok(stale) => {
                    debug!("Dropping stale detection result for frame #{}", stale.sequence);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Detection for frame #{} missed its {}ms deadline",
                        frame.sequence,
                        self.timeout.as_millis()
                    );
                    metrics::counter!("sitewatch_detector_timeouts_total").increment(1);
                    return CycleDetections::empty(frame.sequence);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Detection worker terminated unexpectedly");
                    return CycleDetections::empty(frame.sequence);
                }
            }
        }
    }

    /// Flip tracking on or off. Either way the tracker is reset so stale
    /// identities are never reused.
    pub fn set_tracking(&self, enabled: bool) {
        if self
            .jobs
            .try_send(WorkerRequest::SetTracking(enabled))
            .is_err()
        {
            warn!("Detection worker busy; tracking toggle not delivered");
        }
    }
}

fn worker_loop(
    mut detector: Box<dyn Detector>,
    mut tracker: Box<dyn Tracker>,
    mut tracking_enabled: bool,
    jobs: Receiver<WorkerRequest>,
    results: Sender<CycleDetections>,
) {
    for request in jobs {
        match request {
            WorkerRequest::SetTracking(enabled) => {
                tracker.reset();
                tracking_enabled = enabled;
                debug!("Tracking {}", if enabled { "enabled" } else { "disabled" });
            }
            WorkerRequest::Process(job) => {
                let result = run_cycle(&mut *detector, &mut *tracker, tracking_enabled, &job);
                if results.send(result).is_err() {
                    break;
                }
            }
        }
    }
}

fn run_cycle(
    detector: &mut dyn Detector,
    tracker: &mut dyn Tracker,
    tracking_enabled: bool,
    job: &ProcessJob,
) -> CycleDetections {
    let image = ImageView {
        data: &job.data,
        width: job.width,
        height: job.height,
    };

    let detections = match detector.detect(image) {
        Ok(detections) => detections,
        Err(err) => {
            warn!("Detector failed on frame #{}: {err:#}", job.sequence);
            metrics::counter!("sitewatch_detector_failures_total").increment(1);
            return CycleDetections::empty(job.sequence);
        }
    };

    let mut people = Vec::new();
    let mut ppe = Vec::new();
    for detection in detections {
        if detection.confidence < job.confidence_threshold {
            continue;
        }
        if !ALLOWED_CLASSES.contains(&detection.class.as_str()) {
            continue;
        }
        let detection = Detection {
            bbox: detection.bbox.clamp_to(job.width, job.height),
            ..detection
        };
        if detection.class == "person" {
            people.push(detection);
        } else {
            ppe.push(detection);
        }
    }

    if !tracking_enabled {
        return CycleDetections {
            sequence: job.sequence,
            tracked: Vec::new(),
            people,
            ppe,
        };
    }

    match tracker.update(people) {
        Ok(tracked) => CycleDetections {
            sequence: job.sequence,
            tracked,
            people: Vec::new(),
            ppe,
        },
        Err(err) => {
            warn!("Tracker failed on frame #{}: {err:#}", job.sequence);
            metrics::counter!("sitewatch_tracker_failures_total").increment(1);
            CycleDetections::empty(job.sequence)
        }
    }
}
