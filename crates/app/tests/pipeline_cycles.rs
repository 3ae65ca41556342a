//! End-to-end pipeline cycles against the synthetic source and scripted
//! detector capabilities: messages reach registered viewers, zero viewers
//! short-circuit the cycle, detector failures never take the loop down, and
//! zone events land in exactly the cycle that produced them.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use detect_core::{BoundingBox, Detection, Detector, ImageView, IouTracker, Tracker};
use serde_json::Value;
use tokio::sync::mpsc;
use video_ingest::{
    synthetic::SyntheticSource, CaptureOptions, ResilientCapture, SourceOpener, VideoSource,
};

use sitewatch::{
    broadcast::ViewerRegistry,
    config::{PipelineConfig, SharedConfig},
    data::BroadcastPayload,
    pipeline::{self, DetectorFactory, PipelineHandles, PipelineStatus, TrackerFactory},
    watchdog::{DriverHealth, RestartState},
    zones::ZoneRegistry,
};

type Script = Arc<dyn Fn(usize) -> anyhow::Result<Vec<Detection>> + Send + Sync>;

struct ScriptedDetector {
    calls: Arc<AtomicUsize>,
    script: Script,
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, _image: ImageView<'_>) -> anyhow::Result<Vec<Detection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(call)
    }
}

fn scripted_factory(calls: Arc<AtomicUsize>, script: Script) -> DetectorFactory {
    Box::new(move || {
        Ok(Box::new(ScriptedDetector {
            calls: calls.clone(),
            script: script.clone(),
        }) as Box<dyn Detector>)
    })
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.every_nth_frame = 1;
    config.target_fps = 50.0;
    config.idle_fps = 100.0;
    config.jpeg_quality = 50;
    config.detector_timeout = Duration::from_secs(1);
    config.capture = CaptureOptions {
        cooldown: Duration::from_millis(50),
        read_timeout: Duration::from_millis(500),
        open_timeout: Duration::from_millis(500),
    };
    config
}

fn build_handles(config: PipelineConfig) -> Arc<PipelineHandles> {
    Arc::new(PipelineHandles {
        config: SharedConfig::new(config),
        zones: Arc::new(ZoneRegistry::new(true)),
        viewers: Arc::new(ViewerRegistry::new()),
        status: Arc::new(PipelineStatus::new()),
        restart: Arc::new(RestartState::new()),
        health: Arc::new(DriverHealth::new()),
        shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    })
}

fn start_pipeline(
    handles: Arc<PipelineHandles>,
    detector_factory: DetectorFactory,
) -> thread::JoinHandle<()> {
    let options = handles.config.snapshot().capture;
    thread::spawn(move || {
        let opener: SourceOpener = Box::new(|| {
            Ok(Box::new(SyntheticSource::new(64, 48, Duration::from_millis(5)))
                as Box<dyn VideoSource>)
        });
        let capture = ResilientCapture::new(opener, options);
        let tracker_factory: TrackerFactory =
            Box::new(|| Box::new(IouTracker::new(0.1, 30)) as Box<dyn Tracker>);
        let _ = pipeline::run(&handles, capture, detector_factory, tracker_factory);
    })
}

fn stop_pipeline(handles: &PipelineHandles, driver: thread::JoinHandle<()>) {
    handles
        .shutdown
        .store(true, std::sync::atomic::Ordering::SeqCst);
    driver.join().expect("pipeline thread panicked");
}

/// Drain up to `want` messages from a viewer receiver, bailing out at the
/// deadline so a wedged pipeline fails the test instead of hanging it.
fn collect_messages(
    rx: &mut mpsc::Receiver<Arc<BroadcastPayload>>,
    want: usize,
    timeout: Duration,
) -> Vec<Value> {
    let deadline = Instant::now() + timeout;
    let mut messages = Vec::new();
    while messages.len() < want && Instant::now() < deadline {
        match rx.try_recv() {
            Ok(payload) => {
                messages.push(serde_json::from_str(&payload.json).expect("invalid message JSON"));
            }
            Err(mpsc::error::TryRecvError::Empty) => thread::sleep(Duration::from_millis(2)),
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }
    messages
}

fn person_with_helmet(y_top: f32) -> Vec<Detection> {
    vec![
        Detection {
            class: "person".into(),
            confidence: 0.9,
            bbox: BoundingBox::new(10.0, y_top, 50.0, y_top + 26.0),
        },
        Detection {
            class: "helmet".into(),
            confidence: 0.8,
            bbox: BoundingBox::new(15.0, y_top + 2.0, 35.0, y_top + 10.0),
        },
    ]
}

#[test]
fn cycles_deliver_well_formed_messages_to_registered_viewers() {
    let handles = build_handles(test_config());
    let (_viewer_id, mut rx) = handles.viewers.register();

    let calls = Arc::new(AtomicUsize::new(0));
    let script: Script = Arc::new(|_| Ok(person_with_helmet(20.0)));
    let driver = start_pipeline(handles.clone(), scripted_factory(calls, script));

    let messages = collect_messages(&mut rx, 5, Duration::from_secs(5));
    stop_pipeline(&handles, driver);

    assert!(messages.len() >= 5, "expected at least 5 messages");
    let mut last_sequence = None;
    for message in &messages {
        assert_eq!(message["type"], "video_frame");
        assert!(message["frame"].as_str().map_or(false, |s| !s.is_empty()));
        assert!(message["zone_state"]["line"]["start"].is_array());
        let sequence = message["sequence"].as_u64().expect("sequence");
        if let Some(previous) = last_sequence {
            assert!(sequence > previous, "sequences must increase");
        }
        last_sequence = Some(sequence);

        let detections = message["detections"].as_array().expect("detections");
        assert!(detections.len() >= 2);
        let person = detections
            .iter()
            .find(|d| d["class"] == "person")
            .expect("person record");
        assert!(person["track_id"].as_i64().is_some());
        assert_eq!(person["bbox"].as_array().map(Vec::len), Some(4));
    }
}

#[test]
fn zero_viewers_skip_detection_entirely() {
    let handles = build_handles(test_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let script: Script = Arc::new(|_| Ok(person_with_helmet(20.0)));
    let driver = start_pipeline(handles.clone(), scripted_factory(calls.clone(), script));

    // Plenty of cycles pass; none of them may touch the detector.
    thread::sleep(Duration::from_millis(400));
    stop_pipeline(&handles, driver);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn detector_failures_yield_empty_cycles_not_a_dead_pipeline() {
    let handles = build_handles(test_config());
    let (_viewer_id, mut rx) = handles.viewers.register();

    let calls = Arc::new(AtomicUsize::new(0));
    let script: Script = Arc::new(|_| Err(anyhow::anyhow!("model exploded")));
    let driver = start_pipeline(handles.clone(), scripted_factory(calls.clone(), script));

    let messages = collect_messages(&mut rx, 4, Duration::from_secs(5));
    stop_pipeline(&handles, driver);

    assert!(messages.len() >= 4);
    assert!(calls.load(Ordering::SeqCst) >= 3);
    for message in &messages {
        assert_eq!(message["type"], "video_frame");
        assert_eq!(message["detections"].as_array().map(Vec::len), Some(0));
        assert_eq!(message["events"].as_array().map(Vec::len), Some(0));
    }
}

#[test]
fn crossing_and_violation_events_reach_viewers_exactly_when_produced() {
    let handles = build_handles(test_config());
    // Zones sized for the 64x48 synthetic frame: a mid-frame line and a
    // polygon covering everything, so the scripted person is always inside.
    handles
        .zones
        .reconfigure_line((0.0, 24.0), (64.0, 24.0))
        .unwrap();
    handles
        .zones
        .reconfigure_polygon(vec![(0.0, 0.0), (64.0, 0.0), (64.0, 48.0), (0.0, 48.0)])
        .unwrap();

    let (_viewer_id, mut rx) = handles.viewers.register();

    // Below the line for the first three detection cycles, above afterwards;
    // the boxes overlap enough for the tracker to keep one identity.
    let calls = Arc::new(AtomicUsize::new(0));
    let script: Script = Arc::new(|call| {
        if call < 3 {
            Ok(person_with_helmet(20.0)) // centroid y = 33, left side
        } else {
            Ok(person_with_helmet(2.0)) // centroid y = 15, right side
        }
    });
    let driver = start_pipeline(handles.clone(), scripted_factory(calls, script));

    let messages = collect_messages(&mut rx, 8, Duration::from_secs(5));
    stop_pipeline(&handles, driver);
    assert!(messages.len() >= 8);

    let mut crossings = 0;
    let mut saw_vest_violation = false;
    for message in &messages {
        for event in message["events"].as_array().expect("events") {
            match event["kind"].as_str() {
                Some("line_crossing") => {
                    crossings += 1;
                    assert_eq!(event["direction"], "in");
                    assert_eq!(event["in_count"], 1);
                }
                Some("violation") => {
                    let missing = event["missing"].as_array().expect("missing");
                    assert_eq!(missing.len(), 1);
                    assert_eq!(missing[0], "vest");
                    saw_vest_violation = true;
                }
                other => panic!("unexpected event kind: {other:?}"),
            }
        }
    }
    assert_eq!(crossings, 1, "the side flip must emit exactly one crossing");
    assert!(saw_vest_violation, "helmet-only person must be missing a vest");

    // The counter sticks at one across the remaining cycles.
    assert_eq!(handles.zones.snapshot().line.in_count, 1);
}
