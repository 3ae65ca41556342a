use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::Result;
use detect_core::{Detector, IouTracker, NullDetector, Tracker};
use tracing::{info, warn};
use video_ingest::{synthetic::SyntheticSource, ResilientCapture, SourceOpener, VideoSource};

use sitewatch::{
    broadcast::ViewerRegistry,
    config::{PipelineConfig, SharedConfig},
    pipeline::{self, DetectorFactory, PipelineHandles, PipelineStatus, TrackerFactory},
    server::{spawn_api_server, AppState},
    telemetry,
    watchdog::{DriverHealth, RestartState},
    zones::ZoneRegistry,
};

/// Frame interval of the built-in synthetic source.
const SYNTHETIC_FRAME_INTERVAL: Duration = Duration::from_millis(33);

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    telemetry::init_tracing();
    telemetry::init_metrics_recorder();

    let args: Vec<String> = std::env::args().collect();
    let config = PipelineConfig::from_args(&args)?;

    let opener = build_opener(&config)?;
    let detector_factory = build_detector_factory(&config);
    let tracker_factory: TrackerFactory =
        Box::new(|| Box::new(IouTracker::default()) as Box<dyn Tracker>);

    let port = config.port;
    let capture_options = config.capture;
    let zones = Arc::new(ZoneRegistry::new(config.reset_counters_on_reconfigure));
    let shared_config = SharedConfig::new(config);
    let viewers = Arc::new(ViewerRegistry::new());
    let status = Arc::new(PipelineStatus::new());
    let restart = Arc::new(RestartState::new());
    let health = Arc::new(DriverHealth::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let server = spawn_api_server(
        AppState {
            config: shared_config.clone(),
            zones: zones.clone(),
            viewers: viewers.clone(),
            status: status.clone(),
            restart: restart.clone(),
        },
        port,
    )?;
    info!("API listening on http://0.0.0.0:{port} (push channel at /events)");

    let handles = PipelineHandles {
        config: shared_config,
        zones,
        viewers,
        status,
        restart,
        health,
        shutdown,
    };
    let capture = ResilientCapture::new(opener, capture_options);
    pipeline::run(&handles, capture, detector_factory, tracker_factory)?;

    server.stop();
    Ok(())
}

fn build_opener(config: &PipelineConfig) -> Result<SourceOpener> {
    if config.source == "synthetic" {
        let (width, height) = (config.capture_width, config.capture_height);
        return Ok(Box::new(move || {
            Ok(
                Box::new(SyntheticSource::new(width, height, SYNTHETIC_FRAME_INTERVAL))
                    as Box<dyn VideoSource>,
            )
        }));
    }

    #[cfg(feature = "backend-opencv")]
    {
        let uri = config.source.clone();
        Ok(Box::new(move || {
            video_ingest::cv::CvSource::open(&uri)
                .map(|source| Box::new(source) as Box<dyn VideoSource>)
        }))
    }

    #[cfg(not(feature = "backend-opencv"))]
    anyhow::bail!(
        "source {:?} requires the backend-opencv feature; this build supports --source synthetic only",
        config.source
    )
}

fn build_detector_factory(config: &PipelineConfig) -> DetectorFactory {
    #[cfg(feature = "backend-tch")]
    {
        if let Some(model_path) = config.model_path.clone() {
            return Box::new(move || {
                let detector = detect_core::torch::TorchDetector::new(
                    &model_path,
                    detect_core::torch::Device::cuda_if_available(),
                    (640, 640),
                    vec![
                        "person".to_string(),
                        "helmet".to_string(),
                        "safety_vest".to_string(),
                    ],
                )?;
                Ok(Box::new(detector) as Box<dyn Detector>)
            });
        }
        warn!("No --model given; streaming without detections");
    }

    #[cfg(not(feature = "backend-tch"))]
    if config.model_path.is_some() {
        warn!("--model given but this build lacks backend-tch; streaming without detections");
    } else {
        warn!("No detector backend configured; streaming without detections");
    }

    Box::new(|| Ok(Box::new(NullDetector) as Box<dyn Detector>))
}
