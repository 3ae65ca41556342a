//! Pipeline configuration, presets, and CLI parsing.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use video_ingest::CaptureOptions;

/// Classes the pipeline cares about; everything else a detector reports is
/// discarded before tracking and correlation.
pub const ALLOWED_CLASSES: &[&str] = &["person", "helmet", "safety_vest"];

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub source: String,
    pub port: u16,
    pub model_path: Option<PathBuf>,
    pub capture_width: u32,
    pub capture_height: u32,

    // Tunables adjustable at runtime, individually or via presets.
    pub every_nth_frame: u64,
    pub max_width: u32,
    pub confidence_threshold: f32,
    pub jpeg_quality: u8,
    pub target_fps: f32,
    pub max_detections: usize,

    pub idle_fps: f32,
    pub tracking_enabled: bool,
    pub reset_counters_on_reconfigure: bool,
    pub capture: CaptureOptions,
    pub detector_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: "synthetic".to_string(),
            port: 8000,
            model_path: None,
            capture_width: 640,
            capture_height: 480,
            every_nth_frame: 3,
            max_width: 960,
            confidence_threshold: 0.25,
            jpeg_quality: 75,
            target_fps: 20.0,
            max_detections: 10,
            idle_fps: 2.0,
            tracking_enabled: true,
            reset_counters_on_reconfigure: true,
            capture: CaptureOptions::default(),
            detector_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Apply a named performance preset. Returns false for unknown names,
    /// leaving the configuration untouched.
    pub fn apply_preset(&mut self, name: &str) -> bool {
        let (nth, max_width, confidence, quality, fps) = match name {
            "high_performance" | "balanced" => (3, 960, 0.25, 75, 20.0),
            "high_quality" => (2, 1280, 0.20, 85, 25.0),
            _ => return false,
        };
        self.every_nth_frame = nth;
        self.max_width = max_width;
        self.confidence_threshold = confidence;
        self.jpeg_quality = quality;
        self.target_fps = fps;
        true
    }

    pub fn target_cycle(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.target_fps.max(0.1))
    }

    /// Pacing used while no viewer is registered.
    pub fn idle_cycle(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.idle_fps.max(0.1))
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = PipelineConfig::default();

        let mut idx = 1;
        while idx < args.len() {
            match args[idx].as_str() {
                "--source" => {
                    idx += 1;
                    config.source = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--source requires a value"))?
                        .clone();
                    idx += 1;
                }
                "--model" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--model requires a value"))?;
                    config.model_path = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--port" => {
                    idx += 1;
                    config.port = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--port requires a value"))?
                        .parse::<u16>()
                        .with_context(|| "--port must be a port number".to_string())?;
                    idx += 1;
                }
                "--preset" => {
                    idx += 1;
                    let name = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--preset requires a value"))?;
                    if !config.apply_preset(name) {
                        bail!(
                            "Unknown preset: {name} (expected high_performance, balanced, or high_quality)"
                        );
                    }
                    idx += 1;
                }
                "--width" => {
                    idx += 1;
                    config.capture_width = parse_positive(args.get(idx), "--width")?;
                    idx += 1;
                }
                "--height" => {
                    idx += 1;
                    config.capture_height = parse_positive(args.get(idx), "--height")?;
                    idx += 1;
                }
                "--max-width" => {
                    idx += 1;
                    config.max_width = parse_positive(args.get(idx), "--max-width")?;
                    idx += 1;
                }
                "--every-nth" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--every-nth requires a value"))?
                        .parse::<u64>()
                        .with_context(|| "--every-nth must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--every-nth must be at least 1");
                    }
                    config.every_nth_frame = value;
                    idx += 1;
                }
                "--confidence" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--confidence requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--confidence must be a number".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--confidence must be between 0 and 1");
                    }
                    config.confidence_threshold = value;
                    idx += 1;
                }
                "--jpeg-quality" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--jpeg-quality requires a value"))?
                        .parse::<u8>()
                        .with_context(|| {
                            "--jpeg-quality must be an integer between 1 and 100".to_string()
                        })?;
                    if !(1..=100).contains(&value) {
                        bail!("--jpeg-quality must be an integer between 1 and 100");
                    }
                    config.jpeg_quality = value;
                    idx += 1;
                }
                "--fps" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--fps requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--fps must be a number".to_string())?;
                    if value <= 0.0 {
                        bail!("--fps must be positive");
                    }
                    config.target_fps = value;
                    idx += 1;
                }
                "--max-detections" => {
                    idx += 1;
                    config.max_detections = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--max-detections requires a value"))?
                        .parse::<usize>()
                        .with_context(|| "--max-detections must be an integer".to_string())?;
                    idx += 1;
                }
                "--no-tracking" => {
                    config.tracking_enabled = false;
                    idx += 1;
                }
                "--keep-counters" => {
                    config.reset_counters_on_reconfigure = false;
                    idx += 1;
                }
                other => bail!("Unrecognised flag: {other}"),
            }
        }

        Ok(config)
    }
}

fn parse_positive(value: Option<&String>, flag: &str) -> Result<u32> {
    let value = value
        .ok_or_else(|| anyhow!("{flag} requires a value"))?
        .parse::<u32>()
        .with_context(|| format!("{flag} must be a positive integer"))?;
    if value == 0 {
        bail!("{flag} must be a positive integer");
    }
    Ok(value)
}

/// Copy-on-write shared configuration: writers swap in a fresh `Arc`, the
/// driver snapshots once per cycle and never sees a half-applied update.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<Mutex<Arc<PipelineConfig>>>,
}

impl SharedConfig {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<PipelineConfig> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<R>(&self, mutate: impl FnOnce(&mut PipelineConfig) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        let result = mutate(&mut next);
        *guard = Arc::new(next);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("sitewatch")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_match_the_high_performance_preset() {
        let mut config = PipelineConfig::default();
        let baseline = config.clone();
        assert!(config.apply_preset("high_performance"));
        assert_eq!(config.every_nth_frame, baseline.every_nth_frame);
        assert_eq!(config.max_width, baseline.max_width);
        assert_eq!(config.jpeg_quality, baseline.jpeg_quality);
    }

    #[test]
    fn high_quality_preset_trades_throughput_for_fidelity() {
        let mut config = PipelineConfig::default();
        assert!(config.apply_preset("high_quality"));
        assert_eq!(config.every_nth_frame, 2);
        assert_eq!(config.max_width, 1280);
        assert_eq!(config.jpeg_quality, 85);
        assert!((config.target_fps - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_preset_is_rejected_without_side_effects() {
        let mut config = PipelineConfig::default();
        let before = config.clone();
        assert!(!config.apply_preset("turbo"));
        assert_eq!(config.every_nth_frame, before.every_nth_frame);
    }

    #[test]
    fn parses_flags_and_validates_ranges() {
        let config = PipelineConfig::from_args(&args(&[
            "--source",
            "synthetic",
            "--port",
            "9000",
            "--every-nth",
            "5",
            "--confidence",
            "0.5",
            "--no-tracking",
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.every_nth_frame, 5);
        assert!(!config.tracking_enabled);

        assert!(PipelineConfig::from_args(&args(&["--every-nth", "0"])).is_err());
        assert!(PipelineConfig::from_args(&args(&["--confidence", "1.5"])).is_err());
        assert!(PipelineConfig::from_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn shared_config_updates_are_visible_to_later_snapshots() {
        let shared = SharedConfig::new(PipelineConfig::default());
        let before = shared.snapshot();
        shared.update(|config| config.jpeg_quality = 90);
        assert_eq!(before.jpeg_quality, 75);
        assert_eq!(shared.snapshot().jpeg_quality, 90);
    }
}
