//! visiond - real-time object detection daemon
//!
//! This daemon:
//! 1. Loads the object-detection model (fatal when missing) and the optional
//!    face-detection model (logged and disabled when missing)
//! 2. Opens the configured capture source (camera, video file, still image,
//!    or a stub:// synthetic stream)
//! 3. Streams frames through the active detection engine on a dedicated
//!    acquisition worker
//! 4. Forwards validated detections to sinks and aggregates session stats
//! 5. Stops cleanly on SIGINT

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use vision_kernel::{
    FrameSink, ModelConfig, ModelRegistry, ModelVariant, ProcessedFrame, SessionStats,
    SourceConfig, StreamController, StreamState, VisiondConfig,
};

#[derive(Parser, Debug)]
#[command(name = "visiond", about = "Real-time object detection daemon")]
struct Args {
    /// JSON config file (overrides VISIOND_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture source location; overrides the config file.
    /// Accepts a video file, a still image, /dev/videoN, or stub://name[?frames=N].
    #[arg(long)]
    source: Option<String>,

    /// Directory holding model artifacts and label files; `stub://` runs
    /// the daemon against the scripted backend without model files.
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Confidence threshold override, in [0, 1].
    #[arg(long)]
    confidence: Option<f32>,

    /// Start with the face-detection model active instead of object detection.
    #[arg(long)]
    face: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => VisiondConfig::load_from(path)?,
        None => VisiondConfig::load()?,
    };
    if let Some(source) = args.source {
        cfg.source.location = source;
    }
    if let Some(assets_dir) = args.assets_dir {
        cfg.models.assets_dir = assets_dir;
    }
    if let Some(confidence) = args.confidence {
        cfg.models.confidence_threshold = confidence;
    }

    // Primary model is fatal at load; the face model is optional.
    let mut registry = ModelRegistry::new();
    let mut object_config = ModelConfig::object_detection(&cfg.models.assets_dir);
    object_config.confidence_threshold = cfg.models.confidence_threshold;
    object_config.use_accelerator = cfg.models.use_accelerator;
    registry
        .load_model(object_config)
        .context("load object-detection model")?;

    let mut face_config = ModelConfig::face_detection(&cfg.models.assets_dir);
    face_config.confidence_threshold = cfg.models.confidence_threshold;
    face_config.use_accelerator = cfg.models.use_accelerator;
    match registry.load_model(face_config) {
        Ok(()) => log::info!("face-detection model loaded"),
        Err(e) => log::warn!("face-detection model unavailable: {:#}", e),
    }
    if args.face {
        registry.switch_model(ModelVariant::FaceDetection)?;
    }
    let registry = Arc::new(Mutex::new(registry));

    let stats = Arc::new(Mutex::new(SessionStats::new()));
    let sinks: Vec<Box<dyn FrameSink>> = vec![
        Box::new(DetectionLogSink::default()),
        Box::new(StatsSink {
            stats: stats.clone(),
        }),
    ];
    let controller = StreamController::new(registry, sinks);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            log::info!("SIGINT received, shutting down");
            running.store(false, Ordering::SeqCst);
        })
        .context("install SIGINT handler")?;
    }

    controller.start(SourceConfig {
        location: cfg.source.location.clone(),
        target_fps: cfg.source.target_fps,
        width: cfg.source.width,
        height: cfg.source.height,
    })?;
    log::info!("visiond running on {}", cfg.source.location);

    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        // End of stream tears the session down to Idle on its own.
        if controller.state() == StreamState::Idle {
            break;
        }
        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let position = controller.position();
            let stream_stats = controller.stats();
            log::info!(
                "position frame={}/{} state={:?} delivered={}",
                position.frame_index,
                position.total_frames,
                position.state,
                stream_stats.frames_delivered
            );
            last_health_log = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    controller.stop()?;

    let stats = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    log::info!(
        "session summary: {} frames, {} detections, {:.1} ms mean detection time",
        stats.frames_processed(),
        stats.total_detections(),
        stats.mean_elapsed_ms()
    );
    for (class_name, count) in stats.top_classes(10) {
        log::info!("  {}: {}", class_name, count);
    }
    Ok(())
}

/// Logs a per-frame summary of what was detected.
#[derive(Default)]
struct DetectionLogSink {
    last_summary: Mutex<HashMap<String, usize>>,
}

impl FrameSink for DetectionLogSink {
    fn on_frame(&self, processed: &ProcessedFrame<'_>) {
        if processed.detections.is_empty() {
            return;
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        for detection in processed.detections {
            *counts.entry(detection.class_name.clone()).or_insert(0) += 1;
        }
        let mut guard = self
            .last_summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only log when the scene composition changes, to keep the log
        // readable on busy streams.
        if *guard != counts {
            let mut parts: Vec<String> = counts
                .iter()
                .map(|(class_name, count)| format!("{}x{}", class_name, count))
                .collect();
            parts.sort();
            log::info!(
                "frame {}: {} ({:.0} ms)",
                processed.frame_index,
                parts.join(", "),
                processed.elapsed_ms
            );
            *guard = counts;
        }
    }
}

/// Aggregates session statistics from delivered frames.
struct StatsSink {
    stats: Arc<Mutex<SessionStats>>,
}

impl FrameSink for StatsSink {
    fn on_frame(&self, processed: &ProcessedFrame<'_>) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.record_frame(processed.detections, processed.elapsed_ms);
    }
}
