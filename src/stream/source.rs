//! Capture sources.
//!
//! `CaptureSource` is the owned capture resource behind the stream
//! controller: a camera, a video file, a still image, or a synthetic
//! `stub://` stream for tests. It exposes only open/read/reposition/release
//! (release is drop); the raw handle never escapes. The controller
//! serializes all access behind its capture lock.
//!
//! Location dispatch:
//! - `stub://name`: synthetic live stream (endless)
//! - `stub://name?frames=N`: synthetic file-backed clip of N frames
//! - `/dev/videoN`: V4L2 camera (feature: ingest-v4l2)
//! - `*.jpg` / `*.jpeg` / `*.png` / `*.bmp`: single still image
//! - anything else: video file via FFmpeg (feature: ingest-file-ffmpeg)

use std::path::Path;

use anyhow::Result;

use crate::frame::Frame;
use crate::VisionError;

#[cfg(feature = "ingest-v4l2")]
use super::camera_v4l2::CameraSource;
#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;

const STILL_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Configuration for a capture source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Source location (see module docs for the dispatch rules).
    pub location: String,
    /// Target frame rate for sources that pace themselves (synthetic live,
    /// camera). File playback pacing belongs to the controller.
    pub target_fps: u32,
    /// Preferred dimensions (synthetic frames, camera format negotiation).
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            location: "stub://camera".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// The capture resource: camera, video file, still image, or synthetic.
pub struct CaptureSource {
    backend: SourceBackend,
    location: String,
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("location", &self.location)
            .finish()
    }
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    Still(StillImageSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    File(FfmpegFileSource),
    #[cfg(feature = "ingest-v4l2")]
    Camera(CameraSource),
}

impl CaptureSource {
    /// Open the capture resource described by `config`.
    ///
    /// Fails with `SourceUnavailable` when the resource cannot be opened.
    pub fn open(config: SourceConfig) -> Result<Self> {
        let location = config.location.clone();
        let backend = Self::open_backend(config)
            .map_err(|e| VisionError::SourceUnavailable(format!("{}: {:#}", location, e)))?;
        Ok(Self { backend, location })
    }

    fn open_backend(config: SourceConfig) -> Result<SourceBackend> {
        if config.location.starts_with("stub://") {
            return Ok(SourceBackend::Synthetic(SyntheticSource::new(config)?));
        }
        if config.location.starts_with("/dev/video") {
            #[cfg(feature = "ingest-v4l2")]
            {
                return Ok(SourceBackend::Camera(CameraSource::open(config)?));
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!("camera capture requires the ingest-v4l2 feature");
            }
        }
        if is_still_image(&config.location) {
            return Ok(SourceBackend::Still(StillImageSource::open(&config.location)?));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(SourceBackend::File(FfmpegFileSource::open(config)?))
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            anyhow::bail!("video file playback requires the ingest-file-ffmpeg feature")
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` is a clean end of stream; errors mean the read itself
    /// failed. Live sources block until their next frame is due.
    pub fn read(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.read(),
            SourceBackend::Still(source) => source.read(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::File(source) => source.read(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Camera(source) => source.read(),
        }
    }

    /// Reposition so the next `read` yields the frame at `frame_index`.
    ///
    /// Only file-backed sources are seekable; fails with `InvalidState` on a
    /// live source and with `OutOfRange` beyond the end of the stream.
    pub fn reposition(&mut self, frame_index: u64) -> Result<()> {
        if self.is_live() {
            return Err(VisionError::InvalidState(
                "live sources cannot be repositioned".to_string(),
            )
            .into());
        }
        let total = self.total_frames();
        if total > 0 && frame_index > total {
            return Err(VisionError::OutOfRange(format!(
                "frame {} beyond end of stream ({} frames)",
                frame_index, total
            ))
            .into());
        }
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.reposition(frame_index),
            SourceBackend::Still(source) => source.reposition(frame_index),
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::File(source) => source.reposition(frame_index),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Camera(_) => Err(VisionError::InvalidState(
                "live sources cannot be repositioned".to_string(),
            )
            .into()),
        }
    }

    /// Total frame count, or 0 when unknown (live sources).
    pub fn total_frames(&self) -> u64 {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.total_frames,
            SourceBackend::Still(_) => 1,
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::File(source) => source.total_frames(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Camera(_) => 0,
        }
    }

    pub fn frames_per_second(&self) -> f64 {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.config.target_fps as f64,
            SourceBackend::Still(_) => 0.0,
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::File(source) => source.frames_per_second(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Camera(source) => source.frames_per_second(),
        }
    }

    /// True when the source has no underlying file to seek within.
    pub fn is_live(&self) -> bool {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.total_frames == 0,
            SourceBackend::Still(_) => false,
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::File(_) => false,
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Camera(_) => true,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Frames read since the source was opened.
    pub fn frames_read(&self) -> u64 {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.frames_read,
            SourceBackend::Still(source) => source.frames_read,
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::File(source) => source.frames_read(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Camera(source) => source.frames_read(),
        }
    }
}

fn is_still_image(location: &str) -> bool {
    Path::new(location)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            STILL_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticSource {
    config: SourceConfig,
    /// 0 means endless (live camera emulation).
    total_frames: u64,
    cursor: u64,
    frames_read: u64,
}

impl SyntheticSource {
    fn new(config: SourceConfig) -> Result<Self> {
        let total_frames = parse_stub_frames(&config.location)?;
        log::info!(
            "CaptureSource: opened {} (synthetic, {})",
            config.location,
            if total_frames == 0 {
                "live".to_string()
            } else {
                format!("{} frames", total_frames)
            }
        );
        Ok(Self {
            config,
            total_frames,
            cursor: 0,
            frames_read: 0,
        })
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.total_frames > 0 && self.cursor >= self.total_frames {
            return Ok(None);
        }
        if self.total_frames == 0 {
            // Live emulation: block until the next frame is due, as a real
            // camera read would.
            let interval_ms = if self.config.target_fps == 0 {
                100
            } else {
                (1000 / self.config.target_fps).max(1) as u64
            };
            std::thread::sleep(std::time::Duration::from_millis(interval_ms));
        }
        let frame = self.synthetic_frame(self.cursor)?;
        self.cursor += 1;
        self.frames_read += 1;
        Ok(Some(frame))
    }

    fn reposition(&mut self, frame_index: u64) -> Result<()> {
        self.cursor = frame_index;
        Ok(())
    }

    /// Deterministic pixels for frame `index`: repositioning replays the
    /// exact same frame.
    fn synthetic_frame(&self, index: u64) -> Result<Frame> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + index * 7) % 256) as u8;
        }
        Frame::from_rgb8(pixels, self.config.width, self.config.height)
    }
}

/// Parse an optional `frames=N` query from a `stub://` location.
fn parse_stub_frames(location: &str) -> Result<u64> {
    let Some((_, query)) = location.split_once('?') else {
        return Ok(0);
    };
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "frames" {
                return value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid frames value '{}'", value));
            }
        }
    }
    Ok(0)
}

// ----------------------------------------------------------------------------
// Still image source
// ----------------------------------------------------------------------------

struct StillImageSource {
    frame: Frame,
    delivered: bool,
    frames_read: u64,
}

impl StillImageSource {
    fn open(path: &str) -> Result<Self> {
        let decoded = image::open(path)
            .map_err(|e| anyhow::anyhow!("failed to decode image {}: {}", path, e))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        let frame = Frame::from_rgb8(decoded.into_raw(), width, height)?;
        log::info!("CaptureSource: opened {} (still image {}x{})", path, width, height);
        Ok(Self {
            frame,
            delivered: false,
            frames_read: 0,
        })
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.delivered {
            return Ok(None);
        }
        self.delivered = true;
        self.frames_read += 1;
        Ok(Some(self.frame.clone()))
    }

    fn reposition(&mut self, frame_index: u64) -> Result<()> {
        // A still image has exactly one frame at index 0.
        if frame_index > 0 {
            return Err(VisionError::OutOfRange(format!(
                "frame {} beyond a single still image",
                frame_index
            ))
            .into());
        }
        self.delivered = false;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
