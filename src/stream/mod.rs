#[cfg(feature = "ingest-v4l2")]
pub(crate) mod camera_v4l2;
mod controller;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod source;

pub use controller::{StreamController, StreamPosition, StreamState, StreamStats};
pub use source::{CaptureSource, SourceConfig};
