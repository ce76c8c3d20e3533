#![cfg(feature = "ingest-v4l2")]

//! V4L2 camera source.
//!
//! Captures frames from a local device node (e.g. /dev/video0) as RGB.
//! Cameras are live: they have no frame count and cannot be repositioned.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::source::SourceConfig;
use crate::frame::Frame;

pub(crate) struct CameraSource {
    config: SourceConfig,
    state: CameraState,
    active_width: u32,
    active_height: u32,
    frames_read: u64,
}

#[self_referencing]
struct CameraState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl CameraSource {
    pub(crate) fn open(config: SourceConfig) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.location)
            .with_context(|| format!("open v4l2 device {}", config.location))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "CaptureSource: failed to set format on {}: {}",
                    config.location,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "CaptureSource: failed to set fps on {}: {}",
                    config.location,
                    err
                );
            }
        }

        let active_width = format.width;
        let active_height = format.height;

        let state = CameraStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "CaptureSource: opened {} ({}x{})",
            config.location,
            active_width,
            active_height
        );

        Ok(Self {
            config,
            state,
            active_width,
            active_height,
            frames_read: 0,
        })
    }

    pub(crate) fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (width, height) = (self.active_width, self.active_height);
        let pixels = self
            .state
            .with_stream_mut(|stream| -> Result<Vec<u8>> {
                let (buf, _meta) = stream
                    .next()
                    .map_err(|err| anyhow!("capture v4l2 frame: {}", err))?;
                Ok(buf.to_vec())
            })?;

        self.frames_read += 1;
        Ok(Some(Frame::from_rgb8(pixels, width, height)?))
    }

    pub(crate) fn frames_per_second(&self) -> f64 {
        self.config.target_fps as f64
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.frames_read
    }
}
