#![cfg(feature = "ingest-file-ffmpeg")]

//! FFmpeg-backed video file source.
//!
//! Decodes a local video file to RGB frames in-memory and supports
//! repositioning to an arbitrary frame index for seek. Stream metadata
//! (frame count, frame rate) feeds the controller's playback position.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::source::SourceConfig;
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    total_frames: u64,
    frames_per_second: f64,
    frames_read: u64,
}

impl FfmpegFileSource {
    pub(crate) fn open(config: SourceConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.location).with_context(|| {
            format!("failed to open video file '{}' with ffmpeg", config.location)
        })?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();

        let total_frames = input_stream.frames().max(0) as u64;
        let rate = input_stream.avg_frame_rate();
        let frames_per_second = if rate.denominator() != 0 {
            f64::from(rate.numerator()) / f64::from(rate.denominator())
        } else {
            0.0
        };
        // Unknown or bogus rates fall back to 30, as a player would assume.
        let frames_per_second = if frames_per_second > 0.0 {
            frames_per_second
        } else {
            30.0
        };

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "CaptureSource: opened {} ({} frames, {:.2} fps)",
            config.location,
            total_frames,
            frames_per_second
        );

        Ok(Self {
            path: config.location,
            input,
            stream_index,
            decoder,
            scaler,
            total_frames,
            frames_per_second,
            frames_read: 0,
        })
    }

    pub(crate) fn read(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }

            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                self.frames_read += 1;
                return Ok(Some(Frame::from_rgb8(pixels, width, height)?));
            }
        }

        // Packets exhausted: clean end of stream.
        Ok(None)
    }

    /// Reposition so the next `read` decodes the frame at `frame_index`.
    pub(crate) fn reposition(&mut self, frame_index: u64) -> Result<()> {
        let seconds = frame_index as f64 / self.frames_per_second;
        let ts = (seconds * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        self.input
            .seek(ts, ..ts)
            .with_context(|| format!("seek {} to frame {}", self.path, frame_index))?;
        self.decoder.flush();
        Ok(())
    }

    pub(crate) fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub(crate) fn frames_per_second(&self) -> f64 {
        self.frames_per_second
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0) as usize;
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
