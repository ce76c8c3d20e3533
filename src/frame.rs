//! Owned frame buffer.
//!
//! `Frame` is the unit of data flowing from capture sources into the
//! detection engine and out to sinks: a tightly packed RGB8 pixel buffer
//! plus dimensions. Sources own the decode path (YUV conversion, stride
//! removal); by the time a `Frame` exists its data is plain row-major RGB.

use anyhow::{anyhow, Result};

/// One decoded video frame or still image, tightly packed RGB8.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap a pixel buffer. Fails when the buffer length does not match
    /// `width * height * 3`.
    pub fn from_rgb8(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major RGB8 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// A frame with no pixels carries nothing worth detecting on.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// View this frame as an `image` buffer (borrows, no copy).
    pub(crate) fn as_image(&self) -> Result<image::ImageBuffer<image::Rgb<u8>, &[u8]>> {
        image::ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }
}
