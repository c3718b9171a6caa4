//! Frame types and the frame validator.
//!
//! - `RawFrame`: what a source hands back from a single pull. Owned by the
//!   acquisition loop until it is validated.
//! - `Frame`: a validated, sequenced frame published to the consumer. Ownership
//!   of the pixel buffer moves with the value; the producer never keeps a copy.
//! - `validate`: the shape check every pulled frame passes before publishing.

use serde::Serialize;
use std::time::Instant;

/// Largest channel count a frame may declare (RGBA).
pub const MAX_CHANNELS: u32 = 4;

// ----------------------------------------------------------------------------
// RawFrame: freshly pulled, not yet validated
// ----------------------------------------------------------------------------

/// Pixel data as it came out of a source, plus the shape the source declared.
#[derive(Debug)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u32) -> Self {
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes the declared shape requires, or `None` on overflow.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)
    }

    /// Attach a sequence number and hand the buffer over as a published frame.
    pub(crate) fn publish(self, sequence: u64) -> Frame {
        Frame {
            pixels: self.data,
            width: self.width,
            height: self.height,
            channels: self.channels,
            sequence,
            captured_at: Instant::now(),
        }
    }
}

// ----------------------------------------------------------------------------
// Frame validator
// ----------------------------------------------------------------------------

/// Returns `true` when a pulled frame is fit to publish.
///
/// Rejects empty buffers, zero dimensions, unsupported channel counts and
/// buffers whose length does not match `width * height * channels`.
pub fn validate(frame: &RawFrame) -> bool {
    if frame.data.is_empty() || frame.width == 0 || frame.height == 0 {
        return false;
    }
    if frame.channels == 0 || frame.channels > MAX_CHANNELS {
        return false;
    }
    frame.expected_len() == Some(frame.data.len())
}

// ----------------------------------------------------------------------------
// Frame: published to the consumer
// ----------------------------------------------------------------------------

/// A validated frame carrying its run-local sequence number.
///
/// There is no `Clone`: each published frame owns a buffer nobody else holds.
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    channels: u32,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Take the pixel buffer, e.g. to hand it to a texture upload.
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Metadata without the pixel payload, for logs and JSON output.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            channels: self.channels,
            bytes: self.pixels.len(),
        }
    }
}

/// Serializable description of a published frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FrameInfo {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub bytes: usize,
}
