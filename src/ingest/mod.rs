//! Frame sources.
//!
//! This module provides the sources an acquisition loop can pull from:
//! - Capture devices (feature: ingest-v4l2)
//! - Local raw-video files (`.rawv`, always available)
//! - Local encoded video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` clips and devices (testing, demos)
//!
//! A source is opened on the acquisition thread and owned by that thread until
//! it is released. Nothing else reads from it, so sources need not be `Send`.
//!
//! Sources MUST NOT:
//! - Retain or reuse a buffer after handing it out in a `RawFrame`
//! - Block forever in `release`
//! - Panic on repeated `release` calls

mod device;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod raw_video;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::PathBuf;

use crate::config::AcquisitionSettings;
use crate::frame::RawFrame;

pub use device::{SyntheticDevice, SyntheticOpener};
pub use file::FileSource;
pub use raw_video::RawVideoWriter;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// What to open: a capture device index or a local file path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Device(u32),
    File(PathBuf),
}

impl SourceDescriptor {
    /// File mode when a video path was given on the command line, otherwise
    /// the capture device (index 0 unless told otherwise).
    pub fn from_cli(play_video: Option<PathBuf>, device: Option<u32>) -> Self {
        match play_video {
            Some(path) => SourceDescriptor::File(path),
            None => SourceDescriptor::Device(device.unwrap_or(0)),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Device(_) => SourceKind::Device,
            SourceDescriptor::File(_) => SourceKind::File,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "device:{}", index),
            SourceDescriptor::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Decides how the loop reacts to a pull that yields no data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// No data means the device is gone.
    Device,
    /// No data means end of file; the loop rewinds.
    File,
}

/// An open video source, exclusively owned by one acquisition loop.
pub trait FrameSource {
    fn kind(&self) -> SourceKind;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    /// Pull the next frame.
    ///
    /// `Ok(None)` means no data: end of stream for files, a closed or
    /// disconnected device otherwise. `Err` is reserved for failures the
    /// source did not anticipate.
    fn pull(&mut self) -> Result<Option<RawFrame>>;

    /// Seek back to the first frame. Only meaningful for files.
    fn rewind(&mut self) -> Result<()> {
        Err(anyhow!("{} cannot be rewound", self.describe()))
    }

    /// Release underlying resources. Idempotent; must not fail.
    fn release(&mut self);
}

/// Turns a descriptor into an open source. Called on the acquisition thread.
pub trait SourceOpener: Send + Sync {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        settings: &AcquisitionSettings,
    ) -> Result<Box<dyn FrameSource>>;
}

/// Opens real hardware and files, as far as enabled features allow.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        settings: &AcquisitionSettings,
    ) -> Result<Box<dyn FrameSource>> {
        match descriptor {
            SourceDescriptor::Device(index) => open_device(*index, settings),
            SourceDescriptor::File(path) => Ok(Box::new(FileSource::open(path)?)),
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, settings: &AcquisitionSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::open(index, &settings.device)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _settings: &AcquisitionSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "capture device {} requires the ingest-v4l2 feature",
        index
    ))
}
