//! Local file frame source.
//!
//! This module provides `FileSource` for replaying local video files. The file
//! source is responsible for:
//! - Reading frames from a local file (no network access)
//! - Reporting end of file as "no data" so the loop can rewind
//! - Seeking back to the first frame on request
//!
//! Backends: synthetic `stub://clip` paths, raw-video files, and anything
//! FFmpeg can decode (feature: ingest-file-ffmpeg).

use anyhow::{anyhow, Result};
use std::path::Path;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::raw_video::{self, RawVideoReader};
use super::{FrameSource, SourceKind};
use crate::frame::RawFrame;

const STUB_SCHEME: &str = "stub://";
const DEFAULT_STUB_FRAMES: u64 = 30;
const STUB_WIDTH: u32 = 320;
const STUB_HEIGHT: u32 = 240;

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticClip),
    Raw(RawVideoReader),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let path_str = path.to_string_lossy();
        if !is_local_file_path(&path_str) {
            return Err(anyhow!(
                "file playback only supports local paths (no URL schemes): {}",
                path_str
            ));
        }
        if path_str.starts_with(STUB_SCHEME) {
            let clip = SyntheticClip::parse(&path_str)?;
            log::info!(
                "FileSource: opened {} (synthetic, {} frames)",
                path_str,
                clip.frames
            );
            return Ok(Self {
                backend: FileBackend::Synthetic(clip),
            });
        }
        if raw_video::sniff(path)? {
            let reader = RawVideoReader::open(path)?;
            log::info!("FileSource: opened {} (raw video)", path.display());
            return Ok(Self {
                backend: FileBackend::Raw(reader),
            });
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let source = FfmpegFileSource::open(path)?;
            log::info!("FileSource: opened {} (ffmpeg)", path.display());
            Ok(Self {
                backend: FileBackend::Ffmpeg(source),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "decoding {} requires the ingest-file-ffmpeg feature",
                path.display()
            ))
        }
    }
}

impl FrameSource for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(clip) => clip.path.clone(),
            FileBackend::Raw(reader) => reader.path().display().to_string(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.path().display().to_string(),
        }
    }

    fn pull(&mut self) -> Result<Option<RawFrame>> {
        match &mut self.backend {
            FileBackend::Synthetic(clip) => clip.next_frame(),
            FileBackend::Raw(reader) => reader.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(clip) => clip.rewind(),
            FileBackend::Raw(reader) => reader.rewind(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.rewind(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            FileBackend::Synthetic(clip) => clip.release(),
            FileBackend::Raw(reader) => reader.release(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.release(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic clip (stub://clip?frames=N) for tests and demos
// ----------------------------------------------------------------------------

struct SyntheticClip {
    path: String,
    frames: u64,
    position: u64,
    released: bool,
}

impl SyntheticClip {
    fn parse(path: &str) -> Result<Self> {
        let frames = match path.split_once('?') {
            Some((_, query)) => query
                .split('&')
                .find_map(|pair| pair.strip_prefix("frames="))
                .map(|n| {
                    n.parse::<u64>()
                        .map_err(|_| anyhow!("invalid frame count in {}", path))
                })
                .transpose()?
                .unwrap_or(DEFAULT_STUB_FRAMES),
            None => DEFAULT_STUB_FRAMES,
        };
        if frames == 0 {
            return Err(anyhow!("{} has no frames", path));
        }
        Ok(Self {
            path: path.to_string(),
            frames,
            position: 0,
            released: false,
        })
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.released {
            return Err(anyhow!("{} already released", self.path));
        }
        if self.position >= self.frames {
            return Ok(None);
        }
        let index = self.position;
        self.position += 1;
        let pixel_count = (STUB_WIDTH * STUB_HEIGHT * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + index * 8) % 256) as u8;
        }
        Ok(Some(RawFrame::new(pixels, STUB_WIDTH, STUB_HEIGHT, 3)))
    }

    fn rewind(&mut self) -> Result<()> {
        if self.released {
            return Err(anyhow!("{} already released", self.path));
        }
        self.position = 0;
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with(STUB_SCHEME) {
        return true;
    }
    !path.contains("://")
}
