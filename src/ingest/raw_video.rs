//! Raw-video container.
//!
//! Layout: a 16-byte header (`b"RAWV"`, then little-endian `u32` width,
//! height, channels) followed by back-to-back frames of
//! `width * height * channels` bytes. A truncated trailing frame counts as end
//! of stream.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::frame::{RawFrame, MAX_CHANNELS};

pub const MAGIC: &[u8; 4] = b"RAWV";
pub const HEADER_LEN: u64 = 16;
/// Largest frame a raw-video header may declare (8K RGBA is ~127 MiB).
pub const MAX_FRAME_BYTES: usize = 128 << 20;

/// Returns `true` when the file starts with the raw-video magic.
pub fn sniff(path: &Path) -> Result<bool> {
    let mut file =
        File::open(path).with_context(|| format!("open video file {}", path.display()))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == MAGIC),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err).with_context(|| format!("read header of {}", path.display())),
    }
}

pub(crate) struct RawVideoReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    width: u32,
    height: u32,
    channels: u32,
    frame_len: usize,
    frames_read: u64,
}

impl RawVideoReader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open video file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .with_context(|| format!("read raw-video header of {}", path.display()))?;
        if &header[..4] != MAGIC {
            return Err(anyhow!("{} is not a raw-video file", path.display()));
        }
        let width = read_u32(&header[4..8]);
        let height = read_u32(&header[8..12]);
        let channels = read_u32(&header[12..16]);
        if width == 0 || height == 0 || channels == 0 || channels > MAX_CHANNELS {
            return Err(anyhow!(
                "{} declares an invalid frame shape {}x{}x{}",
                path.display(),
                width,
                height,
                channels
            ));
        }
        let frame_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|len| len.checked_mul(channels as usize))
            .ok_or_else(|| anyhow!("{} frame size overflows", path.display()))?;
        if frame_len > MAX_FRAME_BYTES {
            return Err(anyhow!(
                "{} declares {}x{}x{} frames ({} bytes), above the {} byte limit",
                path.display(),
                width,
                height,
                channels,
                frame_len,
                MAX_FRAME_BYTES
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            width,
            height,
            channels,
            frame_len,
            frames_read: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("{} already released", self.path.display()))?;
        let mut data = vec![0u8; self.frame_len];
        match reader.read_exact(&mut data) {
            Ok(()) => {
                self.frames_read += 1;
                Ok(Some(RawFrame::new(
                    data,
                    self.width,
                    self.height,
                    self.channels,
                )))
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read frame from {}", self.path.display())),
        }
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("{} already released", self.path.display()))?;
        reader
            .seek(SeekFrom::Start(HEADER_LEN))
            .with_context(|| format!("seek {} to first frame", self.path.display()))?;
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        if self.reader.take().is_some() {
            log::debug!(
                "FileSource: released {} after {} frames",
                self.path.display(),
                self.frames_read
            );
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Writes raw-video files, e.g. to record a clip for replay.
pub struct RawVideoWriter {
    writer: BufWriter<File>,
    frame_len: usize,
    frames_written: u64,
}

impl RawVideoWriter {
    pub fn create(path: &Path, width: u32, height: u32, channels: u32) -> Result<Self> {
        if width == 0 || height == 0 || channels == 0 || channels > MAX_CHANNELS {
            return Err(anyhow!(
                "invalid frame shape {}x{}x{}",
                width,
                height,
                channels
            ));
        }
        let frame_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|len| len.checked_mul(channels as usize))
            .ok_or_else(|| anyhow!("frame size overflows"))?;
        if frame_len > MAX_FRAME_BYTES {
            return Err(anyhow!(
                "{} byte frames exceed the {} byte limit",
                frame_len,
                MAX_FRAME_BYTES
            ));
        }
        let file = File::create(path)
            .with_context(|| format!("create video file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&width.to_le_bytes())?;
        writer.write_all(&height.to_le_bytes())?;
        writer.write_all(&channels.to_le_bytes())?;
        Ok(Self {
            writer,
            frame_len,
            frames_written: 0,
        })
    }

    pub fn write_frame(&mut self, pixels: &[u8]) -> Result<()> {
        if pixels.len() != self.frame_len {
            return Err(anyhow!(
                "frame has {} bytes, expected {}",
                pixels.len(),
                self.frame_len
            ));
        }
        self.writer.write_all(pixels)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flush and close the file, returning the number of frames written.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush().context("flush raw-video file")?;
        Ok(self.frames_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_clip(path: &Path, frames: u8) -> Result<()> {
        let mut writer = RawVideoWriter::create(path, 4, 2, 3)?;
        for i in 0..frames {
            writer.write_frame(&[i; 24])?;
        }
        writer.finish()?;
        Ok(())
    }

    #[test]
    fn reads_frames_then_end_of_stream() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.rawv");
        write_clip(&path, 3)?;
        assert!(sniff(&path)?);

        let mut reader = RawVideoReader::open(&path)?;
        for i in 0..3u8 {
            let frame = reader.next_frame()?.expect("frame present");
            assert_eq!((frame.width, frame.height, frame.channels), (4, 2, 3));
            assert!(crate::frame::validate(&frame));
            assert_eq!(frame.publish(1).pixels()[0], i);
        }
        assert!(reader.next_frame()?.is_none());

        reader.rewind()?;
        let first = reader.next_frame()?.expect("frame after rewind");
        assert_eq!(first.publish(1).pixels()[0], 0);
        Ok(())
    }

    #[test]
    fn truncated_trailing_frame_is_end_of_stream() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cut.rawv");
        write_clip(&path, 1)?;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[1u8; 10])?;
        drop(file);

        let mut reader = RawVideoReader::open(&path)?;
        assert!(reader.next_frame()?.is_some());
        assert!(reader.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn release_is_idempotent_and_blocks_reads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.rawv");
        write_clip(&path, 1)?;
        let mut reader = RawVideoReader::open(&path)?;
        reader.release();
        reader.release();
        assert!(reader.next_frame().is_err());
        assert!(reader.rewind().is_err());
        Ok(())
    }

    #[test]
    fn rejects_foreign_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"\x00\x00\x00\x20ftypisom")?;
        assert!(!sniff(&path)?);
        assert!(RawVideoReader::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn writer_rejects_wrong_frame_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = RawVideoWriter::create(&dir.path().join("x.rawv"), 2, 2, 1)?;
        assert!(writer.write_frame(&[0u8; 3]).is_err());
        writer.write_frame(&[0u8; 4])?;
        assert_eq!(writer.finish()?, 1);
        Ok(())
    }

    #[test]
    fn rejects_oversized_frame_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("huge.rawv");
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        for value in [65_535u32, 65_535, 4] {
            header.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(&path, &header)?;

        assert!(sniff(&path)?);
        let err = RawVideoReader::open(&path).err().expect("header over limit");
        assert!(err.to_string().contains("limit"));
        assert!(RawVideoWriter::create(&dir.path().join("w.rawv"), 65_535, 65_535, 4).is_err());
        Ok(())
    }
}
