//! Local file frame source using FFmpeg.
//!
//! Decodes the best video stream of a local file to packed RGB24. End of file
//! is reported as "no data"; `rewind` seeks back to the start and flushes the
//! decoder so the loop can replay the clip.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::{Path, PathBuf};

use crate::frame::RawFrame;

pub(crate) struct FfmpegFileSource {
    path: PathBuf,
    state: Option<DecodeState>,
    frame_count: u64,
}

struct DecodeState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path.display()))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("{} has no video track", path.display()))?;
        let stream_index = input_stream.index();
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

        Ok(Self {
            path: path.to_path_buf(),
            state: Some(DecodeState {
                input,
                stream_index,
                decoder,
                scaler,
                eof_sent: false,
            }),
            frame_count: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let state = self
            .state
            .as_mut()
            .with_context(|| format!("{} already released", self.path.display()))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                self.frame_count += 1;
                return Ok(Some(RawFrame::new(pixels, width, height, 3)));
            }
            if state.eof_sent {
                return Ok(None);
            }

            let next = state.input.packets().next();
            match next {
                Some((stream, packet)) => {
                    if stream.index() != state.stream_index {
                        continue;
                    }
                    state
                        .decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    state
                        .decoder
                        .send_eof()
                        .context("signal end of file to ffmpeg decoder")?;
                    state.eof_sent = true;
                }
            }
        }
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .with_context(|| format!("{} already released", self.path.display()))?;
        state
            .input
            .seek(0, ..)
            .with_context(|| format!("seek {} to start", self.path.display()))?;
        state.decoder.flush();
        state.eof_sent = false;
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        if self.state.take().is_some() {
            log::debug!(
                "FileSource: released {} after {} decoded frames",
                self.path.display(),
                self.frame_count
            );
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
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
