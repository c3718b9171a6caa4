//! V4L2 capture device source.
//!
//! Opens `/dev/video<N>` through libv4l, negotiates packed RGB24 at the
//! configured size, and streams frames out of memory-mapped buffers. Each
//! pulled frame is copied out of the mmap ring so the published buffer is owned
//! by the consumer alone.

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use super::{FrameSource, SourceKind};
use crate::config::DeviceSettings;
use crate::frame::RawFrame;

const MMAP_BUFFERS: u32 = 4;

/// V4L2 capture device.
pub struct V4l2Source {
    device_path: String,
    state: Option<V4l2State>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn open(index: u32, settings: &DeviceSettings) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = format!("/dev/video{}", index);
        let mut device = v4l::Device::with_path(&device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        if settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", device_path, err);
            }
        }

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: opened {} ({}x{})",
            device_path,
            format.width,
            format.height
        );
        Ok(Self {
            device_path,
            state: Some(state),
            frame_count: 0,
            active_width: format.width,
            active_height: format.height,
        })
    }
}

impl FrameSource for V4l2Source {
    fn kind(&self) -> SourceKind {
        SourceKind::Device
    }

    fn describe(&self) -> String {
        self.device_path.clone()
    }

    fn pull(&mut self) -> Result<Option<RawFrame>> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .with_context(|| format!("{} already released", self.device_path))?;
        let captured = state.with_mut(|fields| {
            fields.stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                buf[..used].to_vec()
            })
        });

        match captured {
            Ok(pixels) => {
                self.frame_count += 1;
                Ok(Some(RawFrame::new(
                    pixels,
                    self.active_width,
                    self.active_height,
                    3,
                )))
            }
            Err(err) => {
                log::warn!("V4l2Source: capture on {} failed: {}", self.device_path, err);
                Ok(None)
            }
        }
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Source: released {} after {} frames",
                self.device_path,
                self.frame_count
            );
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}
