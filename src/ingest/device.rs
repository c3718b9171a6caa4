//! Synthetic capture device.
//!
//! Stands in for a camera when none is attached: the dashboard's `--synthetic`
//! mode and the test-suite both use it. A synthetic device behaves like a real
//! one in the ways the acquisition loop cares about:
//! - only one handle may be open at a time ("device busy" otherwise)
//! - it can refuse to open, disconnect after N frames, or emit a corrupt frame

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{DefaultOpener, FrameSource, SourceDescriptor, SourceKind, SourceOpener};
use crate::config::AcquisitionSettings;
use crate::frame::RawFrame;

/// Behaviour script for a synthetic device. Cloning shares the busy flag and
/// counters, so a clone describes the same physical device.
#[derive(Clone, Debug)]
pub struct SyntheticDevice {
    width: u32,
    height: u32,
    available: bool,
    disconnect_after: Option<u64>,
    corrupt_frame: Option<u64>,
    busy: Arc<AtomicBool>,
    opens: Arc<AtomicU64>,
    releases: Arc<AtomicU64>,
}

impl SyntheticDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            available: true,
            disconnect_after: None,
            corrupt_frame: None,
            busy: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(AtomicU64::new(0)),
            releases: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The device never opens.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Deliver `frames` frames, then report no data.
    pub fn disconnect_after(mut self, frames: u64) -> Self {
        self.disconnect_after = Some(frames);
        self
    }

    /// The `nth` pull (1-based) returns a frame whose buffer is too short.
    pub fn corrupt_frame(mut self, nth: u64) -> Self {
        self.corrupt_frame = Some(nth);
        self
    }

    /// True while a handle is open.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn open_handle(&self, index: u32) -> Result<SyntheticDeviceSource> {
        if !self.available {
            return Err(anyhow!("capture device {} did not respond", index));
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("capture device {} is busy", index));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "SyntheticDevice: opened device {} ({}x{})",
            index,
            self.width,
            self.height
        );
        Ok(SyntheticDeviceSource {
            index,
            device: self.clone(),
            frame_count: 0,
            held: true,
        })
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

struct SyntheticDeviceSource {
    index: u32,
    device: SyntheticDevice,
    frame_count: u64,
    held: bool,
}

impl SyntheticDeviceSource {
    fn generate_pixels(&self) -> Result<Vec<u8>> {
        let byte_count = (self.device.width as usize)
            .checked_mul(self.device.height as usize)
            .and_then(|pixels| pixels.checked_mul(3))
            .ok_or_else(|| {
                anyhow!(
                    "synthetic device {} frame size {}x{} overflows",
                    self.index,
                    self.device.width,
                    self.device.height
                )
            })?;
        let mut pixels = vec![0u8; byte_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticDeviceSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Device
    }

    fn describe(&self) -> String {
        format!("synthetic device {}", self.index)
    }

    fn pull(&mut self) -> Result<Option<RawFrame>> {
        if !self.held {
            return Err(anyhow!("synthetic device {} already released", self.index));
        }
        if let Some(limit) = self.device.disconnect_after {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        let mut pixels = self.generate_pixels()?;
        if self.device.corrupt_frame == Some(self.frame_count) {
            pixels.truncate(pixels.len() / 2);
        }
        Ok(Some(RawFrame::new(
            pixels,
            self.device.width,
            self.device.height,
            3,
        )))
    }

    fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        self.device.releases.fetch_add(1, Ordering::SeqCst);
        self.device.busy.store(false, Ordering::SeqCst);
        log::info!(
            "SyntheticDevice: released device {} after {} frames",
            self.index,
            self.frame_count
        );
    }
}

impl Drop for SyntheticDeviceSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens device descriptors as a synthetic device; files open as usual.
#[derive(Clone, Debug, Default)]
pub struct SyntheticOpener {
    device: SyntheticDevice,
}

impl SyntheticOpener {
    pub fn new(device: SyntheticDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &SyntheticDevice {
        &self.device
    }
}

impl SourceOpener for SyntheticOpener {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        settings: &AcquisitionSettings,
    ) -> Result<Box<dyn FrameSource>> {
        match descriptor {
            SourceDescriptor::Device(index) => Ok(Box::new(self.device.open_handle(*index)?)),
            SourceDescriptor::File(_) => DefaultOpener.open(descriptor, settings),
        }
    }
}
