//! Dashboard frame acquisition
//!
//! This crate implements the video pipeline behind the dashboard's map panel:
//! a background loop pulls frames from a capture device or a local video file,
//! checks them, and hands them to the foreground in order.
//!
//! # Architecture
//!
//! The pipeline keeps a few guarantees by construction:
//!
//! 1. **Single owner**: a source is opened, read and released by one loop
//!    thread. Nobody else touches it.
//! 2. **Release before report**: a failing run releases its source before its
//!    fault is delivered, so a restart can reopen the device at once.
//! 3. **Ordered delivery**: frames carry strictly increasing sequence numbers;
//!    a fault is the last event of its run.
//! 4. **Looping files**: end of file rewinds; malformed file frames are skipped.
//!
//! # Module Structure
//!
//! - `frame`: `RawFrame`, `Frame` and the frame validator
//! - `ingest`: frame sources (capture devices, raw-video files, FFmpeg files)
//! - `channel`: producer → consumer event channel
//! - `acquisition`: the acquisition loop and its lifecycle
//! - `controller`: start/stop surface for the foreground
//! - `config`: acquisition settings with environment overrides

pub mod acquisition;
pub mod channel;
pub mod config;
pub mod controller;
pub mod fault;
pub mod frame;
pub mod ingest;

pub use acquisition::{LoopState, LoopStats};
pub use channel::{AcquisitionEvent, EventReceiver};
pub use config::{AcquisitionSettings, DeviceSettings};
pub use controller::{Controller, StopOutcome};
pub use fault::{ControlError, Fault, FaultKind};
pub use frame::{validate, Frame, FrameInfo, RawFrame};
pub use ingest::{
    DefaultOpener, FrameSource, SourceDescriptor, SourceKind, SourceOpener, SyntheticDevice,
    SyntheticOpener,
};
