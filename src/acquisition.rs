//! Acquisition loop.
//!
//! The loop owns its source from open to release and runs on a dedicated
//! thread. Each iteration:
//! 1. checks the cancellation token
//! 2. pulls one frame
//! 3. publishes it if it validates (next sequence number)
//! 4. on "no data": faults for devices, rewinds files
//! 5. sleeps out the rest of the pacing interval (woken early by cancel)
//!
//! Every way out of `Running` goes through `Stopping`, where the source is
//! released before any fault is delivered. Errors and panics raised by a
//! source become `InternalError` faults; nothing escapes the thread.

use anyhow::Result;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::EventSender;
use crate::config::AcquisitionSettings;
use crate::fault::{Fault, FaultKind};
use crate::frame;
use crate::ingest::{FrameSource, SourceDescriptor, SourceKind, SourceOpener};

const THREAD_NAME: &str = "frame-acquisition";

// ----------------------------------------------------------------------------
// Loop state
// ----------------------------------------------------------------------------

/// Lifecycle of one acquisition run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Idle,
            1 => LoopState::Starting,
            2 => LoopState::Running,
            3 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }

    /// Starting or Running: the run still owns (or is about to own) a source.
    pub fn is_active(self) -> bool {
        matches!(self, LoopState::Starting | LoopState::Running)
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(LoopState::Idle as u8))
    }

    fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

/// Cooperative stop signal shared by the controller and one loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`. Returns `true` if cancelled meanwhile.
    ///
    /// A timeout too large to express as an `Instant` waits for cancellation
    /// only.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_cancelled() {
                return true;
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.inner
                        .wake
                        .wait_timeout(guard, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .inner
                    .wake
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters for one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Frames handed to the channel (equals the last sequence number).
    pub frames_published: u64,
    /// Malformed file frames skipped without a fault.
    pub frames_skipped: u64,
    /// File rewinds performed by the looping policy.
    pub restarts: u64,
    /// Published frames the channel discarded because the consumer lagged.
    pub frames_dropped: u64,
}

#[derive(Default)]
struct StatsCell {
    frames_published: AtomicU64,
    frames_skipped: AtomicU64,
    restarts: AtomicU64,
    frames_dropped: AtomicU64,
}

impl StatsCell {
    fn snapshot(&self) -> LoopStats {
        LoopStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Shared view of a loop: its state, counters and stop signal.
#[derive(Clone)]
pub struct LoopHandle {
    state: Arc<StateCell>,
    stats: Arc<StatsCell>,
    cancel: CancelToken,
}

impl LoopHandle {
    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.snapshot()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// A loop running on its own thread. `done` disconnects when the thread exits.
pub(crate) struct SpawnedLoop {
    pub(crate) handle: LoopHandle,
    pub(crate) join: JoinHandle<()>,
    pub(crate) done: crossbeam_channel::Receiver<()>,
}

// ----------------------------------------------------------------------------
// The loop
// ----------------------------------------------------------------------------

enum Step {
    Continue,
    Stop(Fault),
}

/// Producer bound to one source descriptor. Runs once.
pub struct AcquisitionLoop {
    descriptor: SourceDescriptor,
    settings: AcquisitionSettings,
    opener: Arc<dyn SourceOpener>,
    cancel: CancelToken,
    state: Arc<StateCell>,
    stats: Arc<StatsCell>,
}

impl AcquisitionLoop {
    pub fn new(
        descriptor: SourceDescriptor,
        settings: AcquisitionSettings,
        opener: Arc<dyn SourceOpener>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            descriptor,
            settings,
            opener,
            cancel,
            state: Arc::new(StateCell::new()),
            stats: Arc::new(StatsCell::default()),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            state: self.state.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Move the loop onto its own thread.
    pub(crate) fn spawn(self, events: EventSender) -> std::io::Result<SpawnedLoop> {
        let handle = self.handle();
        handle.state.set(LoopState::Starting);
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let spawned = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let _done = done_tx;
                self.run(events);
            });
        match spawned {
            Ok(join) => Ok(SpawnedLoop { handle, join, done }),
            Err(err) => {
                handle.state.set(LoopState::Stopped);
                Err(err)
            }
        }
    }

    /// Run to completion on the calling thread.
    pub fn run(self, events: EventSender) {
        self.state.set(LoopState::Starting);
        log::info!("acquisition: opening {}", self.descriptor);

        let opened = panic::catch_unwind(AssertUnwindSafe(|| {
            self.opener.open(&self.descriptor, &self.settings)
        }));
        let mut source = match opened {
            Ok(Ok(source)) => source,
            Ok(Err(err)) => {
                let fault = Fault::from_error(FaultKind::SourceUnavailable, &err, 0);
                self.finish(None, Some(fault), &events);
                return;
            }
            Err(payload) => {
                let fault = Fault::new(
                    FaultKind::InternalError,
                    format!("opening {} panicked: {}", self.descriptor, panic_message(&*payload)),
                    0,
                );
                self.finish(None, Some(fault), &events);
                return;
            }
        };

        if self.cancel.is_cancelled() {
            self.finish(Some(source.as_mut()), None, &events);
            return;
        }

        self.state.set(LoopState::Running);
        log::info!(
            "acquisition: running on {} (pacing {:?})",
            source.describe(),
            self.settings.pacing
        );
        let fault = self.pump(source.as_mut(), &events);
        self.finish(Some(source.as_mut()), fault, &events);
    }

    /// Stopping → Stopped: release first, then report.
    fn finish(
        &self,
        source: Option<&mut dyn FrameSource>,
        fault: Option<Fault>,
        events: &EventSender,
    ) {
        self.state.set(LoopState::Stopping);
        if let Some(source) = source {
            let released = panic::catch_unwind(AssertUnwindSafe(|| source.release()));
            if let Err(payload) = released {
                log::error!(
                    "acquisition: releasing {} panicked: {}",
                    self.descriptor,
                    panic_message(&*payload)
                );
            }
        }
        if let Some(fault) = fault {
            log::warn!("acquisition: {} stopped on fault: {}", self.descriptor, fault);
            events.send_fault(fault);
        }
        self.state.set(LoopState::Stopped);
        let stats = self.stats.snapshot();
        log::info!(
            "acquisition: {} stopped (published={} skipped={} restarts={} dropped={})",
            self.descriptor,
            stats.frames_published,
            stats.frames_skipped,
            stats.restarts,
            stats.frames_dropped
        );
    }

    fn pump(&self, source: &mut dyn FrameSource, events: &EventSender) -> Option<Fault> {
        let kind = source.kind();
        let mut sequence = 0u64;
        let mut published_this_pass = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let started = Instant::now();

            let step = panic::catch_unwind(AssertUnwindSafe(|| {
                self.step(source, kind, events, &mut sequence, &mut published_this_pass)
            }));
            match step {
                Ok(Ok(Step::Continue)) => {}
                Ok(Ok(Step::Stop(fault))) => return Some(fault),
                Ok(Err(err)) => {
                    return Some(Fault::from_error(FaultKind::InternalError, &err, sequence))
                }
                Err(payload) => {
                    return Some(Fault::new(
                        FaultKind::InternalError,
                        format!("source panicked: {}", panic_message(&*payload)),
                        sequence,
                    ))
                }
            }

            if let Some(rest) = self.settings.pacing.checked_sub(started.elapsed()) {
                if !rest.is_zero() && self.cancel.wait_timeout(rest) {
                    return None;
                }
            }
        }
    }

    fn step(
        &self,
        source: &mut dyn FrameSource,
        kind: SourceKind,
        events: &EventSender,
        sequence: &mut u64,
        published_this_pass: &mut u64,
    ) -> Result<Step> {
        let pulled = source.pull()?;
        // A pull can outlive a stop request; nothing is published after it.
        if self.cancel.is_cancelled() {
            return Ok(Step::Continue);
        }

        match pulled {
            Some(raw) if frame::validate(&raw) => {
                *sequence += 1;
                *published_this_pass += 1;
                self.stats.frames_published.store(*sequence, Ordering::Relaxed);
                if events.send_frame(raw.publish(*sequence)) {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("acquisition: consumer lagging, dropped an older frame");
                }
                Ok(Step::Continue)
            }
            Some(raw) => match kind {
                SourceKind::Device => Ok(Step::Stop(Fault::new(
                    FaultKind::ReadFailure,
                    format!(
                        "{} delivered a malformed frame ({} bytes for {}x{}x{})",
                        source.describe(),
                        raw.byte_len(),
                        raw.width,
                        raw.height,
                        raw.channels
                    ),
                    *sequence,
                ))),
                SourceKind::File => {
                    self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "acquisition: skipped malformed frame from {} ({} bytes)",
                        source.describe(),
                        raw.byte_len()
                    );
                    Ok(Step::Continue)
                }
            },
            None => match kind {
                SourceKind::Device => Ok(Step::Stop(Fault::new(
                    FaultKind::ReadFailure,
                    format!("{} returned no data (closed or disconnected)", source.describe()),
                    *sequence,
                ))),
                SourceKind::File if *published_this_pass == 0 => Ok(Step::Stop(Fault::new(
                    FaultKind::EndOfStream,
                    format!("{} has no playable frames", source.describe()),
                    *sequence,
                ))),
                SourceKind::File => match source.rewind() {
                    Ok(()) => {
                        *published_this_pass = 0;
                        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "acquisition: end of {}, looping from the start",
                            source.describe()
                        );
                        Ok(Step::Continue)
                    }
                    Err(err) => Ok(Step::Stop(Fault::from_error(
                        FaultKind::ReadFailure,
                        &err.context("end of stream, rewind failed"),
                        *sequence,
                    ))),
                },
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
