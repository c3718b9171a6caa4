//! Controller: the foreground's only handle on acquisition.
//!
//! Owns at most one acquisition run at a time. `start` spawns a loop on its
//! own thread, `stop` cancels it and waits (bounded) for it to release its
//! source. Events are handed to the foreground either through registered
//! subscribers (`pump`, `pump_timeout`) or one at a time (`next_event`).

use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::acquisition::{AcquisitionLoop, CancelToken, LoopState, LoopStats, SpawnedLoop};
use crate::channel::{event_channel, AcquisitionEvent, EventReceiver};
use crate::config::AcquisitionSettings;
use crate::fault::{ControlError, Fault};
use crate::frame::Frame;
use crate::ingest::{DefaultOpener, SourceDescriptor, SourceOpener};

/// What `stop` found and did. Callers are free to ignore it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// No loop was active; nothing happened.
    NotRunning,
    /// The loop released its source and its thread has exited.
    Stopped,
    /// The loop did not finish within the stop timeout. It has been told to
    /// stop and will exit once its blocking pull returns; it publishes nothing
    /// further.
    Detached,
}

type FrameSubscriber = Box<dyn FnMut(&Frame) + Send>;
type FaultSubscriber = Box<dyn FnMut(&Fault) + Send>;

struct ActiveRun {
    descriptor: SourceDescriptor,
    spawned: SpawnedLoop,
    started_at: Instant,
}

pub struct Controller {
    settings: AcquisitionSettings,
    opener: Arc<dyn SourceOpener>,
    active: Option<ActiveRun>,
    events: Option<EventReceiver>,
    last_state: LoopState,
    last_stats: LoopStats,
    last_dispatched: u64,
    frame_subscribers: Vec<FrameSubscriber>,
    fault_subscribers: Vec<FaultSubscriber>,
}

impl Controller {
    /// Controller backed by real devices and files.
    pub fn new(settings: AcquisitionSettings) -> Self {
        Self::with_opener(settings, DefaultOpener)
    }

    /// Controller opening sources through `opener` (e.g. a synthetic device).
    pub fn with_opener<O>(settings: AcquisitionSettings, opener: O) -> Self
    where
        O: SourceOpener + 'static,
    {
        Self {
            settings,
            opener: Arc::new(opener),
            active: None,
            events: None,
            last_state: LoopState::Idle,
            last_stats: LoopStats::default(),
            last_dispatched: 0,
            frame_subscribers: Vec::new(),
            fault_subscribers: Vec::new(),
        }
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Begin acquiring from `descriptor`.
    ///
    /// Returns once the loop thread is spawned; opening happens on that
    /// thread and a failure arrives as a `SourceUnavailable` fault. A run that
    /// already ended on its own (after a fault) is reaped first, so a restart
    /// straight after a fault is fine.
    pub fn start(&mut self, descriptor: SourceDescriptor) -> Result<(), ControlError> {
        if let Some(run) = &self.active {
            if run.spawned.handle.state().is_active() {
                return Err(ControlError::AlreadyRunning);
            }
        }
        if let Some(run) = self.active.take() {
            self.finish(run);
        }

        let (sender, receiver) = event_channel(self.settings.frame_backlog);
        let acquisition = AcquisitionLoop::new(
            descriptor.clone(),
            self.settings.clone(),
            self.opener.clone(),
            CancelToken::new(),
        );
        let spawned = acquisition.spawn(sender).map_err(ControlError::Spawn)?;

        log::info!("controller: started acquisition on {}", descriptor);
        self.events = Some(receiver);
        self.last_dispatched = 0;
        self.last_stats = LoopStats::default();
        self.active = Some(ActiveRun {
            descriptor,
            spawned,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Request cancellation and wait, bounded by the stop timeout, for the
    /// loop to release its source. Idempotent.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(run) = self.active.take() else {
            return StopOutcome::NotRunning;
        };
        let was_active = run.spawned.handle.state().is_active();
        run.spawned.handle.cancel();
        match self.finish(run) {
            StopOutcome::Stopped if !was_active => StopOutcome::NotRunning,
            outcome => outcome,
        }
    }

    /// Stop the current run (if any) and start on `descriptor`.
    pub fn switch_source(&mut self, descriptor: SourceDescriptor) -> Result<(), ControlError> {
        self.stop();
        self.start(descriptor)
    }

    /// True while a loop is starting or running.
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    pub fn state(&self) -> LoopState {
        match &self.active {
            Some(run) => run.spawned.handle.state(),
            None => self.last_state,
        }
    }

    /// Counters of the current run, or of the last one once it has stopped.
    pub fn stats(&self) -> LoopStats {
        match &self.active {
            Some(run) => run.spawned.handle.stats(),
            None => self.last_stats,
        }
    }

    /// The descriptor of the run in progress.
    pub fn source(&self) -> Option<&SourceDescriptor> {
        self.active.as_ref().map(|run| &run.descriptor)
    }

    /// Receiver for the latest run's events. Events published before a stop
    /// stay readable until the next `start`.
    pub fn events(&self) -> Option<EventReceiver> {
        self.events.clone()
    }

    pub fn subscribe_frames<F>(&mut self, subscriber: F)
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.frame_subscribers.push(Box::new(subscriber));
    }

    pub fn subscribe_faults<F>(&mut self, subscriber: F)
    where
        F: FnMut(&Fault) + Send + 'static,
    {
        self.fault_subscribers.push(Box::new(subscriber));
    }

    /// Dispatch every queued event to the subscribers without blocking.
    /// Returns the number of events dispatched.
    pub fn pump(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some(event) = self.try_next() {
            self.dispatch(event);
            dispatched += 1;
        }
        dispatched
    }

    /// Like `pump`, but waits up to `timeout` for the first event.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        match self.next_event(timeout) {
            Some(event) => {
                self.dispatch(event);
                1 + self.pump()
            }
            None => 0,
        }
    }

    /// Take the next event, waiting up to `timeout`. Stale frames are skipped.
    pub fn next_event(&mut self, timeout: Duration) -> Option<AcquisitionEvent> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let receiver = self.events.as_ref()?;
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            let event = match receiver.recv_timeout(remaining) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            };
            if self.accept(&event) {
                return Some(event);
            }
        }
    }

    fn try_next(&mut self) -> Option<AcquisitionEvent> {
        loop {
            let event = match self.events.as_ref()?.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            };
            if self.accept(&event) {
                return Some(event);
            }
        }
    }

    /// Sequence guard: frames must arrive with increasing sequence numbers.
    fn accept(&mut self, event: &AcquisitionEvent) -> bool {
        match event {
            AcquisitionEvent::Frame(frame) if frame.sequence() <= self.last_dispatched => {
                log::debug!(
                    "controller: discarding stale frame {} (last {})",
                    frame.sequence(),
                    self.last_dispatched
                );
                false
            }
            AcquisitionEvent::Frame(frame) => {
                self.last_dispatched = frame.sequence();
                true
            }
            AcquisitionEvent::Fault(_) => true,
        }
    }

    fn dispatch(&mut self, event: AcquisitionEvent) {
        match event {
            AcquisitionEvent::Frame(frame) => {
                for subscriber in &mut self.frame_subscribers {
                    subscriber(&frame);
                }
            }
            AcquisitionEvent::Fault(fault) => {
                for subscriber in &mut self.fault_subscribers {
                    subscriber(&fault);
                }
            }
        }
    }

    /// Wait for a cancelled or finished run's thread and record its outcome.
    fn finish(&mut self, run: ActiveRun) -> StopOutcome {
        let ActiveRun {
            descriptor,
            spawned,
            started_at,
        } = run;
        let SpawnedLoop { handle, join, done } = spawned;

        match done.recv_timeout(self.settings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if join.join().is_err() {
                    log::error!("controller: acquisition thread for {} panicked", descriptor);
                }
                self.last_state = LoopState::Stopped;
                self.last_stats = handle.stats();
                log::info!(
                    "controller: acquisition on {} ended after {:.1}s ({} frames)",
                    descriptor,
                    started_at.elapsed().as_secs_f64(),
                    self.last_stats.frames_published
                );
                StopOutcome::Stopped
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "controller: acquisition on {} did not stop within {:?}; detaching",
                    descriptor,
                    self.settings.stop_timeout
                );
                self.last_state = LoopState::Stopped;
                self.last_stats = handle.stats();
                // The loop publishes nothing after cancellation, but drop its
                // queue anyway so nothing from the hung run surfaces later.
                self.events = None;
                StopOutcome::Detached
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}
