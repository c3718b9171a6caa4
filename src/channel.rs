//! Producer → consumer event channel.
//!
//! Carries frame and fault events from the acquisition thread to the
//! foreground in emission order. The producer never waits on the consumer:
//! once `frame_backlog` frame events are pending, the oldest pending frame is
//! dropped to make room for the newest. Fault events are never dropped.
//!
//! The channel closes when the `EventSender` is dropped; receivers drain what
//! is left and then observe `Disconnected`.

use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::fault::Fault;
use crate::frame::Frame;

/// One delivery from an acquisition run.
#[derive(Debug)]
pub enum AcquisitionEvent {
    Frame(Frame),
    Fault(Fault),
}

struct Queue {
    events: VecDeque<AcquisitionEvent>,
    pending_frames: usize,
    dropped_frames: u64,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
    frame_backlog: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a channel holding at most `frame_backlog` undelivered frames.
pub fn event_channel(frame_backlog: usize) -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            events: VecDeque::new(),
            pending_frames: 0,
            dropped_frames: 0,
            closed: false,
        }),
        ready: Condvar::new(),
        frame_backlog: frame_backlog.max(1),
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

/// Producer half. Owned by the acquisition loop; not cloneable.
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Queue a frame. Returns `true` if an older pending frame was dropped.
    pub fn send_frame(&self, frame: Frame) -> bool {
        let mut queue = self.shared.lock();
        let mut dropped = false;
        if queue.pending_frames >= self.shared.frame_backlog {
            let oldest = queue
                .events
                .iter()
                .position(|event| matches!(event, AcquisitionEvent::Frame(_)));
            if let Some(index) = oldest {
                queue.events.remove(index);
                queue.pending_frames -= 1;
                queue.dropped_frames += 1;
                dropped = true;
            }
        }
        queue.events.push_back(AcquisitionEvent::Frame(frame));
        queue.pending_frames += 1;
        drop(queue);
        self.shared.ready.notify_all();
        dropped
    }

    pub fn send_fault(&self, fault: Fault) {
        self.shared
            .lock()
            .events
            .push_back(AcquisitionEvent::Fault(fault));
        self.shared.ready.notify_all();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.lock().dropped_frames
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
    }
}

/// Consumer half. Clones share the same queue.
#[derive(Clone)]
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    pub fn try_recv(&self) -> Result<AcquisitionEvent, TryRecvError> {
        let mut queue = self.shared.lock();
        match pop(&mut queue) {
            Some(event) => Ok(event),
            None if queue.closed => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Wait up to `timeout` for the next event. A timeout too large to
    /// express as an `Instant` waits until an event arrives or the sender goes.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<AcquisitionEvent, RecvTimeoutError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.shared.lock();
        loop {
            if let Some(event) = pop(&mut queue) {
                return Ok(event);
            }
            if queue.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            queue = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RecvTimeoutError::Timeout);
                    }
                    self.shared
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Events queued but not yet received.
    pub fn pending(&self) -> usize {
        self.shared.lock().events.len()
    }

    /// True once the sender is gone and every event has been received.
    pub fn is_drained(&self) -> bool {
        let queue = self.shared.lock();
        queue.closed && queue.events.is_empty()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.lock().dropped_frames
    }
}

fn pop(queue: &mut Queue) -> Option<AcquisitionEvent> {
    let event = queue.events.pop_front()?;
    if matches!(event, AcquisitionEvent::Frame(_)) {
        queue.pending_frames -= 1;
    }
    Some(event)
}
