use anyhow::Result;
use crossbeam_channel::RecvTimeoutError;
use std::path::Path;
use std::time::{Duration, Instant};

use dashboard_capture::ingest::RawVideoWriter;
use dashboard_capture::{
    AcquisitionEvent, AcquisitionSettings, ControlError, Controller, Fault, FaultKind,
    FrameSource, LoopState, RawFrame, SourceDescriptor, SourceKind, SourceOpener, StopOutcome,
    SyntheticDevice, SyntheticOpener,
};

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn settings() -> AcquisitionSettings {
    AcquisitionSettings {
        pacing: Duration::from_millis(2),
        frame_backlog: 1024,
        ..AcquisitionSettings::default()
    }
}

fn synthetic(device: SyntheticDevice) -> Controller {
    Controller::with_opener(settings(), SyntheticOpener::new(device))
}

/// Collect frame sequence numbers until a fault arrives or `max_frames` frames
/// have been seen.
fn collect(controller: &mut Controller, max_frames: usize) -> (Vec<u64>, Option<Fault>) {
    let mut sequences = Vec::new();
    while sequences.len() < max_frames {
        match controller.next_event(EVENT_WAIT) {
            Some(AcquisitionEvent::Frame(frame)) => sequences.push(frame.sequence()),
            Some(AcquisitionEvent::Fault(fault)) => return (sequences, Some(fault)),
            None => break,
        }
    }
    (sequences, None)
}

fn wait_for_state(controller: &Controller, state: LoopState) {
    let deadline = Instant::now() + EVENT_WAIT;
    while controller.state() != state && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(controller.state(), state);
}

fn write_clip(path: &Path, frames: u8) -> Result<()> {
    let mut writer = RawVideoWriter::create(path, 4, 2, 3)?;
    for index in 0..frames {
        writer.write_frame(&[index; 24])?;
    }
    writer.finish()?;
    Ok(())
}

#[test]
fn unavailable_device_reports_one_fault_and_no_frames() {
    let mut controller = synthetic(SyntheticDevice::new(16, 8).unavailable());
    controller
        .start(SourceDescriptor::Device(0))
        .expect("start returns before opening");

    let (frames, fault) = collect(&mut controller, usize::MAX);
    assert!(frames.is_empty());
    let fault = fault.expect("source unavailable fault");
    assert_eq!(fault.kind, FaultKind::SourceUnavailable);
    assert_eq!(fault.sequence, 0);

    wait_for_state(&controller, LoopState::Stopped);
    assert!(!controller.is_running());
    assert!(controller.next_event(Duration::from_millis(50)).is_none());
}

#[test]
fn looping_file_delivers_gapless_sequences_across_restarts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clip = dir.path().join("ten.rawv");
    write_clip(&clip, 10)?;

    let mut controller = Controller::new(settings());
    controller.start(SourceDescriptor::File(clip))?;

    let (frames, fault) = collect(&mut controller, 25);
    assert!(fault.is_none(), "unexpected fault {:?}", fault);
    assert_eq!(frames, (1..=25).collect::<Vec<u64>>());
    assert!(controller.stats().restarts >= 2);

    assert_eq!(controller.stop(), StopOutcome::Stopped);
    assert_eq!(controller.stats().frames_skipped, 0);
    Ok(())
}

#[test]
fn synthetic_clip_loops_without_faults() {
    let mut controller = Controller::new(settings());
    controller
        .start(SourceDescriptor::File("stub://clip?frames=4".into()))
        .expect("start");
    let (frames, fault) = collect(&mut controller, 10);
    assert!(fault.is_none());
    assert_eq!(frames, (1..=10).collect::<Vec<u64>>());
    controller.stop();
}

#[test]
fn device_disconnect_ends_run_with_read_failure() {
    let mut controller = synthetic(SyntheticDevice::new(16, 8).disconnect_after(5));
    controller.start(SourceDescriptor::Device(0)).expect("start");

    let (frames, fault) = collect(&mut controller, usize::MAX);
    assert_eq!(frames, vec![1, 2, 3, 4, 5]);
    let fault = fault.expect("read failure");
    assert_eq!(fault.kind, FaultKind::ReadFailure);
    assert_eq!(fault.sequence, 5);

    wait_for_state(&controller, LoopState::Stopped);
    assert!(controller.next_event(Duration::from_millis(50)).is_none());
    let events = controller.events().expect("receiver of last run");
    assert!(matches!(
        events.recv_timeout(EVENT_WAIT),
        Err(RecvTimeoutError::Disconnected)
    ));
    assert!(events.is_drained());
}

#[test]
fn second_start_is_rejected_and_first_run_continues() {
    let mut controller = synthetic(SyntheticDevice::new(16, 8));
    controller.start(SourceDescriptor::Device(0)).expect("start");
    let (before, _) = collect(&mut controller, 3);
    assert_eq!(before, vec![1, 2, 3]);

    assert!(matches!(
        controller.start(SourceDescriptor::Device(1)),
        Err(ControlError::AlreadyRunning)
    ));
    assert!(controller.is_running());
    assert_eq!(controller.source(), Some(&SourceDescriptor::Device(0)));

    let (after, fault) = collect(&mut controller, 3);
    assert!(fault.is_none());
    assert_eq!(after, vec![4, 5, 6]);
    assert_eq!(controller.stop(), StopOutcome::Stopped);
}

#[test]
fn stop_is_a_no_op_when_idle_or_stopped() {
    let mut controller = synthetic(SyntheticDevice::new(16, 8));
    let started = Instant::now();
    assert_eq!(controller.stop(), StopOutcome::NotRunning);
    assert_eq!(controller.stop(), StopOutcome::NotRunning);
    assert!(started.elapsed() < Duration::from_millis(500));

    controller.start(SourceDescriptor::Device(0)).expect("start");
    assert_eq!(controller.stop(), StopOutcome::Stopped);
    assert_eq!(controller.stop(), StopOutcome::NotRunning);
    assert_eq!(controller.state(), LoopState::Stopped);
}

#[test]
fn stop_releases_device_for_the_next_run() {
    let device = SyntheticDevice::new(16, 8);
    let mut controller = synthetic(device.clone());
    controller.start(SourceDescriptor::Device(0)).expect("start");
    let (frames, _) = collect(&mut controller, 2);
    assert_eq!(frames.len(), 2);

    assert_eq!(controller.stop(), StopOutcome::Stopped);
    assert!(!device.is_busy());
    assert_eq!(device.release_count(), 1);

    controller.start(SourceDescriptor::Device(0)).expect("restart");
    let (frames, fault) = collect(&mut controller, 2);
    assert!(fault.is_none());
    assert_eq!(frames, vec![1, 2]);
    assert_eq!(device.open_count(), 2);
}

#[test]
fn restart_right_after_fault_reopens_device() {
    let device = SyntheticDevice::new(16, 8).disconnect_after(3);
    let mut controller = synthetic(device.clone());
    controller.start(SourceDescriptor::Device(0)).expect("start");
    let (_, fault) = collect(&mut controller, usize::MAX);
    assert!(fault.is_some());

    // The fault is delivered only after the device was released.
    assert!(!device.is_busy());
    controller
        .start(SourceDescriptor::Device(0))
        .expect("restart straight after fault");
    let (frames, fault) = collect(&mut controller, usize::MAX);
    assert_eq!(frames, vec![1, 2, 3]);
    assert_eq!(fault.map(|fault| fault.kind), Some(FaultKind::ReadFailure));
}

#[test]
fn malformed_device_frame_is_a_single_read_failure() {
    let mut controller = synthetic(SyntheticDevice::new(16, 8).corrupt_frame(3));
    controller.start(SourceDescriptor::Device(0)).expect("start");

    let (frames, fault) = collect(&mut controller, usize::MAX);
    assert_eq!(frames, vec![1, 2]);
    let fault = fault.expect("read failure");
    assert_eq!(fault.kind, FaultKind::ReadFailure);
    assert_eq!(fault.sequence, 2);
    assert!(controller.next_event(Duration::from_millis(50)).is_none());
}

#[test]
fn switch_source_moves_from_device_to_file() {
    let device = SyntheticDevice::new(16, 8);
    let mut controller = synthetic(device.clone());
    controller.start(SourceDescriptor::Device(0)).expect("start");
    collect(&mut controller, 2);

    controller
        .switch_source(SourceDescriptor::File("stub://clip?frames=3".into()))
        .expect("switch");
    assert!(!device.is_busy());
    let (frames, fault) = collect(&mut controller, 5);
    assert!(fault.is_none());
    assert_eq!(frames, vec![1, 2, 3, 4, 5]);
}

#[test]
fn empty_file_ends_with_end_of_stream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clip = dir.path().join("empty.rawv");
    write_clip(&clip, 0)?;

    let mut controller = Controller::new(settings());
    controller.start(SourceDescriptor::File(clip))?;
    let (frames, fault) = collect(&mut controller, usize::MAX);
    assert!(frames.is_empty());
    assert_eq!(fault.map(|fault| fault.kind), Some(FaultKind::EndOfStream));
    Ok(())
}

#[test]
fn missing_file_is_source_unavailable() {
    let mut controller = Controller::new(settings());
    controller
        .start(SourceDescriptor::File("/nonexistent/clip.rawv".into()))
        .expect("start");
    let (frames, fault) = collect(&mut controller, usize::MAX);
    assert!(frames.is_empty());
    assert_eq!(
        fault.map(|fault| fault.kind),
        Some(FaultKind::SourceUnavailable)
    );
}

/// A device whose pull blocks far longer than the stop timeout.
struct HungOpener {
    block_for: Duration,
}

struct HungSource {
    block_for: Duration,
}

impl FrameSource for HungSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Device
    }

    fn describe(&self) -> String {
        "hung device".to_string()
    }

    fn pull(&mut self) -> Result<Option<RawFrame>> {
        std::thread::sleep(self.block_for);
        Ok(Some(RawFrame::new(vec![0u8; 3], 1, 1, 3)))
    }

    fn release(&mut self) {}
}

impl SourceOpener for HungOpener {
    fn open(
        &self,
        _descriptor: &SourceDescriptor,
        _settings: &AcquisitionSettings,
    ) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(HungSource {
            block_for: self.block_for,
        }))
    }
}

#[test]
fn stop_detaches_from_a_hung_source_within_the_timeout() {
    let settings = AcquisitionSettings {
        stop_timeout: Duration::from_millis(100),
        ..settings()
    };
    let mut controller = Controller::with_opener(
        settings,
        HungOpener {
            block_for: Duration::from_millis(800),
        },
    );
    controller.start(SourceDescriptor::Device(0)).expect("start");
    std::thread::sleep(Duration::from_millis(50));
    let events = controller.events().expect("receiver");

    let started = Instant::now();
    assert_eq!(controller.stop(), StopOutcome::Detached);
    assert!(started.elapsed() < Duration::from_millis(700));
    assert!(!controller.is_running());
    assert!(controller.events().is_none());

    // Once the blocked pull returns, the loop exits without publishing.
    match events.recv_timeout(EVENT_WAIT) {
        Err(RecvTimeoutError::Disconnected) => {}
        other => panic!("expected a silent exit, got {:?}", other),
    }
}

#[test]
fn pulls_are_spaced_by_the_pacing_interval() {
    let pacing = Duration::from_millis(30);
    let settings = AcquisitionSettings {
        pacing,
        ..settings()
    };
    let mut controller = Controller::with_opener(
        settings,
        SyntheticOpener::new(SyntheticDevice::new(16, 8)),
    );

    let started = Instant::now();
    controller.start(SourceDescriptor::Device(0)).expect("start");
    let (frames, fault) = collect(&mut controller, 5);
    let elapsed = started.elapsed();

    assert!(fault.is_none());
    assert_eq!(frames, vec![1, 2, 3, 4, 5]);
    // The first pull starts after `start`; each later one waits a full interval.
    assert!(
        elapsed >= pacing * 4,
        "5 frames arrived after {:?}, expected at least {:?}",
        elapsed,
        pacing * 4
    );
    assert_eq!(controller.stop(), StopOutcome::Stopped);
}

#[test]
fn stop_interrupts_a_long_pacing_sleep() {
    let settings = AcquisitionSettings {
        pacing: Duration::from_secs(30),
        ..settings()
    };
    let device = SyntheticDevice::new(16, 8);
    let mut controller = Controller::with_opener(settings, SyntheticOpener::new(device.clone()));
    controller.start(SourceDescriptor::Device(0)).expect("start");
    let (frames, _) = collect(&mut controller, 1);
    assert_eq!(frames, vec![1]);

    // The loop is now asleep until the next pull is due.
    let stopping = Instant::now();
    assert_eq!(controller.stop(), StopOutcome::Stopped);
    assert!(stopping.elapsed() < Duration::from_secs(1));
    assert!(!device.is_busy());
    assert_eq!(controller.stats().frames_published, 1);
}

#[test]
fn unrepresentable_pacing_still_stops_cleanly() {
    let settings = AcquisitionSettings {
        pacing: Duration::MAX,
        ..settings()
    };
    let device = SyntheticDevice::new(16, 8);
    let mut controller = Controller::with_opener(settings, SyntheticOpener::new(device.clone()));
    controller.start(SourceDescriptor::Device(0)).expect("start");
    let (frames, fault) = collect(&mut controller, 1);
    assert_eq!(frames, vec![1]);
    assert!(fault.is_none());

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(controller.state(), LoopState::Running);
    assert_eq!(controller.stop(), StopOutcome::Stopped);
    assert_eq!(controller.state(), LoopState::Stopped);
    assert!(!device.is_busy());
}

#[test]
fn unbounded_waits_on_an_idle_controller_return() {
    let mut controller = Controller::new(settings());
    assert!(controller.next_event(Duration::MAX).is_none());
    assert_eq!(controller.pump_timeout(Duration::MAX), 0);
}
