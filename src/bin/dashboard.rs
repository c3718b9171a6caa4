//! dashboard - headless host for the map panel video feed
//!
//! This binary:
//! 1. Starts acquisition on a capture device or a looping local video file
//! 2. Pumps frame and fault events on the main thread
//! 3. Logs the frame rate (or prints one JSON line per event with `--json`)
//! 4. Stops cleanly on Ctrl-C or after `--seconds`
//!
//! Exits non-zero when the run ended in a fault.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashboard_capture::{
    AcquisitionSettings, Controller, Fault, SourceDescriptor, StopOutcome, SyntheticDevice,
    SyntheticOpener,
};

const RATE_WINDOW_FRAMES: u64 = 50;
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Play a local video file in a loop instead of the capture device.
    #[arg(long, env = "DASHBOARD_PLAY_VIDEO")]
    play_video: Option<PathBuf>,
    /// Capture device index (ignored with --play-video).
    #[arg(long)]
    device: Option<u32>,
    /// Use a synthetic capture device instead of hardware.
    #[arg(long)]
    synthetic: bool,
    /// Make the synthetic device disconnect after this many frames.
    #[arg(long, requires = "synthetic")]
    disconnect_after: Option<u64>,
    /// Stop after this many seconds (runs until Ctrl-C otherwise).
    #[arg(long)]
    seconds: Option<u64>,
    /// Minimum interval between pulls, in milliseconds.
    #[arg(long)]
    pacing_ms: Option<u64>,
    /// Print one JSON line per event instead of log lines.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = AcquisitionSettings::from_env()?;
    if let Some(ms) = args.pacing_ms {
        settings.pacing = Duration::from_millis(ms);
    }
    settings.validate()?;

    let descriptor = SourceDescriptor::from_cli(args.play_video.clone(), args.device);
    let mut controller = if args.synthetic {
        let mut device = SyntheticDevice::new(settings.device.width, settings.device.height);
        if let Some(frames) = args.disconnect_after {
            device = device.disconnect_after(frames);
        }
        Controller::with_opener(settings, SyntheticOpener::new(device))
    } else {
        Controller::new(settings)
    };

    let json_output = args.json;
    let mut received = 0u64;
    let mut window_start = Instant::now();
    controller.subscribe_frames(move |frame| {
        received += 1;
        if json_output {
            println!("{}", json!({ "event": "frame", "frame": frame.info() }));
            return;
        }
        if received % RATE_WINDOW_FRAMES == 0 {
            let elapsed = window_start.elapsed().as_secs_f64();
            let fps = if elapsed > 0.0 {
                RATE_WINDOW_FRAMES as f64 / elapsed
            } else {
                0.0
            };
            log::info!(
                "frame {} ({}x{}x{}), {:.1} fps",
                frame.sequence(),
                frame.width(),
                frame.height(),
                frame.channels(),
                fps
            );
            window_start = Instant::now();
        }
    });

    let last_fault: Arc<Mutex<Option<Fault>>> = Arc::new(Mutex::new(None));
    let fault_slot = last_fault.clone();
    controller.subscribe_faults(move |fault| {
        if json_output {
            println!("{}", json!({ "event": "fault", "fault": fault }));
        } else {
            log::error!("video feed fault: {}", fault);
        }
        *fault_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault.clone());
    });

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("set Ctrl-C handler")?;

    controller.start(descriptor.clone())?;
    log::info!("dashboard running. video source {}", descriptor);

    let deadline = args
        .seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        controller.pump_timeout(PUMP_INTERVAL);
        if last_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            break;
        }
        if shutdown_rx.try_recv().is_ok() {
            log::info!("shutdown signal received, stopping video feed...");
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
    }

    match controller.stop() {
        StopOutcome::Detached => log::warn!("video feed did not stop in time; detached"),
        StopOutcome::Stopped | StopOutcome::NotRunning => {}
    }
    let stats = controller.stats();
    if json_output {
        println!("{}", json!({ "event": "stopped", "stats": stats }));
    } else {
        log::info!(
            "video feed stopped: published={} skipped={} restarts={} dropped={}",
            stats.frames_published,
            stats.frames_skipped,
            stats.restarts,
            stats.frames_dropped
        );
    }

    let fault = last_fault
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match fault {
        Some(fault) => Err(anyhow!("video feed ended with a fault: {}", fault)),
        None => Ok(()),
    }
}
