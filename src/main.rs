use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use adc_streamer::{
    loopback::{loopback, CoprocessorEnd, HostEnd},
    sim::{InstantClock, SimAdc},
    CaptureController, CaptureMonitor, ControllerStats, FrameReadout, HostError, HostOptions,
    HostSession, ReadinessWait, SendFailurePolicy, StartConfig,
};
use anyhow::{anyhow, Context};
use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Datelike, Timelike, Utc};
use clap::Parser;
use tracing::{debug, info, warn};

mod args;

/// Filesystem friendly UTC timestamp
fn file_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}{:02}{:02}T{:02}{:02}{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

fn open_output(dir: &Path) -> anyhow::Result<BufWriter<File>> {
    let path = dir.join(format!("adc-{}.f32", file_timestamp(&Utc::now())));
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    info!(path = %path.display(), "Writing voltages");
    Ok(BufWriter::new(file))
}

fn run_coprocessor(
    adc: SimAdc,
    transport: CoprocessorEnd,
    policy: SendFailurePolicy,
    running: Arc<AtomicBool>,
) -> anyhow::Result<ControllerStats> {
    let mut controller =
        CaptureController::connect(adc, transport, InstantClock::new(), ReadinessWait::Unbounded)?
            .with_policy(policy);
    debug!("Coprocessor loop running");
    controller.run(|| running.load(Ordering::Relaxed));
    let stats = *controller.stats();
    controller.shutdown(ReadinessWait::Attempts(1000))?;
    Ok(stats)
}

fn run_host(
    host: HostEnd,
    config: StartConfig,
    args: &args::Args,
    running: &AtomicBool,
) -> anyhow::Result<CaptureMonitor> {
    let mut output = match &args.output_dir {
        Some(dir) => Some(open_output(dir)?),
        None => None,
    };
    let options = HostOptions {
        read_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let mut session = HostSession::start(host, config, options)?;
    let mut monitor = CaptureMonitor::new();
    let mut readout = FrameReadout::default();

    while running.load(Ordering::Relaxed) && (args.frames == 0 || monitor.frames() < args.frames) {
        match session.read_frame_into(&mut readout) {
            Ok(()) => {}
            Err(HostError::Timeout) => {
                warn!("No frame within a second, still waiting");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        monitor.observe(&readout);
        if let Some(out) = output.as_mut() {
            out.write_all(readout.volts.as_byte_slice())?;
        }
    }

    session.stop()?;
    if let Some(mut out) = output {
        out.flush()?;
    }
    Ok(monitor)
}

fn main() -> anyhow::Result<()> {
    let args = args::Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(args.verbose.log_level_filter()))
        .init();

    let config = args.start_config();
    config.validate()?;
    info!(channels = ?config.channels(), records = config.records_per_frame(), "Starting capture");

    // Ctrl+C ends the host loop, the coprocessor is stopped afterwards
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::Relaxed))?;

    let (coprocessor, host) = loopback(args.vring_depth);
    let firmware_running = Arc::new(AtomicBool::new(true));
    let firmware = {
        let adc = SimAdc::new(args.waveform);
        let policy = args.policy();
        let running = firmware_running.clone();
        thread::Builder::new()
            .name("coprocessor".to_string())
            .spawn(move || run_coprocessor(adc, coprocessor, policy, running))?
    };

    let monitor = run_host(host, config, &args, &running);

    firmware_running.store(false, Ordering::Relaxed);
    let stats = firmware
        .join()
        .map_err(|_| anyhow!("Coprocessor thread panicked"))??;

    let monitor = monitor?;
    monitor.report();
    info!(
        sessions = stats.sessions,
        frames = stats.frames_sent,
        dropped = stats.dropped_sets,
        send_failures = stats.send_failures,
        surplus_acks = stats.surplus_acks,
        "Coprocessor summary"
    );
    Ok(())
}
