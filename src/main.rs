//! CAN-to-VSS transformer - main entry point
//!
//! Wires the DBC database, the mapping document, the CAN ingress thread,
//! and the evaluator loop together. The evaluator runs on the main thread
//! with a 10 ms poll cadence plus a 50 ms heartbeat that drives
//! periodic-only signals; SIGINT/SIGTERM request an orderly shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vssdag::{
    can::{CanSignalSource, DbcDatabase},
    mapping::load_mapping_file,
    output::{OutputFormat, SignalWriter},
    processor::SignalProcessor,
    Result, VssDagError,
};

/// Evaluator poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Heartbeat driving periodic-only signals.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

fn print_usage(program: &str) {
    println!("Usage: {} <dbc_file> <mapping_file> <can_interface>", program);
    println!("Example: {} vehicle.dbc mappings.yaml can0", program);
}

fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1], &args[2], &args[3]) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(dbc_file: &str, mapping_file: &str, interface: &str) -> Result<()> {
    tracing::info!("starting CAN to VSS transformer");
    tracing::info!("DBC file: {}", dbc_file);
    tracing::info!("mapping file: {}", mapping_file);
    tracing::info!("CAN interface: {}", interface);

    let database = Arc::new(DbcDatabase::from_file(Path::new(dbc_file))?);
    let mappings = load_mapping_file(Path::new(mapping_file), Some(&database))?;
    let mut processor = SignalProcessor::new(mappings.clone())?;
    let mut source = CanSignalSource::start(interface, database, &mappings)?;

    for signal in processor.required_input_signals() {
        tracing::info!("monitoring input signal {}", signal);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        })
        .map_err(|e| {
            VssDagError::Io(std::io::Error::other(format!(
                "failed to install signal handler: {}",
                e
            )))
        })?;
    }

    let mut writer = SignalWriter::stderr(OutputFormat::Text);
    let mut last_heartbeat = Instant::now();

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();

        let updates = source.poll();
        if !updates.is_empty() {
            for emitted in processor.process_signal_updates(updates) {
                writer.write(&emitted);
            }
        }

        // Heartbeat: run a tick with no updates so periodic signals and
        // pending re-evaluations make progress even on a quiet bus
        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            for emitted in processor.process_signal_updates(Vec::new()) {
                writer.write(&emitted);
            }
            last_heartbeat = Instant::now();
        }

        if let Some(remaining) = POLL_INTERVAL.checked_sub(tick_start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    source.stop();
    tracing::info!("CAN to VSS transformer stopped");
    Ok(())
}
