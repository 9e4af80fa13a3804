//! # HVSC slow control
//!
//! Headless supervisor for a multi-device high-voltage rig:
//! - spawns one command serializer and one poller per device
//! - runs the periodic live safety-check loop
//! - optionally records drift-threshold channel history
//! - optionally arms the trip-recovery supervisor with a ramp plan
//!   from the config file
//!
//! Only the simulation driver is linked into this build; real device
//! drivers plug in through the `hvsc_hal` facade traits.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use hvsc_common::cache::ReadingsCache;
use hvsc_common::config::{ChecksConfig, SupervisorConfig};
use hvsc_core::alert::{AlertSink, TracingAlert};
use hvsc_core::executor::spawn_poller;
use hvsc_core::history::{spawn_history_loop, HistoryLogger, HistoryThresholds};
use hvsc_core::ramp::{RampController, RampPlan};
use hvsc_core::recovery::TripRecoverySupervisor;
use hvsc_core::rig::{spawn_check_loop, Rig, MULTIDEVICE_GROUP};
use hvsc_hal::sim::SimDevice;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// HVSC — high-voltage slow control core
#[derive(Parser, Debug)]
#[command(name = "hvsc")]
#[command(version)]
#[command(about = "Slow-control supervisor for multi-device high-voltage rigs")]
struct Args {
    /// Run against simulated devices.
    #[arg(long)]
    sim: bool,

    /// Path to the checks file (named safety conditions).
    #[arg(long, default_value = "config/checks.toml")]
    checks: PathBuf,

    /// Path to the supervisor configuration TOML. A missing file
    /// falls back to defaults.
    #[arg(long, default_value = "config/hvsc.toml")]
    config: PathBuf,

    /// Device poll interval in seconds.
    #[arg(long, default_value_t = 1.0)]
    poll_interval: f64,

    /// Live check loop interval in seconds.
    #[arg(long, default_value_t = 2.0)]
    check_interval: f64,

    /// Directory for channel history files (omit to disable).
    #[arg(long)]
    history_dir: Option<PathBuf>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("HVSC v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("HVSC shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if !args.sim {
        return Err("no hardware driver is linked into this build; run with --sim".into());
    }

    let checks = ChecksConfig::load(&args.checks)?;
    let config = match SupervisorConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Using default supervisor config: {e}");
            SupervisorConfig::default()
        }
    };

    let cache = Arc::new(ReadingsCache::new());
    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlert);

    // Simulated rig: one multichannel mainframe plus a single-channel
    // cathode supply.
    let mut rig = Rig::new(Arc::clone(&cache), Arc::clone(&alerts));
    rig.register_device(
        Box::new(SimDevice::new(
            "caen",
            &["mesh left", "mesh right", "gem top", "gem bottom"],
            100.0,
        )),
        checks.group("caen"),
    );
    rig.register_device(
        Box::new(SimDevice::new("spellman", &["cathode"], 200.0)),
        checks.group("spellman"),
    );
    rig.set_multidevice_checks(checks.group(MULTIDEVICE_GROUP));
    let rig = Arc::new(rig);
    info!(
        "Rig ready: devices={:?}, channels={:?}",
        rig.device_names(),
        rig.channel_keys()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let mut workers = Vec::new();
    for executor in rig.executors() {
        workers.push(spawn_poller(
            executor,
            Duration::from_secs_f64(args.poll_interval),
            Arc::clone(&shutdown),
        ));
    }
    workers.push(spawn_check_loop(
        Arc::clone(&rig),
        Duration::from_secs_f64(args.check_interval),
        Arc::clone(&shutdown),
    ));
    if let Some(dir) = &args.history_dir {
        std::fs::create_dir_all(dir)?;
        workers.push(spawn_history_loop(
            HistoryLogger::new(dir, HistoryThresholds::default()),
            Arc::clone(&cache),
            Duration::from_secs_f64(args.poll_interval),
            Arc::clone(&shutdown),
        ));
        info!("History logging to {}", dir.display());
    }

    // Arm trip recovery when the config carries a plan.
    let supervisor = if config.plan.channel.is_empty() {
        None
    } else {
        let plan = RampPlan::from_config(&config.plan.channel)?;
        let ramp = RampController::new(Arc::clone(&rig), config.ramp);
        let sup = Arc::new(TripRecoverySupervisor::new(
            Arc::clone(&rig),
            ramp,
            config.recovery,
        ));
        let handle = {
            let sup = Arc::clone(&sup);
            thread::Builder::new()
                .name("hvsc-recovery".into())
                .spawn(move || {
                    let outcome = sup.run(&plan);
                    info!("Trip recovery ended: {outcome:?}");
                })?
        };
        info!(
            "Trip recovery armed with {} plan channel(s)",
            config.plan.channel.len()
        );
        Some((sup, handle))
    };

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    if let Some((sup, handle)) = supervisor {
        sup.disarm();
        let _ = handle.join();
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
