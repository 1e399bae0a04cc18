//! # VisiFruit Runtime
//!
//! The thin wrapper binary §6 describes as outside the core: it reads
//! two on-disk config files into typed `Calibration`/`MachineConfig`
//! values, selects a HAL backend, constructs the drivers and the
//! orchestrator, and drains detections, sensor triggers, and
//! control-channel updates until shutdown. None of this logic belongs
//! in `visifruit_core` — the core never touches a filesystem path, a
//! CLI flag, or a concrete HAL backend (§1, §6).

mod control_feed;
mod detections;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use visifruit_common::calibration::Calibration;
use visifruit_common::config::ConfigLoader;
use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::types::BeltState;
use visifruit_core::belt::BeltController;
use visifruit_core::config::MachineConfig;
use visifruit_core::diverter::DiverterBank;
use visifruit_core::labeler::{LabelerDriver, LabelerState};
use visifruit_core::scheduler::Orchestrator;
use visifruit_core::sensor::TriggerSensor;
use visifruit_hal::calibration_blob::CalibrationBlob;

/// VisiFruit detection-to-actuation control core
#[derive(Parser, Debug)]
#[command(name = "visifruit")]
#[command(author = "VisiFruit")]
#[command(version)]
#[command(about = "Runs the conveyor-belt labeling/diversion control core against a HAL backend")]
struct Args {
    /// Path to the Calibration TOML file (§3).
    #[arg(short, long, default_value = "/etc/visifruit/calibration.toml")]
    calibration: PathBuf,

    /// Path to the MachineConfig TOML file (§4, per-actuator wiring).
    #[arg(short, long, default_value = "/etc/visifruit/machine.toml")]
    machine_config: PathBuf,

    /// Optional scripted detection feed (newline-delimited JSON
    /// frames), standing in for the camera + vision-model pipeline
    /// that is out of scope for the core (§1).
    #[arg(long)]
    detections: Option<PathBuf>,

    /// Optional control-channel file (§4.J, §6), polled for updates.
    #[arg(long)]
    control_channel: Option<PathBuf>,

    /// Optional calibration blob path for the labeler (§6 "Actuator
    /// config files (persisted)").
    #[arg(long)]
    labeler_calibration_blob: Option<PathBuf>,

    /// Run the labeler's calibration sweep once at startup before
    /// entering the normal dispatch loop, persisting the result to
    /// `--labeler-calibration-blob` if given.
    #[arg(long)]
    calibrate: bool,

    /// Force the simulation HAL backend regardless of
    /// `machine.hal_backend` or runtime probe.
    #[arg(short, long)]
    simulate: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

/// Exit codes of the wrapping binary (§6): 0 normal, 1 init failure, 2
/// fatal runtime error, 3 emergency-stop latched at shutdown.
const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_FATAL_RUNTIME: i32 = 2;
const EXIT_EMERGENCY_LATCHED: i32 = 3;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_tracing(&args);
    let code = run(args).await;
    std::process::exit(code);
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

enum ShutdownReason {
    Normal,
    Fatal,
}

async fn run(args: Args) -> i32 {
    info!(version = env!("CARGO_PKG_VERSION"), "VisiFruit control core starting");

    let calibration = match Calibration::load(&args.calibration) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %args.calibration.display(), error = %e, "failed to load calibration");
            return EXIT_INIT_FAILURE;
        }
    };
    if let Err(e) = calibration.validate() {
        error!(error = %e, "calibration failed validation");
        return EXIT_INIT_FAILURE;
    }

    let mut machine = match MachineConfig::load(&args.machine_config) {
        Ok(m) => m,
        Err(e) => {
            error!(path = %args.machine_config.display(), error = %e, "failed to load machine config");
            return EXIT_INIT_FAILURE;
        }
    };
    if let Err(e) = machine.validate() {
        error!(error = %e, "machine config failed validation");
        return EXIT_INIT_FAILURE;
    }

    if let Some(blob_path) = &args.labeler_calibration_blob {
        match CalibrationBlob::load(blob_path) {
            Ok(Some(blob)) => {
                info!(path = %blob_path.display(), success = blob.success, "loaded labeler calibration blob");
                if let Some(freq) = blob.field_f64("pwm_freq_hz") {
                    info!(pwm_freq_hz = freq, "overriding labeler pwm_freq_hz from calibration blob");
                    machine.labeler.pwm_freq_hz = freq;
                }
            }
            Ok(None) => info!(path = %blob_path.display(), "no prior labeler calibration blob"),
            Err(e) => warn!(path = %blob_path.display(), error = %e, "ignoring unreadable calibration blob"),
        }
    }

    let backend_name = if args.simulate {
        "simulation".to_string()
    } else if machine.hal_backend == "auto" {
        visifruit_hal::probe_backend_name().to_string()
    } else {
        machine.hal_backend.clone()
    };
    info!(backend = %backend_name, "selected HAL backend");

    let registry = visifruit_hal::default_registry();
    let hal: Arc<dyn ActuatorHal> = match registry.create_driver(&backend_name) {
        Ok(driver) => Arc::from(driver),
        Err(e) => {
            error!(backend = %backend_name, error = %e, "failed to construct HAL backend");
            return EXIT_INIT_FAILURE;
        }
    };

    let labeler = Arc::new(LabelerDriver::new(hal.clone(), machine.labeler));
    let diverters = Arc::new(DiverterBank::new(
        hal.clone(),
        &machine.diverters,
        calibration.smooth_steps,
        Duration::from_secs_f64(calibration.diverter_hold_duration_s),
    ));
    let belt = BeltController::new(
        hal.clone(),
        machine.belt,
        Duration::from_secs_f64(calibration.belt_safety_timeout_s),
    );
    let sensor = Arc::new(TriggerSensor::new(hal, machine.sensor));

    if let Err(e) = labeler.init().await {
        error!(error = %e, "labeler init failed");
        return EXIT_INIT_FAILURE;
    }
    if let Err(e) = diverters.init_all() {
        error!(error = %e, "diverter bank init failed");
        return EXIT_INIT_FAILURE;
    }
    if let Err(e) = belt.init() {
        error!(error = %e, "belt init failed");
        return EXIT_INIT_FAILURE;
    }
    let mut sensor_triggers = match sensor.clone().start() {
        Ok(rx) => Some(rx),
        Err(e) => {
            error!(error = %e, "sensor init failed");
            return EXIT_INIT_FAILURE;
        }
    };
    info!("all drivers initialized");

    if args.calibrate {
        match labeler.calibrate().await {
            Ok(()) => {
                info!("labeler calibration sweep completed");
                if let Some(blob_path) = &args.labeler_calibration_blob {
                    let blob = CalibrationBlob::new(true, unix_timestamp())
                        .with_field("pwm_freq_hz", machine.labeler.pwm_freq_hz)
                        .with_field("rest_angle_deg", machine.labeler.rest_angle_deg)
                        .with_field("activation_angle_deg", machine.labeler.activation_angle_deg)
                        .with_field("wear_score", labeler.health().wear_score);
                    if let Err(e) = blob.save(blob_path) {
                        warn!(path = %blob_path.display(), error = %e, "failed to persist calibration blob");
                    }
                }
            }
            Err(e) => warn!(error = %e, "labeler calibration sweep failed, continuing with prior tuning"),
        }
    }

    // Kept so shutdown can read final driver state after the
    // orchestrator takes ownership of its own clones (§4.I).
    let labeler_handle = labeler.clone();

    let orchestrator = Orchestrator::new(labeler, diverters, belt.clone(), calibration);

    let epoch = Instant::now();
    let mut detection_frames = match &args.detections {
        Some(path) => match detections::spawn_from_file(path, epoch) {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load detection feed");
                return EXIT_INIT_FAILURE;
            }
        },
        None => None,
    };
    let mut control_messages = args
        .control_channel
        .map(|path| control_feed::spawn_poller(path, Duration::from_millis(200)));

    let mut dispatch_tick = tokio::time::interval(Duration::from_millis(50));
    let mut reason = ShutdownReason::Normal;

    info!("entering main dispatch loop");
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }

            frame = recv_or_pending(&mut detection_frames) => {
                match frame {
                    Some((raw, frame_time)) => {
                        orchestrator.ingest_frame(raw, frame_time);
                        orchestrator.dispatch_ready(Instant::now()).await;
                    }
                    None => detection_frames = None,
                }
            }

            msg = recv_or_pending(&mut control_messages) => {
                match msg {
                    Some(msg) => match visifruit_core::control_channel::apply(&orchestrator, &belt, msg).await {
                        Ok(true) => info!("control-channel update applied"),
                        Ok(false) => {}
                        Err(e) => {
                            error!(error = %e, "control-channel update failed");
                            reason = ShutdownReason::Fatal;
                            break;
                        }
                    },
                    None => control_messages = None,
                }
            }

            trigger = recv_or_pending(&mut sensor_triggers) => {
                match trigger {
                    Some(at) => info!(?at, "trigger sensor fired"),
                    None => sensor_triggers = None,
                }
            }

            _ = dispatch_tick.tick() => {
                orchestrator.dispatch_ready(Instant::now()).await;
            }
        }
    }

    let latched_before_shutdown =
        labeler_handle.state() == LabelerState::Emergency || belt.snapshot() == BeltState::Emergency;

    let code = match reason {
        ShutdownReason::Fatal => {
            orchestrator.emergency_stop();
            EXIT_FATAL_RUNTIME
        }
        ShutdownReason::Normal if latched_before_shutdown => {
            orchestrator.emergency_stop();
            EXIT_EMERGENCY_LATCHED
        }
        ShutdownReason::Normal => {
            let _ = belt.stop().await;
            EXIT_OK
        }
    };

    let stats = orchestrator.stats();
    info!(
        dispatched = stats.dispatched,
        late = stats.late,
        overlap_dropped = stats.overlap_dropped,
        missed_deadline = stats.missed_deadline,
        expired = stats.expired,
        exit_code = code,
        "shutdown complete"
    );
    code
}

/// Turns `Option<&mut Receiver<T>>` into a future that never resolves
/// when the channel is absent or has closed, so `tokio::select!` can
/// treat an unused or exhausted feed as a branch that simply never
/// fires again rather than busy-polling a closed channel.
async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn unix_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.to_string()
}
