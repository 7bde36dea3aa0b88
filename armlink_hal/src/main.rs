//! # Armlink
//!
//! Command-line driver for a six-servo serial-bus arm.
//!
//! # Usage
//!
//! ```bash
//! # Ping every servo on the configured port
//! armlink --config armlink.toml ping
//!
//! # Joint angles against the simulated arm
//! armlink -s positions
//!
//! # Interactive calibration, verbose logging
//! armlink --port /dev/ttyACM0 -v calibrate
//!
//! # Raw JSON command
//! armlink -s request '{"op":"read_raw_positions","params":{"servo_ids":[1,2]}}'
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use armlink_common::calibration::file;
use armlink_common::config::{ArmConfig, LogLevel};
use armlink_hal::dispatch::handle_arm_json;
use armlink_hal::links::{LinkOpener, SerialPortOpener, SimulatedArm};
use armlink_hal::workflow::CalibrationWorkflow;
use armlink_hal::{CalibrationSource, ControllerHandle, ControllerRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Armlink - serial-bus arm driver
#[derive(Parser, Debug)]
#[command(name = "armlink")]
#[command(version)]
#[command(about = "Driver and calibration tool for a six-servo serial-bus arm")]
#[command(long_about = None)]
struct Args {
    /// Path to configuration file (armlink.toml). Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overriding the configuration file
    #[arg(short, long)]
    port: Option<String>,

    /// Drive the in-process simulated arm instead of a serial port
    #[arg(short = 's', long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping every servo
    Ping,
    /// Print joint angles in radians
    Positions,
    /// Switch holding torque
    Torque {
        /// New torque state
        state: TorqueState,
    },
    /// Walk through homing and range recording
    Calibrate,
    /// Execute one JSON arm request and print the response
    Request {
        /// Request, e.g. '{"op":"ping"}'
        json: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TorqueState {
    On,
    Off,
}

fn main() {
    if let Err(e) = run() {
        error!("armlink failed: {}", e);
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ArmConfig::load_validated(path)?,
        None => ArmConfig::default(),
    };

    setup_tracing(&args, config.shared.log_level);

    info!("armlink v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(port) = &args.port {
        config.bus.port = port.clone();
    }

    let opener: Arc<dyn LinkOpener> = if args.simulate {
        info!("Simulation mode enabled");
        Arc::new(SimulatedArm::new().opener())
    } else {
        Arc::new(SerialPortOpener)
    };
    let registry = Arc::new(ControllerRegistry::new(opener, config.timing));

    let source = match &config.calibration.file {
        Some(path) => CalibrationSource::File(file::load_or_default(Some(path.as_path()))),
        None => CalibrationSource::Hardware,
    };
    let handle = registry.acquire(&config.bus, source)?;

    let result: Result<(), Box<dyn std::error::Error>> = match args.command {
        Command::Ping => handle
            .ping()
            .map(|()| println!("all servos answered"))
            .map_err(Into::into),
        Command::Positions => print_positions(&handle),
        Command::Torque { state } => handle
            .set_torque_enable(matches!(state, TorqueState::On))
            .map_err(Into::into),
        Command::Calibrate => calibrate(&registry, &handle, &config),
        Command::Request { json } => {
            let response = handle_arm_json(&handle, &json);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    };

    if let Err(e) = registry.release(handle) {
        warn!("Release failed: {}", e);
    }
    info!("armlink shutdown complete");
    result
}

fn print_positions(handle: &ControllerHandle) -> Result<(), Box<dyn std::error::Error>> {
    let angles = handle.get_joint_positions_for_servos(handle.servo_ids())?;
    for (id, angle) in handle.servo_ids().iter().zip(angles) {
        let name = armlink_common::consts::joint_name(*id).unwrap_or("?");
        println!("{id} {name:<14} {angle:>8.4} rad");
    }
    Ok(())
}

fn calibrate(
    registry: &Arc<ControllerRegistry>,
    handle: &ControllerHandle,
    config: &ArmConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = Arc::new(CalibrationWorkflow::new(
        Arc::clone(handle.controller()),
        config.workflow.clone(),
    ));

    let on_signal = Arc::clone(&workflow);
    let shutdown = Arc::clone(registry);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        on_signal.abort();
        shutdown.close_all();
        process::exit(130);
    })?;

    workflow.start()?;
    prompt("Move the arm to the middle of its range, then press Enter")?;
    workflow.set_homing()?;
    workflow.start_range_recording()?;
    prompt("Move every joint through its full range, then press Enter")?;
    workflow.stop_range_recording()?;
    let calibration = workflow.save_calibration()?;

    for motor in calibration.iter() {
        println!(
            "{:<14} offset {:>5}  range [{:>4}, {:>4}]",
            motor.joint_name().unwrap_or("?"),
            motor.homing_offset,
            motor.range_min,
            motor.range_max
        );
    }
    println!("saved to {}", workflow.output().display());
    Ok(())
}

fn prompt(message: &str) -> io::Result<()> {
    print!("{message}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

/// Default filter directive: `-v` wins over the configured level.
fn log_directive(args: &Args, configured: LogLevel) -> &'static str {
    if args.verbose {
        LogLevel::Debug.as_filter()
    } else {
        configured.as_filter()
    }
}

/// Setup tracing subscriber based on CLI arguments and configuration.
/// `RUST_LOG` overrides both.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directive(args, configured)));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used_without_verbose() {
        let args = Args::parse_from(["armlink", "-s", "ping"]);
        assert_eq!(log_directive(&args, LogLevel::Warn), "warn");
        assert_eq!(log_directive(&args, LogLevel::Trace), "trace");
    }

    #[test]
    fn test_verbose_overrides_configured_level() {
        let args = Args::parse_from(["armlink", "-v", "positions"]);
        assert_eq!(log_directive(&args, LogLevel::Error), "debug");
    }
}
