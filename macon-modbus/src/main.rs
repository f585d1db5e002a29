//! Modbus RTU driver for the Macon heat pump.
//!
//! Polls the device into snapshots, writes setpoints, runs the control
//! routine and performs soft resets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use macon_modbus::config::MaconConfig;
use macon_modbus::control::{ControlPlan, Controller};
use macon_modbus::error::WriteError;
use macon_modbus::poller::Poller;
use macon_modbus::registers::RegisterMap;
use macon_modbus::reset::ResetSequencer;
use macon_modbus::sink::{JsonLinesSink, Record, RecordSink, TracingSink, WriteResult};
use macon_modbus::transport::{Bus, Transport};
use macon_modbus::writer::{SetpointWriter, WriteOutcome, read_status};

/// Modbus RTU driver for the Macon geothermal heat pump.
#[derive(Parser, Debug)]
#[command(name = "macon-modbus")]
#[command(about = "Polls and controls a Macon heat pump over Modbus RTU")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "macon.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the device at the configured interval
    Poll {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Write one setpoint, refused while a fault is active
    Write {
        /// Register name, as listed by `registers`
        register: String,
        /// Value in engineering units
        value: f64,
        /// Read the register back after writing
        #[arg(long)]
        verify: bool,
    },
    /// Soft reset the unit (off, settle, on)
    Reset,
    /// Apply the configured setpoints and host control
    Control,
    /// Print the register map
    Registers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::Registers = args.command {
        print_registers(RegisterMap::macon());
        return Ok(());
    }

    // Load configuration
    let config = MaconConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    macon_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting macon-modbus");
    info!("Loaded configuration from {:?}", args.config);

    let mut sink = open_sink(&config)?;

    let transport = Transport::open(&config.serial)
        .with_context(|| format!("Failed to open serial port {}", config.serial.port))?;
    let bus = Arc::new(transport);
    let map = RegisterMap::macon();

    let outcome = match args.command {
        Command::Poll { once } => {
            let poller = Poller::new(Arc::clone(&bus), map, config.poll.max_register_gap);
            if once {
                let record = match poller.poll_once().await {
                    Ok(snapshot) => Record::Snapshot(snapshot),
                    Err(e) => Record::PollFailure {
                        timestamp: chrono::Utc::now(),
                        reason: e.to_string(),
                    },
                };
                sink.emit(&record);
                match record {
                    Record::PollFailure { reason, .. } => Err(anyhow::anyhow!(reason)),
                    _ => Ok(()),
                }
            } else {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received shutdown signal");
                        let _ = tx.send(true);
                    }
                });
                poller.run(config.poll.interval(), &mut sink, rx).await;
                Ok(())
            }
        }
        Command::Write {
            register,
            value,
            verify,
        } => {
            let writer = SetpointWriter::new(Arc::clone(&bus), map);
            let result = guarded_write(&writer, &register, value, verify).await;
            sink.emit(&Record::Write(WriteResult::from_result(
                register.as_str(),
                Some(value),
                &result,
            )));
            result.map(|_| ()).map_err(anyhow::Error::from)
        }
        Command::Reset => {
            let mut sequencer = ResetSequencer::new(Arc::clone(&bus), map, config.control.settle());
            let result = sequencer.run().await;
            sink.emit(&Record::Reset(WriteResult::from_result("reset", None, &result)));
            result.map_err(anyhow::Error::from)
        }
        Command::Control => {
            let controller = Controller::new(Arc::clone(&bus), map);
            match controller.apply(&ControlPlan::from(&config.control)).await {
                Ok(report) => {
                    for write in &report.writes {
                        sink.emit(&Record::Write(write.clone()));
                    }
                    if report.succeeded() {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!(
                            "{} of {} control write(s) failed",
                            report.failures().count(),
                            report.writes.len()
                        ))
                    }
                }
                Err(e) => {
                    sink.emit(&Record::Write(WriteResult::failed("control", None, &e)));
                    Err(e.into())
                }
            }
        }
        Command::Registers => Ok(()),
    };

    bus.close().await;
    let stats = bus.stats();
    info!(
        requests = stats.requests,
        retries = stats.retries,
        failures = stats.failures,
        "Transport closed"
    );

    outcome
}

/// Refuse the write while the device reports a fault.
async fn guarded_write<B: Bus>(
    writer: &SetpointWriter<B>,
    register: &str,
    value: f64,
    verify: bool,
) -> Result<WriteOutcome, WriteError> {
    read_status(writer.bus(), writer.map())
        .await?
        .ensure_no_faults()?;
    writer.write(register, value, verify).await
}

/// Log sink, plus a JSON-lines file when configured.
fn open_sink(config: &MaconConfig) -> Result<Box<dyn RecordSink>> {
    match &config.sink.path {
        Some(path) => {
            let file = JsonLinesSink::open(path)
                .with_context(|| format!("Failed to open record file {:?}", path))?;
            info!("Appending records to {:?}", path);
            Ok(Box::new((TracingSink, file)))
        }
        None => Ok(Box::new(TracingSink)),
    }
}

fn print_registers(map: &RegisterMap) {
    println!(
        "{:<7} {:<28} {:<20} {:>6} {:<5} {:<6}",
        "ADDR", "NAME", "KIND", "SCALE", "UNIT", "ACCESS"
    );
    for desc in map.iter() {
        let address = if desc.count() > 1 {
            format!("{}-{}", desc.address, desc.end_address())
        } else {
            desc.address.to_string()
        };
        println!(
            "{:<7} {:<28} {:<20} {:>6} {:<5} {:<6}",
            address,
            desc.name,
            desc.kind.as_str(),
            desc.scale.to_string(),
            desc.unit.unwrap_or(""),
            if desc.is_writable() { "rw" } else { "ro" }
        );
        for field in desc.bits {
            println!("{:<7} {:<28} bit {}", "", field.name, field.bit);
        }
    }
}
