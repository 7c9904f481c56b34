//! CLI entry point for daq-marshal
//!
//! Provides:
//! - `demo`: drives simulated devices through the task runner from a console
//!   "UI" run loop, showing busy refusals, cancellation and torn-down receivers
//! - `check-config`: loads and validates the configuration and prints it
//!
//! # Usage
//!
//! ```bash
//! daq-marshal demo --config config/console.toml
//! DAQ_MARSHAL_WORKERS__COUNT=2 daq-marshal check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_marshal::config::{ConsoleConfig, DEFAULT_CONFIG_PATH};
use daq_marshal::device::SimulatedDevice;
use daq_marshal::device_lock::{DeviceId, DeviceLockRegistry};
use daq_marshal::events::{drain, EventBus};
use daq_marshal::marshal::RunLoop;
use daq_marshal::register_batch::{
    ActionTarget, BatchSummary, CommandKind, RegisterBatch, RegisterRow, RowPosition, RowUpdate,
};
use daq_marshal::task::{ResultSink, TaskReport, TaskRunner};
use daq_marshal::tracing_setup::{self, OutputFormat, TracingConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "daq-marshal")]
#[command(about = "Cross-thread call marshaling and device locking for instrument consoles", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulated-device walkthrough
    Demo {
        /// Per-access device latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConsoleConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let level = tracing_setup::parse_log_level(&config.application.log_level)?;
    tracing_setup::init(TracingConfig::new(level).with_format(cli.log_format))?;

    match cli.command {
        Commands::Demo { latency_ms } => run_demo(&config, Duration::from_millis(latency_ms)),
        Commands::CheckConfig => check_config(&config),
    }
}

fn check_config(config: &ConsoleConfig) -> Result<()> {
    println!("Configuration OK");
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn run_demo(config: &ConsoleConfig, latency: Duration) -> Result<()> {
    info!(app = %config.application.name, "starting demo");

    let bus = Arc::new(EventBus::new(config.events.capacity));
    let mut events = bus.subscribe();
    let locks = DeviceLockRegistry::with_events(bus.clone());
    let mut runner = TaskRunner::from_config(config, locks.clone(), bus.clone())?;

    let devices: HashMap<DeviceId, SimulatedDevice> = config
        .devices
        .iter()
        .map(|def| {
            let dev = SimulatedDevice::new(def.id.as_str()).with_latency(latency);
            (dev.id().clone(), dev)
        })
        .collect();
    let register_dev = devices
        .get(&DeviceId::new("dev0"))
        .or_else(|| devices.values().next())
        .cloned()
        .context("no devices configured")?;

    let (mut ui, ui_handle) = RunLoop::new("ui", bus.clone());
    let view = ui_handle.register_target("register map view");
    let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let batch_sink = |name: &'static str| {
        let log = Arc::clone(&reports);
        ResultSink::new(&ui_handle, view.guard(), move |report: TaskReport<BatchSummary>| {
            log.lock().push(format!("{name}: {report:?}"));
            Ok(())
        })
        .with_progress(|update: RowUpdate| {
            println!("  row {} -> {:?}", update.position, update.row.data);
            Ok(())
        })
    };

    // 1. A long write batch holds the device; a second request is refused.
    let mut write = RegisterBatch::new();
    for row in 0..8 {
        let reg = RegisterRow::register(format!("reg{row}"), 0x10 + row * 4, Some(row * 11));
        let position = RowPosition { page: 0, row: row as usize };
        write.push(CommandKind::Write, ActionTarget::Page, position, &reg)?;
    }
    let task_a = write.submit(&runner, register_dev.clone(), batch_sink("A"));

    let mut read = RegisterBatch::new();
    for row in 0..8 {
        let reg = RegisterRow::register(format!("reg{row}"), 0x10 + row * 4, None);
        let position = RowPosition { page: 0, row: row as usize };
        read.push(CommandKind::Read, ActionTarget::Page, position, &reg)?;
    }
    let task_b = read.clone().submit(&runner, register_dev.clone(), batch_sink("B"));
    println!("B while A runs: {}", task_b.state());

    ui.run_until(Duration::from_secs(10), || task_a.is_finished());
    println!("A finished: {}", task_a.state());

    let retry = read.submit(&runner, register_dev.clone(), batch_sink("B retry"));
    ui.run_until(Duration::from_secs(10), || retry.is_finished());
    ui.run_pending();
    println!("B retried: {}", retry.state());

    // 2. A capture loop cancelled from the UI side.
    let capture = runner.submit_task(
        register_dev.id().clone(),
        "stream export",
        |ctx| -> anyhow::Result<usize> {
            let mut frames = 0;
            loop {
                if let Err(err) = ctx.checkpoint() {
                    info!(frames, "capture stopped");
                    return Err(err.into());
                }
                std::thread::sleep(Duration::from_millis(5));
                frames += 1;
            }
        },
        ResultSink::new(&ui_handle, view.guard(), |report: TaskReport<usize>| {
            println!("capture: {report:?}");
            Ok(())
        }),
    );
    ui.run_until(Duration::from_millis(50), || false);
    capture.cancel();
    ui.run_until(Duration::from_secs(5), || capture.is_finished());
    ui.run_pending();
    println!("capture finished: {}", capture.state());

    // 3. The receiving dialog closes before the result arrives.
    let dialog = ui_handle.register_target("register config dialog");
    let orphan = runner.submit_task(
        register_dev.id().clone(),
        "register read",
        |_| Ok(42_u32),
        ResultSink::new(&ui_handle, dialog.guard(), |report: TaskReport<u32>| {
            println!("dialog: {report:?}");
            Ok(())
        }),
    );
    drop(dialog);
    ui.run_until(Duration::from_secs(5), || orphan.is_finished());
    ui.run_pending();
    println!("orphaned task finished: {}", orphan.state());

    for line in reports.lock().iter() {
        println!("{line}");
    }
    for event in drain(&mut events) {
        println!("event: {}", event.user_message());
    }

    runner.shutdown();
    drop(view);
    info!(held = locks.held_count(), "demo finished");
    Ok(())
}
