//! `reactir` command-line front end.
//!
//! ```bash
//! reactir --config config/experiment.toml check-config
//! reactir run --simulate --unattended
//! reactir pump transfer 5 12 2.0 --speed 0.25
//! reactir interval set 30
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reactir_daq::config::{ExperimentConfig, DEFAULT_CONFIG_PATH};
use reactir_daq::experiment::{AlwaysYes, ConsolePrompt, ExperimentOrchestrator, OperatorPrompt};
use reactir_daq::hardware::{MockStirrer, MockSyringeDriver, StirrerDriver, SyringeDriver};
use reactir_daq::instrument::spectrum::load_wavenumbers;
use reactir_daq::instrument::{NodeTransport, SimulatedSpectrometer, SpectrometerSession};
use reactir_daq::pump::{SyringePump, TransferRequest};
use reactir_daq::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "reactir", version, about = "ReactIR pump and spectrometer control")]
struct Cli {
    /// Configuration file; `REACTIR_*` environment variables override it
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated pump and spectrometer instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full monitoring experiment
    Run {
        /// Answer every operator question with Yes
        #[arg(long)]
        unattended: bool,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
    /// Manual pump operations
    Pump {
        #[command(subcommand)]
        action: PumpAction,
    },
    /// Read or set the spectrometer sampling interval
    Interval {
        #[command(subcommand)]
        action: IntervalAction,
    },
}

#[derive(Subcommand)]
enum PumpAction {
    /// Turn the valve to a port
    Switch { port: u8 },
    /// Drive the plunger so the syringe holds VOLUME mL
    Move {
        volume: f64,
        #[arg(long, default_value_t = 0.1)]
        speed: f64,
    },
    /// Move VOLUME mL from one port to another
    Transfer {
        from: u8,
        to: u8,
        volume: f64,
        #[arg(long, default_value_t = 0.1)]
        speed: f64,
    },
}

#[derive(Subcommand)]
enum IntervalAction {
    /// Print the interval the instrument is using
    Get,
    /// Set the interval in seconds (15-3600)
    Set { seconds: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ExperimentConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    tracing_setup::init(&config.application.log_level, config.application.json_logs)?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            info!(path = %cli.config.display(), "Configuration is valid");
            Ok(())
        }
        Command::Run { unattended } => run_experiment(config, cli.simulate, unattended).await,
        Command::Pump { action } => pump_action(&config, cli.simulate, action).await,
        Command::Interval { action } => interval_action(&config, cli.simulate, action).await,
    }
}

async fn run_experiment(config: ExperimentConfig, simulate: bool, unattended: bool) -> Result<()> {
    let pump = Arc::new(open_pump(&config, simulate).await?);
    let session = Arc::new(open_session(&config, simulate)?);
    let prompt: Box<dyn OperatorPrompt> = if unattended {
        Box::new(AlwaysYes)
    } else {
        Box::new(ConsolePrompt)
    };

    let stirrer = open_stirrer(&config, simulate)?;
    let mut orchestrator = ExperimentOrchestrator::new(config, pump, session, prompt);
    if let Some(stirrer) = stirrer {
        orchestrator = orchestrator.with_stirrer(stirrer);
    }
    let summary = orchestrator.run().await.context("experiment run failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn pump_action(config: &ExperimentConfig, simulate: bool, action: PumpAction) -> Result<()> {
    let pump = open_pump(config, simulate).await?;
    let result = match action {
        PumpAction::Switch { port } => pump.switch(port).await,
        PumpAction::Move { volume, speed } => pump.move_to(volume, speed).await,
        PumpAction::Transfer {
            from,
            to,
            volume,
            speed,
        } => pump
            .transfer(&TransferRequest::new(from, to, volume, speed))
            .await
            .map(|report| {
                println!(
                    "Moved {:.3} mL in {} strokes",
                    report.moved_ml(),
                    report.cycle_volumes_ml.len()
                );
            }),
    };
    let shutdown = pump.shutdown().await;
    result.context("pump command failed")?;
    shutdown.context("pump shutdown failed")?;
    Ok(())
}

async fn interval_action(
    config: &ExperimentConfig,
    simulate: bool,
    action: IntervalAction,
) -> Result<()> {
    let session = open_session(config, simulate)?;
    let result = match action {
        IntervalAction::Get => session.get_current_sampling_interval().await.map(|seconds| {
            println!("{} s", seconds);
        }),
        IntervalAction::Set { seconds } => session.set_sampling_interval(seconds).await,
    };
    let shutdown = session.shutdown().await;
    result.context("sampling interval command failed")?;
    shutdown.context("spectrometer shutdown failed")?;
    Ok(())
}

async fn open_pump(config: &ExperimentConfig, simulate: bool) -> Result<SyringePump> {
    let driver: Box<dyn SyringeDriver> = if simulate {
        Box::new(MockSyringeDriver::realtime(config.pump.resolution))
    } else {
        open_serial_pump(config).await?
    };
    Ok(SyringePump::new(
        driver,
        config.pump.valve_count,
        config.pump.syringe_capacity_ml,
        config.pump.resolution,
    ))
}

fn open_stirrer(config: &ExperimentConfig, simulate: bool) -> Result<Option<Box<dyn StirrerDriver>>> {
    if !config.stirrer.enabled {
        return Ok(None);
    }
    if simulate {
        return Ok(Some(Box::new(MockStirrer::new())));
    }
    open_serial_stirrer(config).map(Some)
}

#[cfg(feature = "instrument_serial")]
fn open_serial_stirrer(config: &ExperimentConfig) -> Result<Box<dyn StirrerDriver>> {
    let stirrer = reactir_daq::hardware::IkaStirrer::open(&config.stirrer)
        .with_context(|| format!("opening stirrer on {}", config.stirrer.serial_port))?;
    Ok(Box::new(stirrer))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial_stirrer(_config: &ExperimentConfig) -> Result<Box<dyn StirrerDriver>> {
    Err(reactir_daq::error::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

#[cfg(feature = "instrument_serial")]
async fn open_serial_pump(config: &ExperimentConfig) -> Result<Box<dyn SyringeDriver>> {
    use reactir_daq::hardware::DtPump;

    let pump = DtPump::open(&config.pump)?;
    pump.initialize(config.ports.waste, config.pump.resolution)
        .await
        .with_context(|| format!("initialising pump on {}", config.pump.serial_port))?;
    Ok(Box::new(pump))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_serial_pump(_config: &ExperimentConfig) -> Result<Box<dyn SyringeDriver>> {
    Err(reactir_daq::error::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

fn open_session(config: &ExperimentConfig, simulate: bool) -> Result<SpectrometerSession> {
    let axis = load_wavenumbers(&config.instrument.wavenumber_table).with_context(|| {
        format!(
            "loading wavenumbers from {}",
            config.instrument.wavenumber_table.display()
        )
    })?;
    let transport: Box<dyn NodeTransport> = if simulate {
        Box::new(SimulatedSpectrometer::new(
            config.instrument.nodes.clone(),
            axis.len(),
        ))
    } else {
        opcua_transport(config)?
    };
    Ok(SpectrometerSession::new(
        transport,
        config.instrument.nodes.clone(),
        axis,
        config.instrument.queue_capacity,
        Duration::from_millis(config.instrument.publishing_interval_ms),
    ))
}

#[cfg(feature = "opcua")]
fn opcua_transport(config: &ExperimentConfig) -> Result<Box<dyn NodeTransport>> {
    Ok(Box::new(reactir_daq::instrument::OpcUaTransport::new(
        config.instrument.endpoint.clone(),
    )))
}

#[cfg(not(feature = "opcua"))]
fn opcua_transport(_config: &ExperimentConfig) -> Result<Box<dyn NodeTransport>> {
    Err(reactir_daq::error::DaqError::FeatureNotEnabled("opcua".to_string()).into())
}
