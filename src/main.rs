//! CLI Entry Point for keysight-smu
//!
//! Thin command-line front end over the library, for bench checks and scripted
//! acquisitions.
//!
//! # Usage
//!
//! ```bash
//! keysight-smu --resource TCPIP0::192.168.1.50::5025::SOCKET identify
//! keysight-smu source --channel 1 --mode voltage --level 1.5 --limit 0.01 --output
//! keysight-smu measure --channel 1 --quantity current
//! keysight-smu sweep-linear --channel 1 --mode voltage --start 0 --stop 5 --points 51 --csv iv.csv
//! keysight-smu --mock sweep-time --channel 2 --mode current --level 1e-3 --points 100 --interval 0.01
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keysight_smu::config::{SmuConfig, TransportKind, DEFAULT_CONFIG_PATH};
use keysight_smu::{logging, Channel, KeysightB2900, LinearSweep, SourceMode, SweepResult, TimeSweep};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "keysight-smu")]
#[command(about = "Control a Keysight B2900-series SMU over SCPI", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// VISA resource, overrides the configuration
    #[arg(long)]
    resource: Option<String>,

    /// Use the simulated instrument
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the *IDN? reply
    Identify,

    /// Reset the instrument (*RST)
    Reset,

    /// Drain and print the instrument error queue
    Errors,

    /// Take a spot measurement
    Measure {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        #[arg(long, value_enum, default_value_t = Quantity::Voltage)]
        quantity: Quantity,
    },

    /// Configure the source of a channel
    Source {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        #[arg(long, value_enum)]
        mode: ModeArg,

        /// Source level in volts or amperes
        #[arg(long, allow_negative_numbers = true)]
        level: f64,

        /// Compliance of the measured quantity
        #[arg(long)]
        limit: Option<f64>,

        /// Source range, set before the limit
        #[arg(long)]
        range: Option<f64>,

        /// Switch the output on afterwards
        #[arg(long)]
        output: bool,
    },

    /// Switch a channel output on or off
    Output {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        #[arg(value_enum)]
        state: SwitchArg,
    },

    /// Constant source level sampled on a timer
    SweepTime {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        #[arg(long, value_enum)]
        mode: ModeArg,

        #[arg(long, allow_negative_numbers = true)]
        level: f64,

        #[arg(long)]
        points: u32,

        /// Sample interval in seconds
        #[arg(long)]
        interval: f64,

        #[arg(long)]
        limit: Option<f64>,

        /// Write the result to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Staircase sweep from start to stop
    SweepLinear {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        #[arg(long, value_enum)]
        mode: ModeArg,

        #[arg(long, allow_negative_numbers = true)]
        start: f64,

        #[arg(long, allow_negative_numbers = true)]
        stop: f64,

        #[arg(long)]
        points: u32,

        #[arg(long)]
        limit: Option<f64>,

        /// Write the result to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Send a raw SCPI line; lines ending in '?' print the reply
    Raw { command: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Quantity {
    Voltage,
    Current,
    Resistance,
    Power,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Voltage,
    Current,
}

impl From<ModeArg> for SourceMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Voltage => SourceMode::Voltage,
            ModeArg::Current => SourceMode::Current,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SwitchArg {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SmuConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(resource) = &cli.resource {
        config.connection.resource = resource.clone();
        if config.connection.transport == TransportKind::Mock {
            config.connection.transport = TransportKind::Auto;
        }
    }
    if cli.mock {
        config.connection.transport = TransportKind::Mock;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let mut smu = KeysightB2900::connect(&config)
        .await
        .with_context(|| format!("Failed to open {}", config.connection.resource))?;

    let outcome = run(&mut smu, cli.command).await;
    let closed = smu.close().await;
    outcome?;
    closed?;
    Ok(())
}

async fn run(smu: &mut KeysightB2900, command: Commands) -> Result<()> {
    match command {
        Commands::Identify => {
            println!("{}", smu.identity());
        }
        Commands::Reset => {
            smu.reset().await?;
            println!("Instrument reset");
        }
        Commands::Errors => {
            let errors = smu.check_errors().await?;
            if errors.is_empty() {
                println!("No errors");
            }
            for error in errors {
                println!("{error}");
            }
        }
        Commands::Measure { channel, quantity } => {
            let mut ch = smu.channel(Channel::try_from(channel)?);
            let (value, unit) = match quantity {
                Quantity::Voltage => (ch.measure_voltage().await?, "V"),
                Quantity::Current => (ch.measure_current().await?, "A"),
                Quantity::Resistance => (ch.measure_resistance().await?, "Ohm"),
                Quantity::Power => (ch.measure_power().await?, "W"),
            };
            println!("{value:E} {unit}");
        }
        Commands::Source {
            channel,
            mode,
            level,
            limit,
            range,
            output,
        } => {
            let mode = SourceMode::from(mode);
            let mut ch = smu.channel(Channel::try_from(channel)?);
            match mode {
                SourceMode::Voltage => ch.set_mode_voltage_source().await?,
                SourceMode::Current => ch.set_mode_current_source().await?,
            }
            if let Some(range) = range {
                match mode {
                    SourceMode::Voltage => ch.set_voltage_range(range).await?,
                    SourceMode::Current => ch.set_current_range(range).await?,
                }
            }
            if let Some(limit) = limit {
                apply_limit(&mut ch, mode, limit).await?;
            }
            match mode {
                SourceMode::Voltage => ch.set_voltage(level).await?,
                SourceMode::Current => ch.set_current(level).await?,
            }
            if output {
                ch.enable_output().await?;
            }
            println!("Channel {channel}: sourcing {level} {}", mode.unit());
        }
        Commands::Output { channel, state } => {
            let mut ch = smu.channel(Channel::try_from(channel)?);
            match state {
                SwitchArg::On => ch.enable_output().await?,
                SwitchArg::Off => ch.disable_output().await?,
            }
        }
        Commands::SweepTime {
            channel,
            mode,
            level,
            points,
            interval,
            limit,
            csv,
        } => {
            let interval = Duration::try_from_secs_f64(interval)
                .with_context(|| format!("invalid interval {interval}"))?;
            let sweep = TimeSweep {
                mode: mode.into(),
                level,
                points,
                interval,
            };
            let mut ch = smu.channel(Channel::try_from(channel)?);
            if let Some(limit) = limit {
                apply_limit(&mut ch, sweep.mode, limit).await?;
            }
            let result = ch.time_domain_sweep(&sweep).await?;
            report(&result, csv)?;
        }
        Commands::SweepLinear {
            channel,
            mode,
            start,
            stop,
            points,
            limit,
            csv,
        } => {
            let sweep = LinearSweep {
                mode: mode.into(),
                start,
                stop,
                points,
            };
            let mut ch = smu.channel(Channel::try_from(channel)?);
            if let Some(limit) = limit {
                apply_limit(&mut ch, sweep.mode, limit).await?;
            }
            let result = ch.linear_sweep(&sweep).await?;
            report(&result, csv)?;
        }
        Commands::Raw { command } => {
            if command.trim_end().ends_with('?') {
                println!("{}", smu.write_query(&command).await?);
            } else {
                smu.write_command(&command).await?;
            }
        }
    }
    Ok(())
}

/// The limit applies to the quantity that is measured, not the one sourced.
async fn apply_limit(
    ch: &mut keysight_smu::SmuChannel<'_>,
    mode: SourceMode,
    limit: f64,
) -> Result<()> {
    match mode.complement() {
        SourceMode::Current => ch.set_current_limit(limit).await?,
        SourceMode::Voltage => ch.set_voltage_limit(limit).await?,
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn report(result: &SweepResult, csv: Option<PathBuf>) -> Result<()> {
    print_points(result);
    if let Some(path) = csv {
        result
            .write_csv(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {} points to {}", result.len(), path.display());
    }
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn report(result: &SweepResult, csv: Option<PathBuf>) -> Result<()> {
    print_points(result);
    if csv.is_some() {
        anyhow::bail!("CSV export requires the 'storage_csv' feature");
    }
    Ok(())
}

fn print_points(result: &SweepResult) {
    println!("# channel {} started {}", result.channel, result.started_at.to_rfc3339());
    println!("index,time,voltage,current");
    for point in result.points() {
        println!(
            "{},{:E},{:E},{:E}",
            point.index, point.time, point.voltage, point.current
        );
    }
}
