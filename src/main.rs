//! CLI entry point for the CryoCon 22C control core.
//!
//! Provides a command-line interface for:
//! - Inspecting the instrument (status, temperatures, ranges)
//! - Changing set points and heater ranges with read-back verification
//! - Engaging and stopping control
//! - Running one-shot auto-range passes
//!
//! Every command opens a session (connect, discover topology, lock the
//! keypad), runs, then releases the keypad and closes the port - even when
//! the command itself fails.
//!
//! # Usage
//!
//! Read channel a:
//! ```bash
//! cryocon --port /dev/ttyUSB0 temp a
//! ```
//!
//! Set and verify a set point:
//! ```bash
//! cryocon --config cryocon.toml set-temp "cold finger" 77.35
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use cryocon_22c::{
    Cryocon22c, CryoconConfig, HeaterRange, RangeAdjustment, SerialTransport, Thresholds,
};
use serialport::SerialPortType;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cryocon")]
#[command(about = "CryoCon 22C temperature controller control core", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "cryocon.toml")]
    config: PathBuf,

    /// Serial port, overriding the config file
    #[arg(long)]
    port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show topology, live readings, and control state
    Status,

    /// Read one channel's temperature
    Temp {
        /// Channel letter, canonical token (cha), or user-assigned name
        channel: String,
    },

    /// Change a set point, verified by read-back
    SetTemp {
        /// Channel letter, canonical token, or user-assigned name
        channel: String,

        /// Requested set point, in the channel's unit
        value: f64,
    },

    /// Read a loop's heater range and output power
    Range {
        /// Loop slot number (1-4)
        loop_id: u8,
    },

    /// Change a loop's heater range, verified by read-back
    SetRange {
        /// Loop slot number (1-4)
        loop_id: u8,

        /// Range token: low, mid, or hi
        range: String,
    },

    /// Engage all control loops
    Enable,

    /// Stop all control loops
    Disable,

    /// Run one auto-range pass (at most one range step per loop)
    AutoRange {
        /// Channels to consider, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,

        /// Step-down threshold as an output fraction, overriding the config
        #[arg(long)]
        low: Option<f64>,

        /// Step-up threshold as an output fraction, overriding the config
        #[arg(long)]
        high: Option<f64>,
    },

    /// List serial ports on this machine
    ListPorts,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with RUST_LOG env var
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::ListPorts) {
        return list_ports();
    }

    let config = load_config(&cli)?;
    let controller = Cryocon22c::from_config(&config);
    controller.connect().await?;

    // Run the command, then always release the keypad and close the port.
    let outcome = run_command(&controller, &config, cli.command).await;
    let closed = controller.disconnect().await;

    outcome?;
    closed?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<CryoconConfig> {
    let mut config = if cli.config.exists() {
        CryoconConfig::from_file(&cli.config)?
    } else if let Some(port) = &cli.port {
        CryoconConfig::for_port(port.clone())
    } else {
        bail!(
            "config file '{}' not found; pass --config or --port",
            cli.config.display()
        );
    };

    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_command(
    controller: &Cryocon22c<SerialTransport>,
    config: &CryoconConfig,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Status => show_status(controller, config).await,

        Commands::Temp { channel } => {
            let id = controller.resolve_name(&channel).await?;
            let info = controller.channel_info(id).await?;
            let value = controller.temperature(id).await?;
            println!("{value:.3} {}", info.unit);
            Ok(())
        }

        Commands::SetTemp { channel, value } => {
            let id = controller.resolve_name(&channel).await?;
            controller.set_temperature(id, value).await?;
            println!("set point {value:.3} confirmed on channel {id}");
            Ok(())
        }

        Commands::Range { loop_id } => {
            let range = controller.range(loop_id).await?;
            let output = controller.output_fraction(loop_id).await?;
            println!(
                "loop {loop_id}: range {range}, output {:.1}%",
                output * 100.0
            );
            Ok(())
        }

        Commands::SetRange { loop_id, range } => {
            let range: HeaterRange = range.parse()?;
            controller.set_range(loop_id, range).await?;
            println!("loop {loop_id} range {range} confirmed");
            Ok(())
        }

        Commands::Enable => {
            controller.enable().await?;
            println!("control engaged");
            Ok(())
        }

        Commands::Disable => {
            controller.disable().await?;
            println!("control stopped");
            Ok(())
        }

        Commands::AutoRange {
            channels,
            low,
            high,
        } => run_auto_range(controller, config, &channels, low, high).await,

        // Handled before a session is opened.
        Commands::ListPorts => Ok(()),
    }
}

async fn show_status(
    controller: &Cryocon22c<SerialTransport>,
    config: &CryoconConfig,
) -> Result<()> {
    println!("CryoCon 22C on {}", config.port);
    println!(
        "Control: {}",
        on_off(controller.enabled().await?)
    );
    println!("Keypad lock: {}", on_off(controller.locked().await?));
    println!();

    for channel in controller.channels().await? {
        match controller.temperature(channel.id).await {
            Ok(value) => println!(
                "channel {} ({}): {value:.3} {}",
                channel.id, channel.name, channel.unit
            ),
            // A faulted sensor should not hide the rest of the status.
            Err(e) => println!("channel {} ({}): read failed: {e}", channel.id, channel.name),
        }

        let set_point = controller.set_point(channel.id).await?;
        let max = controller.max_setpoint(channel.id).await?;
        let range = controller.range(channel.loop_id).await?;
        let output = controller.output_fraction(channel.loop_id).await?;
        println!(
            "  loop {}: set point {set_point:.3} {} (max {max:.3}), range {range}, output {:.1}%",
            channel.loop_id,
            channel.unit,
            output * 100.0
        );
    }
    Ok(())
}

async fn run_auto_range(
    controller: &Cryocon22c<SerialTransport>,
    config: &CryoconConfig,
    channels: &[String],
    low: Option<f64>,
    high: Option<f64>,
) -> Result<()> {
    let thresholds = Thresholds::new(
        low.unwrap_or(config.auto_range.low_threshold),
        high.unwrap_or(config.auto_range.high_threshold),
    )?;

    let mut ids = Vec::new();
    for name in channels {
        ids.push(controller.resolve_name(name).await?);
    }
    let selection = if ids.is_empty() {
        None
    } else {
        Some(ids.as_slice())
    };

    let outcomes = controller.auto_adjust_range(thresholds, selection).await?;
    for (channel, outcome) in &outcomes {
        match outcome {
            Ok(RangeAdjustment::Unchanged) => println!("channel {channel}: range unchanged"),
            Ok(RangeAdjustment::Stepped { from, to }) => {
                println!("channel {channel}: range {from} -> {to}");
            }
            Err(e) => println!("channel {channel}: {e}"),
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports {
        match port.port_type {
            SerialPortType::UsbPort(info) => {
                let product = info.product.as_deref().unwrap_or("USB serial device");
                println!(
                    "{}  {product} ({:04x}:{:04x})",
                    port.port_name, info.vid, info.pid
                );
            }
            SerialPortType::PciPort => println!("{}  PCI", port.port_name),
            SerialPortType::BluetoothPort => println!("{}  Bluetooth", port.port_name),
            SerialPortType::Unknown => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}
