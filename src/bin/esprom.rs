use std::{fs, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use esprom::{logging::initialize_logger, CancelToken, Monitor, ProgressSink, Session};
use log::LevelFilter;
use miette::{IntoDiagnostic, Result, WrapErr};

/// Serial flasher for the ESP32-family ROM bootloader.
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a binary firmware image to a device's SPI flash
    Flash(FlashArgs),
    /// List available serial ports
    ListPorts,
    /// Mirror the serial output of a device line by line
    Monitor(MonitorArgs),
    /// Reset a device into its application
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Serial port the device is connected to
    port: String,
    /// Firmware image to write
    image: PathBuf,
    /// Flash offset to write the image at
    #[arg(long, value_parser = parse_u32, default_value = "0x10000")]
    offset: u32,
    /// Switch to this baud rate after the handshake
    #[arg(long)]
    baud: Option<u32>,
    /// Skip the reset engine; the device was put into download mode by hand
    #[arg(long)]
    manual: bool,
    /// Leave the device in the bootloader instead of rebooting it
    #[arg(long)]
    no_reboot: bool,
}

#[derive(Debug, Args)]
struct MonitorArgs {
    /// Serial port the device is connected to
    port: String,
    /// Baud rate to listen at
    #[arg(long, default_value_t = 115_200)]
    baud: u32,
}

#[derive(Debug, Args)]
struct ResetArgs {
    /// Serial port the device is connected to
    port: String,
}

/// Accepts both decimal and `0x`-prefixed hexadecimal values.
fn parse_u32(input: &str) -> std::result::Result<u32, String> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| format!("invalid number '{input}': {err}"))
}

/// Prints progress and session events to the terminal.
#[derive(Debug, Default)]
struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn emit_progress(&mut self, percent: u8, message: &str) {
        println!("[{percent:>3}%] {message}");
    }

    fn emit_log(&mut self, message: &str) {
        println!("       {message}");
    }
}

fn main() -> Result<()> {
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    match cli.subcommand {
        Commands::Flash(args) => flash(args),
        Commands::ListPorts => list_ports(),
        Commands::Monitor(args) => monitor(args),
        Commands::Reset(args) => reset(args),
    }
}

fn flash(args: FlashArgs) -> Result<()> {
    let image = fs::read(&args.image)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read '{}'", args.image.display()))?;

    let mut sink = ConsoleSink;
    let mut session = if args.manual {
        Session::open_manual(&args.port, &mut sink)?
    } else {
        Session::open(&args.port, &mut sink)?
    };

    if let Some(baud) = args.baud {
        session.set_baud(baud)?;
    }

    session.flash_image(&image, args.offset)?;

    if !args.no_reboot {
        session.reboot_target()?;
    }
    session.close();

    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = esprom::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }

    Ok(())
}

fn monitor(args: MonitorArgs) -> Result<()> {
    let mut monitor = Monitor::open(&args.port, args.baud)?;
    println!("Monitoring {} at {} baud, press Ctrl-C to stop", args.port, args.baud);

    // Runs until the process is interrupted; the OS releases the port.
    let stop = CancelToken::new();
    monitor.run(&stop, &mut |line| println!("{line}"))?;

    Ok(())
}

fn reset(args: ResetArgs) -> Result<()> {
    let mut interface = esprom::SerialInterface::open(&args.port, esprom::DEFAULT_BAUD)?;
    esprom::connection::reset::hard_reset(&mut interface)?;
    println!("Target reset");

    Ok(())
}
