//! timssdr-info
//!
//! Lists the TimsSDR boards on the bus and reads each board's identity.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use timssdr::usb::LibusbTransport;
use timssdr::{Error, Timssdr};
use tools::{InfoConfig, setup_logging};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "timssdr-info")]
#[command(author, version, about = "List TimsSDR boards and read their part ID")]
#[command(long_about = "
Scans the USB bus for TimsSDR boards, opens each one, and prints its serial
number and part ID.

EXAMPLES:
    # Report every board
    timssdr-info

    # Only boards whose serial number ends with 02
    timssdr-info --serial 02

    # Run with debug logging
    timssdr-info --log-level debug

CONFIGURATION:
    Settings are read from the path given with --config, otherwise from
    ~/.config/timssdr/info.toml when it exists, otherwise built-in defaults.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Only report boards whose serial number ends with SUFFIX
    #[arg(short, long, value_name = "SUFFIX")]
    serial: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.save_config {
        let path = InfoConfig::default_path();
        InfoConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = match args.config {
        Some(path) => InfoConfig::load(Some(path)).context("Failed to load configuration")?,
        None => InfoConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;
    debug!("timssdr-info v{}", Timssdr::<LibusbTransport>::library_version());

    let transport = LibusbTransport::new().context("Failed to initialize libusb")?;
    let timssdr = Timssdr::with_transport(transport, config.engine.clone())
        .context("Failed to initialize TimsSDR library")?;

    let serial_filter = args.serial.as_deref().or(config.serial.as_deref());
    let code = report_boards(&timssdr, serial_filter)?;

    timssdr
        .exit()
        .map_err(|(_, e)| e)
        .context("Failed to shut down TimsSDR library")?;
    Ok(code)
}

fn report_boards(timssdr: &Timssdr, serial_filter: Option<&str>) -> Result<ExitCode> {
    let list = timssdr.device_list().context("Failed to list devices")?;

    let matching: Vec<usize> = list
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, entry)| match serial_filter {
            Some(suffix) => entry
                .serial_number
                .as_deref()
                .is_some_and(|serial| serial.ends_with(suffix)),
            None => true,
        })
        .map(|(index, _)| index)
        .collect();

    if matching.is_empty() {
        println!("No TimsSDR boards found.");
        return Ok(ExitCode::FAILURE);
    }

    for index in matching {
        let Some(entry) = list.get(index) else {
            continue;
        };
        println!("Found TimsSDR");
        println!("Index: {}", index);
        if let Some(serial) = &entry.serial_number {
            println!("Serial number: {}", serial);
        }
        println!("Board: {}", entry.board_id.name());

        let device = match timssdr.open_from_list(&list, index) {
            Ok(device) => device,
            // Typically a permissions problem with this one board
            Err(Error::Usb(e)) => {
                warn!("Failed to open board {}: {}", index, e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to open board"),
        };

        let info = device
            .board_partid_serialno_read()
            .context("Failed to read part ID")?;
        println!(
            "Part ID Number: 0x{:08x} 0x{:08x}",
            info.part_id[0], info.part_id[1]
        );

        if let Err(e) = device.close() {
            warn!("Failed to close board {}: {}", index, e);
        }
        println!();
    }

    Ok(ExitCode::SUCCESS)
}
