//! # Process Image Sync Binary
//!
//! Opens the RevPi process image, puts every device into autorefresh and
//! logs each IO value change until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Watch all IOs with the default settings
//! procimg_sync
//!
//! # Settings file with CLI overrides
//! procimg_sync --settings /etc/procimg/sync.toml --cycle-time 50
//!
//! # Read-only watch of a simulator image
//! procimg_sync --procimg /tmp/procimg --config-rsc config.rsc --monitoring
//!
//! # Dump the replaced IO definitions and exit
//! procimg_sync --replace-io-file io.conf --export-replaced backup.conf
//! ```

#![deny(warnings)]

use clap::Parser;
use procimg_common::config::{ConfigLoader, SyncSettings};
use procimg_sync::{EventHandler, EventSpec, ProcessImage};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Process image sync - watch RevPi IOs and log their changes
#[derive(Parser, Debug)]
#[command(name = "procimg_sync")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Cyclic RevPi process image sync with change events")]
#[command(long_about = None)]
struct Args {
    /// Settings file (TOML). Missing fields use their defaults.
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Process image device file or simulator image.
    #[arg(long, value_name = "PATH")]
    procimg: Option<PathBuf>,

    /// piCtory configuration file.
    #[arg(long, value_name = "FILE")]
    config_rsc: Option<PathBuf>,

    /// Sync cycle time in milliseconds.
    #[arg(short = 't', long, value_name = "MS")]
    cycle_time: Option<u32>,

    /// Read-only mode: outputs are never written.
    #[arg(short, long)]
    monitoring: bool,

    /// Replace-IO definitions to import at startup.
    #[arg(long, value_name = "FILE")]
    replace_io_file: Option<PathBuf>,

    /// Write the replaced IOs to this file and exit.
    #[arg(long, value_name = "FILE")]
    export_replaced: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("procimg_sync failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let settings = load_settings(&args);
    let level = match &settings {
        _ if args.verbose => "debug",
        Ok(s) => s.log_level.as_directive(),
        Err(_) => "info",
    };
    setup_tracing(&args, level);
    let settings = settings?;

    info!("procimg_sync v{} starting...", env!("CARGO_PKG_VERSION"));

    let image = ProcessImage::open(settings)?;
    info!(
        "Process image opened: {} devices, {} IOs, {} bytes",
        image.devices().len(),
        image.ios().len(),
        image.length()
    );

    if let Some(path) = &args.export_replaced {
        image.export_replaced_ios(path)?;
        info!("Replaced IOs written to {}", path.display());
        image.cleanup()?;
        return Ok(());
    }

    image.autorefresh_all()?;

    let logger = EventHandler::new(|ctx| {
        info!(io = ctx.io_name.as_str(), value = %ctx.value, "value changed");
        Ok(())
    });
    for io in image.ios() {
        io.reg_event(EventSpec::new(logger.clone()))?;
    }

    let handle = image.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handle.exit(true);
    })?;

    if let Err(e) = image.mainloop() {
        error!("Mainloop error: {}", e);
    }

    image.cleanup()?;
    info!("procimg_sync shutdown complete");
    Ok(())
}

/// Settings file (or defaults) with the command line applied on top.
fn load_settings(args: &Args) -> Result<SyncSettings, Box<dyn std::error::Error>> {
    let mut settings = match &args.settings {
        Some(path) => SyncSettings::load(path)?,
        None => SyncSettings::default(),
    };
    if let Some(procimg) = &args.procimg {
        settings.procimg = procimg.clone();
    }
    if args.config_rsc.is_some() {
        settings.config_rsc = args.config_rsc.clone();
    }
    if args.cycle_time.is_some() {
        settings.cycle_time_ms = args.cycle_time;
    }
    if args.replace_io_file.is_some() {
        settings.replace_io_file = args.replace_io_file.clone();
    }
    settings.monitoring |= args.monitoring;
    Ok(settings)
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args, level: &str) {
    let filter = EnvFilter::from_default_env().add_directive(
        level
            .parse()
            .unwrap_or_else(|_| tracing::Level::INFO.into()),
    );

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
