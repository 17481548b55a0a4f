//! flashgate - firmware update session simulator
//!
//! Drives the update engine against a flash layout kept in a directory, so
//! admission, streaming, commit and fallback can be exercised from a shell.

#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod dir_flash;
mod error;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{DEFAULT_SLOT_SIZE, UploadArgs};

#[derive(Parser)]
#[command(name = "flashgate")]
#[command(about = "Firmware update session simulator for A/B flash layouts")]
#[command(version)]
#[command(long_about = "
flashgate streams firmware images into a simulated flash through the same
update engine a device runs: single-session admission, header and version
checks, sequential staging writes, then seal and boot pointer switch.

The flash lives in a directory: one file per partition plus layout.json.
Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output format (human-readable or JSON)
    #[arg(long, global = true, help = "Output in JSON format for machine parsing")]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a flash directory with a factory image and two OTA slots
    Init {
        /// Directory to create
        dir: PathBuf,
        /// Size of each partition in bytes
        #[arg(long, default_value_t = DEFAULT_SLOT_SIZE)]
        slot_size: u64,
        /// Version carried by the factory image
        #[arg(long, default_value = "v1.0.0")]
        running_version: String,
    },

    /// Show partitions, roles and image versions
    Status {
        /// Flash directory
        dir: PathBuf,
    },

    /// Decode the header window of an image file
    Inspect {
        /// Image file
        image: PathBuf,
    },

    /// Stream an image into the flash through an update session
    Upload(UploadArgs),

    /// Write a synthetic well-formed image
    BuildImage {
        /// Output file
        out: PathBuf,
        /// Version string embedded in the descriptor
        #[arg(long = "image-version")]
        image_version: String,
        /// Project name embedded in the descriptor
        #[arg(long, default_value = "flashgate-app")]
        project: String,
        /// Total image size in bytes
        #[arg(long, default_value_t = 4096)]
        size: usize,
        /// Anti-rollback counter
        #[arg(long, default_value_t = 0)]
        secure_version: u32,
    },

    /// Restart into the partition named by the boot pointer
    Reboot {
        /// Flash directory
        dir: PathBuf,
    },

    /// Simulate a failed boot and fall back to the previous image
    MarkFailed {
        /// Flash directory
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("flashgate={log_level},flashgate_update={log_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(error::exit_code(&e))
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Init {
            dir,
            slot_size,
            running_version,
        } => commands::flash::init(dir, *slot_size, running_version, cli.json).await,
        Commands::Status { dir } => commands::flash::status(dir, cli.json).await,
        Commands::Inspect { image } => commands::image::inspect(image, cli.json).await,
        Commands::Upload(args) => commands::flash::upload(args, cli.json).await,
        Commands::BuildImage {
            out,
            image_version,
            project,
            size,
            secure_version,
        } => {
            commands::image::build_image(
                out,
                image_version,
                project,
                *size,
                *secure_version,
                cli.json,
            )
            .await
        }
        Commands::Reboot { dir } => commands::flash::reboot(dir, cli.json).await,
        Commands::MarkFailed { dir } => commands::flash::mark_failed(dir, cli.json).await,
    }
}
