//! Commands that operate on a flash directory
//!
//! - `init` lays out factory + two OTA slots and installs a factory image
//! - `status` reports roles and descriptor versions
//! - `upload` runs one update session through the engine
//! - `reboot` and `mark-failed` simulate what happens after the restart

use anyhow::{Context, Result};
use flashgate_update::prelude::*;
use flashgate_update::HEADER_WINDOW;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::commands::UploadArgs;
use crate::dir_flash::DirFlash;
use crate::error::CliError;
use crate::output;

/// Size of the factory image written by `init`
const FACTORY_IMAGE_LEN: usize = 4096;

/// Create a flash directory running `running_version` from the factory slot
pub async fn init(dir: &Path, slot_size: u64, running_version: &str, json: bool) -> Result<()> {
    if slot_size < HEADER_WINDOW as u64 {
        return Err(CliError::InvalidState(format!(
            "slot size of {slot_size} bytes cannot hold the {HEADER_WINDOW} byte header window"
        ))
        .into());
    }
    let image_len = usize::try_from(slot_size)
        .unwrap_or(usize::MAX)
        .min(FACTORY_IMAGE_LEN);
    let image = ImageBuilder::new(running_version)
        .total_len(image_len)
        .build();

    let flash = DirFlash::create(dir, FlashLayout::factory_and_two_slots(slot_size)).await?;
    flash.install("factory", &image).await?;

    let infos = describe_partitions(&flash).await?;
    output::print_status(flash.root(), &infos, json)
}

/// Show partitions with roles and versions
pub async fn status(dir: &Path, json: bool) -> Result<()> {
    let flash = DirFlash::open(dir).await?;
    let infos = describe_partitions(&flash).await?;
    output::print_status(dir, &infos, json)
}

/// Stream an image file into the flash through one update session
pub async fn upload(args: &UploadArgs, json: bool) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => UpdateConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => UpdateConfig::default(),
    };
    if args.strict_header {
        config.header_mode = HeaderMode::Strict;
    }
    if args.reject_known_bad {
        config.version_mode = VersionMode::RejectKnownBad;
    }
    let base_path = args
        .base_path
        .clone()
        .unwrap_or_else(|| config.storage_root.clone());

    let flash = Arc::new(DirFlash::open(&args.dir).await?);
    let restart = Arc::new(RestartFlag::new());
    let engine = UpdateEngine::new(config, flash, restart.clone())?;

    let file = tokio::fs::File::open(&args.image)
        .await
        .with_context(|| format!("Failed to open image {}", args.image.display()))?;
    let declared = file.metadata().await?.len();
    info!("Uploading {} ({} bytes)", args.image.display(), declared);

    let display = (!json).then(|| spawn_progress_bar(engine.subscribe_progress()));

    let result = match args.chunk_size {
        Some(chunk) => {
            let data = tokio::fs::read(&args.image)
                .await
                .with_context(|| format!("Failed to read image {}", args.image.display()))?;
            let mut source = SliceSource::new(data, chunk.get());
            engine.upload(declared, &base_path, &mut source).await
        }
        None => {
            let mut source = ReaderSource::new(file);
            engine.upload(declared, &base_path, &mut source).await
        }
    };

    drop(engine);
    if let Some(handle) = display
        && let Err(e) = handle.await
    {
        debug!("Progress display ended early: {}", e);
    }

    let report = result?;
    output::print_report(&report, restart.is_requested(), json)
}

/// Apply the boot pointer as a successful restart would
pub async fn reboot(dir: &Path, json: bool) -> Result<()> {
    let flash = DirFlash::open(dir).await?;
    let running = flash.reboot().await?;
    let infos = describe_partitions(&flash).await?;
    output::print_transition(&format!("Now running {running}"), &infos, json)
}

/// Record a failed boot of the partition named by the boot pointer
pub async fn mark_failed(dir: &Path, json: bool) -> Result<()> {
    let flash = DirFlash::open(dir).await?;
    let failed = flash.mark_failed().await?;
    let infos = describe_partitions(&flash).await?;
    output::print_transition(&format!("Boot of {failed} marked as failed"), &infos, json)
}

fn spawn_progress_bar(mut rx: broadcast::Receiver<UpdateProgress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
        {
            pb.set_style(style.progress_chars("█▓░"));
        }

        loop {
            match rx.recv().await {
                Ok(progress) => {
                    pb.set_position(u64::from(progress.progress_percent));
                    match progress.phase {
                        UpdatePhase::Admitted => pb.set_message("Staging partition opened"),
                        UpdatePhase::Receiving => pb.set_message(format!(
                            "{}/{} bytes",
                            progress.bytes_written, progress.total_bytes
                        )),
                        UpdatePhase::Sealing => pb.set_message("Sealing staged image"),
                        UpdatePhase::Activated => pb.set_message("Boot pointer updated"),
                        UpdatePhase::RestartRequested => {
                            pb.finish_with_message("Image activated");
                            break;
                        }
                        UpdatePhase::Aborted => {
                            pb.abandon_with_message("Update aborted");
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    pb.finish_and_clear();
                    break;
                }
            }
        }
    })
}
