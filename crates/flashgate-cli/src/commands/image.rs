//! Commands that work on image files

use anyhow::{Context, Result};
use flashgate_update::{HeaderOutcome, ImageBuilder, extract};
use std::path::Path;
use tracing::info;

use crate::error::CliError;
use crate::output;

/// Decode and print the header window of an image file
pub async fn inspect(path: &Path, json: bool) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    match extract(&bytes) {
        HeaderOutcome::Decoded(desc) => output::print_descriptor(path, bytes.len(), &desc, json),
        HeaderOutcome::Incomplete {
            available,
            required,
        } => Err(CliError::InvalidImage(format!(
            "{available} bytes do not cover the {required} byte header window"
        ))
        .into()),
        HeaderOutcome::Malformed(reason) => Err(CliError::InvalidImage(reason.to_string()).into()),
    }
}

/// Write a synthetic well-formed image
pub async fn build_image(
    out: &Path,
    version: &str,
    project: &str,
    size: usize,
    secure_version: u32,
    json: bool,
) -> Result<()> {
    let builder = ImageBuilder::new(version)
        .project_name(project)
        .secure_version(secure_version)
        .total_len(size);
    let image = builder.build();
    tokio::fs::write(out, &image)
        .await
        .with_context(|| format!("Failed to write image {}", out.display()))?;
    info!("Wrote {} byte image to {}", image.len(), out.display());
    output::print_built(out, image.len(), &builder.descriptor(), json)
}
