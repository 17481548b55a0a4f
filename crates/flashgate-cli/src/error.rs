//! Error types for the flashgate CLI

use flashgate_update::{UpdateError, UpdateErrorKind};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("No flash layout found in {0}")]
    LayoutNotFound(PathBuf),

    #[error("Flash layout already exists in {0}")]
    LayoutExists(PathBuf),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Invalid flash state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Process exit code for a failed command
///
/// CLI errors and update errors map to distinct codes so scripts can tell
/// a missing layout from a rejected image or a failed session.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(update) = error.downcast_ref::<UpdateError>() {
        return match update.kind() {
            UpdateErrorKind::AlreadyInProgress => 3,
            UpdateErrorKind::DeadlineExceeded => 5,
            UpdateErrorKind::Config => 4,
            _ if update.status_code() == 400 => 4,
            _ => 6,
        };
    }
    match error.downcast_ref::<CliError>() {
        Some(CliError::LayoutNotFound(_)) | Some(CliError::LayoutExists(_)) => 2,
        Some(CliError::InvalidImage(_)) | Some(CliError::JsonError(_)) => 4,
        Some(CliError::InvalidState(_)) => 7,
        _ => 1,
    }
}

/// Stable name of the error for JSON output
pub fn error_type_name(error: &anyhow::Error) -> &'static str {
    if let Some(update) = error.downcast_ref::<UpdateError>() {
        return update.kind().as_str();
    }
    match error.downcast_ref::<CliError>() {
        Some(CliError::LayoutNotFound(_)) => "layout_not_found",
        Some(CliError::LayoutExists(_)) => "layout_exists",
        Some(CliError::InvalidImage(_)) => "invalid_image",
        Some(CliError::InvalidState(_)) => "invalid_state",
        Some(CliError::IoError(_)) => "io",
        Some(CliError::JsonError(_)) => "json",
        None => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_errors_map_by_kind() {
        let busy = anyhow::Error::from(UpdateError::AlreadyInProgress("x".to_string()));
        assert_eq!(exit_code(&busy), 3);
        assert_eq!(error_type_name(&busy), "already_in_progress");

        let large = anyhow::Error::from(UpdateError::TooLarge {
            declared: 2,
            limit: 1,
        });
        assert_eq!(exit_code(&large), 4);

        let seal = anyhow::Error::from(UpdateError::SealFailure("disk".to_string()));
        assert_eq!(exit_code(&seal), 6);
    }

    #[test]
    fn test_context_keeps_classification() {
        let error = anyhow::Error::from(UpdateError::NoStagingPartition).context("Upload failed");
        assert_eq!(exit_code(&error), 6);
        assert_eq!(error_type_name(&error), "no_staging_partition");
    }

    #[test]
    fn test_cli_errors_map() {
        let missing = anyhow::Error::from(CliError::LayoutNotFound(PathBuf::from("/x")));
        assert_eq!(exit_code(&missing), 2);
        let bad = anyhow::Error::from(CliError::InvalidImage("short".to_string()));
        assert_eq!(exit_code(&bad), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
        assert_eq!(error_type_name(&anyhow::anyhow!("other")), "unknown");
    }
}
