//! Error types for firmware update sessions

use std::time::Duration;
use thiserror::Error;

/// Errors that can end or prevent a firmware update session
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Another session holds the update guard
    #[error("Update already in progress (session {0})")]
    AlreadyInProgress(String),

    /// Declared image length exceeds the configured ceiling or the staging partition
    #[error("Image too large: declared {declared} bytes, limit is {limit} bytes")]
    TooLarge {
        /// Length promised by the transport
        declared: u64,
        /// Ceiling that was exceeded
        limit: u64,
    },

    /// Requested storage root or selected partition is not a valid update target
    #[error("Invalid update target: {0}")]
    InvalidTarget(String),

    /// Declared length cannot describe an image
    #[error("Invalid declared length: {0} bytes")]
    InvalidLength(u64),

    /// The partition registry has no spare region to stage into
    #[error("No staging partition available")]
    NoStagingPartition,

    /// Image header failed validation in strict header mode
    #[error("Image header rejected: {0}")]
    HeaderRejected(String),

    /// Candidate version blocked by the configured version mode
    #[error("Firmware version rejected: {0}")]
    VersionRejected(String),

    /// Transport delivered an error or an empty read
    #[error("Transport failure after {received} bytes: {reason}")]
    TransportFailure {
        /// Bytes accepted before the failure
        received: u64,
        /// Failure description from the transport
        reason: String,
    },

    /// Flash write into the staging partition failed
    #[error("Flash write failed at offset {offset}: {reason}")]
    WriteFailure {
        /// Partition offset of the failed write
        offset: u64,
        /// Failure description from the writer
        reason: String,
    },

    /// Transport delivered more bytes than it declared
    #[error("Stream exceeded declared length: {received} of {declared} bytes")]
    LengthExceeded {
        /// Length promised by the transport
        declared: u64,
        /// Bytes that would have been written
        received: u64,
    },

    /// Transport stalled longer than the receive deadline
    #[error("Receive deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Session was cancelled from outside
    #[error("Update cancelled after {0} bytes")]
    Cancelled(u64),

    /// No session is active for the requested operation
    #[error("No active update session")]
    NoActiveSession,

    /// Commit requested before the declared length was written
    #[error("Transfer incomplete: {written} of {declared} bytes written")]
    IncompleteTransfer {
        /// Bytes written to the staging partition
        written: u64,
        /// Length promised by the transport
        declared: u64,
    },

    /// Staged image could not be flushed and sealed
    #[error("Failed to seal staged image: {0}")]
    SealFailure(String),

    /// Staged image is written but the boot pointer could not be moved to it
    #[error("Failed to update boot pointer: {0}")]
    BootPointerFailure(String),

    /// Partition registry failure outside the write and commit paths
    #[error("Partition registry error: {0}")]
    Registry(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for UpdateError {
    fn from(e: serde_json::Error) -> Self {
        UpdateError::Config(e.to_string())
    }
}

/// Stable, payload-free classification of [`UpdateError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateErrorKind {
    /// See [`UpdateError::AlreadyInProgress`]
    AlreadyInProgress,
    /// See [`UpdateError::TooLarge`]
    TooLarge,
    /// See [`UpdateError::InvalidTarget`]
    InvalidTarget,
    /// See [`UpdateError::InvalidLength`]
    InvalidLength,
    /// See [`UpdateError::NoStagingPartition`]
    NoStagingPartition,
    /// See [`UpdateError::HeaderRejected`]
    HeaderRejected,
    /// See [`UpdateError::VersionRejected`]
    VersionRejected,
    /// See [`UpdateError::TransportFailure`]
    TransportFailure,
    /// See [`UpdateError::WriteFailure`]
    WriteFailure,
    /// See [`UpdateError::LengthExceeded`]
    LengthExceeded,
    /// See [`UpdateError::DeadlineExceeded`]
    DeadlineExceeded,
    /// See [`UpdateError::Cancelled`]
    Cancelled,
    /// See [`UpdateError::NoActiveSession`]
    NoActiveSession,
    /// See [`UpdateError::IncompleteTransfer`]
    IncompleteTransfer,
    /// See [`UpdateError::SealFailure`]
    SealFailure,
    /// See [`UpdateError::BootPointerFailure`]
    BootPointerFailure,
    /// See [`UpdateError::Registry`]
    Registry,
    /// See [`UpdateError::Config`]
    Config,
    /// See [`UpdateError::Io`]
    Io,
}

impl UpdateErrorKind {
    /// Snake-case name, stable across releases
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateErrorKind::AlreadyInProgress => "already_in_progress",
            UpdateErrorKind::TooLarge => "too_large",
            UpdateErrorKind::InvalidTarget => "invalid_target",
            UpdateErrorKind::InvalidLength => "invalid_length",
            UpdateErrorKind::NoStagingPartition => "no_staging_partition",
            UpdateErrorKind::HeaderRejected => "header_rejected",
            UpdateErrorKind::VersionRejected => "version_rejected",
            UpdateErrorKind::TransportFailure => "transport_failure",
            UpdateErrorKind::WriteFailure => "write_failure",
            UpdateErrorKind::LengthExceeded => "length_exceeded",
            UpdateErrorKind::DeadlineExceeded => "deadline_exceeded",
            UpdateErrorKind::Cancelled => "cancelled",
            UpdateErrorKind::NoActiveSession => "no_active_session",
            UpdateErrorKind::IncompleteTransfer => "incomplete_transfer",
            UpdateErrorKind::SealFailure => "seal_failure",
            UpdateErrorKind::BootPointerFailure => "boot_pointer_failure",
            UpdateErrorKind::Registry => "registry",
            UpdateErrorKind::Config => "config",
            UpdateErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for UpdateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UpdateError {
    /// Classification of this error
    pub fn kind(&self) -> UpdateErrorKind {
        match self {
            UpdateError::AlreadyInProgress(_) => UpdateErrorKind::AlreadyInProgress,
            UpdateError::TooLarge { .. } => UpdateErrorKind::TooLarge,
            UpdateError::InvalidTarget(_) => UpdateErrorKind::InvalidTarget,
            UpdateError::InvalidLength(_) => UpdateErrorKind::InvalidLength,
            UpdateError::NoStagingPartition => UpdateErrorKind::NoStagingPartition,
            UpdateError::HeaderRejected(_) => UpdateErrorKind::HeaderRejected,
            UpdateError::VersionRejected(_) => UpdateErrorKind::VersionRejected,
            UpdateError::TransportFailure { .. } => UpdateErrorKind::TransportFailure,
            UpdateError::WriteFailure { .. } => UpdateErrorKind::WriteFailure,
            UpdateError::LengthExceeded { .. } => UpdateErrorKind::LengthExceeded,
            UpdateError::DeadlineExceeded(_) => UpdateErrorKind::DeadlineExceeded,
            UpdateError::Cancelled(_) => UpdateErrorKind::Cancelled,
            UpdateError::NoActiveSession => UpdateErrorKind::NoActiveSession,
            UpdateError::IncompleteTransfer { .. } => UpdateErrorKind::IncompleteTransfer,
            UpdateError::SealFailure(_) => UpdateErrorKind::SealFailure,
            UpdateError::BootPointerFailure(_) => UpdateErrorKind::BootPointerFailure,
            UpdateError::Registry(_) => UpdateErrorKind::Registry,
            UpdateError::Config(_) => UpdateErrorKind::Config,
            UpdateError::Io(_) => UpdateErrorKind::Io,
        }
    }

    /// Whether the error was raised at admission, before any partition was touched
    pub fn is_admission(&self) -> bool {
        matches!(
            self.kind(),
            UpdateErrorKind::AlreadyInProgress
                | UpdateErrorKind::TooLarge
                | UpdateErrorKind::InvalidTarget
                | UpdateErrorKind::InvalidLength
                | UpdateErrorKind::NoStagingPartition
        )
    }

    /// HTTP status a transport should answer with
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            UpdateErrorKind::AlreadyInProgress => 409,
            UpdateErrorKind::TooLarge
            | UpdateErrorKind::InvalidTarget
            | UpdateErrorKind::InvalidLength
            | UpdateErrorKind::HeaderRejected
            | UpdateErrorKind::VersionRejected
            | UpdateErrorKind::LengthExceeded => 400,
            UpdateErrorKind::DeadlineExceeded => 408,
            _ => 500,
        }
    }
}

/// Result alias for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_errors_are_classified() {
        assert!(UpdateError::AlreadyInProgress("x".to_string()).is_admission());
        assert!(
            UpdateError::TooLarge {
                declared: 2,
                limit: 1
            }
            .is_admission()
        );
        assert!(!UpdateError::Cancelled(10).is_admission());
        assert!(!UpdateError::SealFailure("x".to_string()).is_admission());
    }

    #[test]
    fn test_status_codes_are_distinct_for_busy_and_client_errors() {
        assert_eq!(
            UpdateError::AlreadyInProgress("x".to_string()).status_code(),
            409
        );
        assert_eq!(UpdateError::InvalidLength(0).status_code(), 400);
        assert_eq!(
            UpdateError::BootPointerFailure("x".to_string()).status_code(),
            500
        );
    }

    #[test]
    fn test_kind_names_are_snake_case() {
        let err = UpdateError::TransportFailure {
            received: 500,
            reason: "reset".to_string(),
        };
        assert_eq!(err.kind().as_str(), "transport_failure");
        assert_eq!(err.kind().to_string(), "transport_failure");
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_json_errors_become_config_errors() -> std::result::Result<(), &'static str> {
        let err = serde_json::from_str::<u32>("not json")
            .err()
            .ok_or("expected parse failure")?;
        assert_eq!(UpdateError::from(err).kind(), UpdateErrorKind::Config);
        Ok(())
    }
}
