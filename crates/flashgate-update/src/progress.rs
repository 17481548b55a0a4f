//! Progress reporting for update sessions

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Phases of an update session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    /// Session admitted, staging partition opened
    Admitted,

    /// Receiving and writing image bytes
    Receiving,

    /// Flushing and sealing the staged image
    Sealing,

    /// Boot pointer moved to the staged image
    Activated,

    /// Restart requested to boot the new image
    RestartRequested,

    /// Session aborted, boot pointer untouched
    Aborted,
}

/// Progress snapshot published once per chunk and on phase changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProgress {
    /// Session the snapshot belongs to
    pub session_id: Uuid,

    /// Current phase
    pub phase: UpdatePhase,

    /// Progress percentage (0-100)
    pub progress_percent: u8,

    /// Bytes written to the staging partition
    pub bytes_written: u64,

    /// Bytes declared by the transport
    pub total_bytes: u64,
}

impl UpdateProgress {
    /// Snapshot with the percentage derived from the byte counts
    pub fn new(session_id: Uuid, phase: UpdatePhase, bytes_written: u64, total_bytes: u64) -> Self {
        Self {
            session_id,
            phase,
            progress_percent: percent_complete(bytes_written, total_bytes),
            bytes_written,
            total_bytes,
        }
    }
}

/// Fan-out of progress snapshots to any number of subscribers
///
/// Publishing never blocks; lagging subscribers lose the oldest snapshots.
#[derive(Debug, Clone)]
pub struct ProgressPublisher {
    tx: broadcast::Sender<UpdateProgress>,
}

impl ProgressPublisher {
    /// Create a publisher buffering up to `capacity` snapshots per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateProgress> {
        self.tx.subscribe()
    }

    /// Publish a snapshot; having no subscribers is not an error
    pub fn publish(&self, progress: UpdateProgress) {
        debug!(
            phase = ?progress.phase,
            percent = progress.progress_percent,
            "{} / {} bytes",
            progress.bytes_written,
            progress.total_bytes
        );
        let _ = self.tx.send(progress);
    }
}

/// `floor(written * 100 / declared)`, capped at 100
pub fn percent_complete(written: u64, declared: u64) -> u8 {
    if declared == 0 {
        return 0;
    }
    let percent = u128::from(written).saturating_mul(100) / u128::from(declared);
    u8::try_from(percent.min(100)).unwrap_or(100)
}
