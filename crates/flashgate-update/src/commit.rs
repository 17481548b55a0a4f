//! Commit and rollback of a fully staged image
//!
//! Order is fixed: seal the staged bytes, then move the boot pointer, then ask
//! for a restart. A failure at any step stops there, so the boot pointer only
//! ever names a sealed image.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use crate::error::{Result, UpdateError};
use crate::partition::PartitionRegistry;
use crate::progress::{ProgressPublisher, UpdatePhase};
use crate::session::{SessionState, UpdateSession};

/// Process restart collaborator
pub trait RestartHandle: Send + Sync {
    /// Ask for a restart into the new boot target
    fn request_restart(&self);
}

/// Restart handle that only records requests
#[derive(Debug, Default)]
pub struct RestartFlag {
    requests: AtomicU32,
}

impl RestartFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a restart has been requested
    pub fn is_requested(&self) -> bool {
        self.count() > 0
    }

    /// Number of restart requests seen
    pub fn count(&self) -> u32 {
        self.requests.load(Ordering::Acquire)
    }
}

impl RestartHandle for RestartFlag {
    fn request_restart(&self) {
        self.requests.fetch_add(1, Ordering::AcqRel);
    }
}

/// Finishes sessions whose stream is complete
#[derive(Clone)]
pub struct CommitController {
    registry: Arc<dyn PartitionRegistry>,
    restart: Arc<dyn RestartHandle>,
}

impl CommitController {
    /// Create a controller over `registry`
    pub fn new(registry: Arc<dyn PartitionRegistry>, restart: Arc<dyn RestartHandle>) -> Self {
        Self { registry, restart }
    }

    /// Seal the staged image, point the boot pointer at it and request a restart
    ///
    /// # Errors
    ///
    /// - [`UpdateError::IncompleteTransfer`] if fewer than the declared bytes were written
    /// - [`UpdateError::SealFailure`] if the writer cannot be sealed; boot pointer untouched
    /// - [`UpdateError::BootPointerFailure`] if the boot pointer cannot be persisted
    pub async fn commit(
        &self,
        session: &mut UpdateSession,
        progress: &ProgressPublisher,
    ) -> Result<()> {
        if !session.is_complete() {
            return Err(UpdateError::IncompleteTransfer {
                written: session.bytes_written(),
                declared: session.declared_length(),
            });
        }
        let writer = session
            .take_writer()
            .ok_or_else(|| UpdateError::SealFailure("staging writer already released".to_string()))?;

        progress.publish(session.progress(UpdatePhase::Sealing));
        writer
            .seal()
            .await
            .map_err(|e| UpdateError::SealFailure(format!("{e:#}")))?;
        session.set_state(SessionState::Sealed);
        info!(
            partition = %session.target(),
            sha256 = %session.digest(),
            "Staged image sealed"
        );

        self.registry
            .set_boot_pointer(session.target())
            .await
            .map_err(|e| UpdateError::BootPointerFailure(format!("{e:#}")))?;
        session.set_state(SessionState::Committed);
        progress.publish(session.progress(UpdatePhase::Activated));
        info!("Boot partition set to {}", session.target());

        self.restart.request_restart();
        session.set_state(SessionState::RestartRequested);
        progress.publish(session.progress(UpdatePhase::RestartRequested));
        info!("Restart requested to boot the new image");
        Ok(())
    }
}
