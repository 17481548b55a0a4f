//! Single-session admission guard

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, UpdateError};

/// Admits at most one update session at a time
///
/// Acquisition is a compare-and-set, so concurrent admissions fail fast
/// instead of queueing behind the active session.
#[derive(Debug, Default)]
pub struct SessionGuard {
    active: AtomicBool,
    holder: Mutex<Option<Uuid>>,
}

impl SessionGuard {
    /// Create an idle guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session currently holds the guard
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Id of the session holding the guard
    pub fn active_session(&self) -> Option<Uuid> {
        *self.holder.lock()
    }

    /// Claim the guard for `session_id`
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::AlreadyInProgress`] if another session holds it.
    pub fn try_acquire(self: &Arc<Self>, session_id: Uuid) -> Result<GuardToken> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let holder = self
                .active_session()
                .map_or_else(|| "unknown".to_string(), |id| id.to_string());
            return Err(UpdateError::AlreadyInProgress(holder));
        }
        *self.holder.lock() = Some(session_id);
        Ok(GuardToken {
            guard: Arc::clone(self),
            session_id,
        })
    }
}

/// Proof of admission; releases the guard when dropped
#[derive(Debug)]
pub struct GuardToken {
    guard: Arc<SessionGuard>,
    session_id: Uuid,
}

impl GuardToken {
    /// Session that owns this token
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.guard.holder.lock().take();
        self.guard.active.store(false, Ordering::Release);
        info!(session_id = %self.session_id, "Update session guard released");
    }
}
