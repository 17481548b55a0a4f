//! Update engine: admission, streaming and commit wired together
//!
//! One engine serves a device. It is `Send + Sync` and meant to be shared
//! behind an `Arc` by every request handler that can start an upload; the
//! session guard inside makes sure only one of them is ever writing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::commit::{CommitController, RestartHandle};
use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::guard::SessionGuard;
use crate::image::HeaderOutcome;
use crate::partition::{Partition, PartitionRegistry};
use crate::policy::{VersionHistory, enforce};
use crate::progress::{ProgressPublisher, UpdatePhase, UpdateProgress};
use crate::session::{SessionReport, UpdateSession};
use crate::transport::{ChunkError, ChunkSource};

/// Firmware update session engine
pub struct UpdateEngine {
    config: UpdateConfig,
    registry: Arc<dyn PartitionRegistry>,
    guard: Arc<SessionGuard>,
    committer: CommitController,
    progress: ProgressPublisher,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl UpdateEngine {
    /// Create an engine over `registry`
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if `config` does not validate.
    pub fn new(
        config: UpdateConfig,
        registry: Arc<dyn PartitionRegistry>,
        restart: Arc<dyn RestartHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let progress = ProgressPublisher::new(config.progress_capacity);
        Ok(Self {
            committer: CommitController::new(Arc::clone(&registry), restart),
            config,
            registry,
            guard: Arc::new(SessionGuard::new()),
            progress,
            cancel_tx: Mutex::new(None),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Whether a session is admitted
    pub fn is_busy(&self) -> bool {
        self.guard.is_active()
    }

    /// Id of the admitted session
    pub fn active_session(&self) -> Option<Uuid> {
        self.guard.active_session()
    }

    /// Subscribe to progress updates
    pub fn subscribe_progress(&self) -> broadcast::Receiver<UpdateProgress> {
        self.progress.subscribe()
    }

    /// Admit a new session
    ///
    /// The guard is claimed first and the stateless checks run before the
    /// registry is consulted, so a rejected admission has no side effects.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::AlreadyInProgress`] if another session is admitted
    /// - [`UpdateError::InvalidLength`] for a zero declared length
    /// - [`UpdateError::TooLarge`] above the configured ceiling or the staging partition
    /// - [`UpdateError::InvalidTarget`] for a foreign storage root, or a staging
    ///   choice that overlaps the running partition or a pending boot partition
    /// - [`UpdateError::NoStagingPartition`] if the layout has no spare slot
    pub async fn begin(&self, declared_length: u64, base_path: &str) -> Result<UpdateSession> {
        self.admit(Uuid::new_v4(), declared_length, base_path).await
    }

    async fn admit(
        &self,
        session_id: Uuid,
        declared_length: u64,
        base_path: &str,
    ) -> Result<UpdateSession> {
        let token = self.guard.try_acquire(session_id)?;

        if declared_length == 0 {
            return Err(UpdateError::InvalidLength(declared_length));
        }
        if declared_length > self.config.max_image_size {
            return Err(UpdateError::TooLarge {
                declared: declared_length,
                limit: self.config.max_image_size,
            });
        }
        if base_path != self.config.storage_root {
            return Err(UpdateError::InvalidTarget(format!(
                "storage root '{base_path}' is not '{}'",
                self.config.storage_root
            )));
        }

        let running = self
            .registry
            .running_partition()
            .await
            .map_err(registry_error)?;
        let boot = self
            .registry
            .boot_partition()
            .await
            .map_err(registry_error)?;
        if !boot.same_region(&running) {
            warn!(
                "Configured boot partition {} differs from running partition {}; \
                 boot data or the preferred image may be corrupt",
                boot, running
            );
        }
        info!("Running partition {}", running);

        let target = self
            .registry
            .next_staging_partition()
            .await
            .map_err(registry_error)?
            .ok_or(UpdateError::NoStagingPartition)?;
        if target.same_region(&running) {
            return Err(UpdateError::InvalidTarget(format!(
                "staging partition {target} is the running partition"
            )));
        }
        if target.same_region(&boot) && !boot.same_region(&running) {
            return Err(UpdateError::InvalidTarget(format!(
                "staging partition {target} is the pending boot partition"
            )));
        }
        if declared_length > target.size {
            return Err(UpdateError::TooLarge {
                declared: declared_length,
                limit: target.size,
            });
        }

        let history = self.version_history(&running).await;

        let writer = self
            .registry
            .open_writer(&target, declared_length)
            .await
            .map_err(registry_error)?;
        info!("Writing {} bytes to partition {}", declared_length, target);

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        *self.cancel_tx.lock() = Some(cancel_tx);

        let session = UpdateSession::new(
            token,
            target,
            history,
            declared_length,
            writer,
            self.config.header_mode,
            cancel_rx,
        );
        self.progress.publish(session.progress(UpdatePhase::Admitted));
        Ok(session)
    }

    /// Pump `source` into the session until the declared length is written
    ///
    /// # Errors
    ///
    /// Any abort error of the write loop. The session is aborted and its
    /// writer released before this returns; dropping it releases the guard.
    pub async fn stream(
        &self,
        session: &mut UpdateSession,
        source: &mut dyn ChunkSource,
    ) -> Result<()> {
        match self.pump(session, source).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort(session, &e);
                Err(e)
            }
        }
    }

    async fn pump(&self, session: &mut UpdateSession, source: &mut dyn ChunkSource) -> Result<()> {
        let deadline = self.config.receive_deadline();
        let mut scratch = vec![0u8; self.config.scratch_size];
        let mut stalled_since: Option<Instant> = None;

        while !session.is_complete() {
            if session.cancel_requested() {
                return Err(UpdateError::Cancelled(session.bytes_written()));
            }

            let want = usize::try_from(session.remaining())
                .unwrap_or(usize::MAX)
                .min(scratch.len());
            let buf = scratch.get_mut(..want).unwrap_or_default();
            let budget = deadline.map(|d| {
                d.saturating_sub(stalled_since.map_or(Duration::ZERO, |s| s.elapsed()))
            });

            let read_started = Instant::now();
            let read = async {
                match budget {
                    Some(budget) => tokio::time::timeout(budget, source.read_chunk(buf))
                        .await
                        .unwrap_or(Err(ChunkError::Timeout)),
                    None => source.read_chunk(buf).await,
                }
            };
            let result = tokio::select! {
                biased;
                Some(()) = session.cancel_rx().recv() => {
                    return Err(UpdateError::Cancelled(session.bytes_written()));
                }
                result = read => result,
            };

            let n = match result {
                Ok(0) => {
                    return Err(UpdateError::TransportFailure {
                        received: session.bytes_written(),
                        reason: "empty read".to_string(),
                    });
                }
                Ok(n) => n,
                Err(ChunkError::Timeout) => {
                    let since = *stalled_since.get_or_insert(read_started);
                    if let Some(limit) = deadline
                        && since.elapsed() >= limit
                    {
                        return Err(UpdateError::DeadlineExceeded(limit));
                    }
                    continue;
                }
                Err(e) => {
                    return Err(UpdateError::TransportFailure {
                        received: session.bytes_written(),
                        reason: e.to_string(),
                    });
                }
            };
            stalled_since = None;

            let Some(chunk) = scratch.get(..n).filter(|_| n <= want) else {
                return Err(UpdateError::LengthExceeded {
                    declared: session.declared_length(),
                    received: session.bytes_written().saturating_add(n as u64),
                });
            };

            if let Some(outcome) = session.observe_header(chunk) {
                self.evaluate_header(session, outcome).await?;
            }
            session.write_chunk(chunk).await?;
            self.progress.publish(session.progress(UpdatePhase::Receiving));
        }

        if let Some(outcome) = session.finish_header() {
            self.evaluate_header(session, outcome).await?;
        }
        info!(
            "Received {} of {} bytes",
            session.bytes_written(),
            session.declared_length()
        );
        Ok(())
    }

    /// Run the header outcome through the version policy
    async fn evaluate_header(
        &self,
        session: &mut UpdateSession,
        outcome: HeaderOutcome,
    ) -> Result<()> {
        let strict = session.header_mode().is_strict();
        let problem = match outcome {
            HeaderOutcome::Decoded(descriptor) => {
                let candidate = descriptor.app.version;
                info!(
                    version = %candidate,
                    project = %descriptor.app.project_name,
                    "New firmware version: {}",
                    candidate
                );

                let decision = session.history().decide(&candidate);
                if decision.is_warning() {
                    let message = decision.describe(&candidate);
                    warn!("{}", message);
                    session.add_warning(message);
                }
                session.record_header(*descriptor, decision);
                return enforce(decision, self.config.version_mode, &candidate);
            }
            HeaderOutcome::Incomplete {
                available,
                required,
            } => format!("image header incomplete: {available} of {required} bytes"),
            HeaderOutcome::Malformed(reason) => format!("image header malformed: {reason}"),
        };

        if strict {
            return Err(UpdateError::HeaderRejected(problem));
        }
        warn!("{}; writing unvalidated image", problem);
        session.add_warning(problem);
        Ok(())
    }

    /// Descriptors of the running and last failed images
    ///
    /// Unreadable descriptors count as absent; they never block admission.
    async fn version_history(&self, running: &Partition) -> VersionHistory {
        let running_desc = self
            .registry
            .read_descriptor(running)
            .await
            .unwrap_or_else(|e| {
                warn!("Running firmware descriptor unreadable: {e:#}");
                None
            });
        if let Some(desc) = &running_desc {
            info!("Running firmware version: {}", desc.version);
        }

        let last_failed = match self.registry.last_failed_partition().await {
            Ok(Some(partition)) => self
                .registry
                .read_descriptor(&partition)
                .await
                .unwrap_or_else(|e| {
                    warn!("Descriptor of {} unreadable: {e:#}", partition);
                    None
                }),
            Ok(None) => None,
            Err(e) => {
                warn!("Last failed partition unknown: {e:#}");
                None
            }
        };
        if let Some(desc) = &last_failed {
            info!("Last invalid firmware version: {}", desc.version);
        }

        VersionHistory {
            running: running_desc,
            last_failed,
        }
    }

    /// Seal, activate and request a restart
    ///
    /// # Errors
    ///
    /// See [`CommitController::commit`].
    pub async fn commit(&self, session: &mut UpdateSession) -> Result<()> {
        self.committer.commit(session, &self.progress).await
    }

    /// Admit, stream and commit in one call
    ///
    /// On any failure after admission the session is aborted, its writer
    /// dropped and the guard released before this returns.
    ///
    /// # Errors
    ///
    /// Any admission, stream or commit error.
    pub async fn upload(
        &self,
        declared_length: u64,
        base_path: &str,
        source: &mut dyn ChunkSource,
    ) -> Result<SessionReport> {
        let session_id = Uuid::new_v4();
        let span = info_span!("update_session", session_id = %session_id);
        async {
            let mut session = self.admit(session_id, declared_length, base_path).await?;
            self.stream(&mut session, source).await?;

            if let Err(e) = self.commit(&mut session).await {
                self.abort(&mut session, &e);
                return Err(e);
            }
            self.cancel_tx.lock().take();
            Ok(session.report())
        }
        .instrument(span)
        .await
    }

    fn abort(&self, session: &mut UpdateSession, reason: &UpdateError) {
        session.abort(reason);
        self.cancel_tx.lock().take();
        self.progress.publish(session.progress(UpdatePhase::Aborted));
    }

    /// Ask the admitted session to stop
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::NoActiveSession`] if nothing is admitted.
    pub fn cancel(&self) -> Result<()> {
        if !self.guard.is_active() {
            return Err(UpdateError::NoActiveSession);
        }
        let tx = self
            .cancel_tx
            .lock()
            .clone()
            .ok_or(UpdateError::NoActiveSession)?;
        match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {
                info!("Sent cancel signal to the active update session");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(())) => Err(UpdateError::NoActiveSession),
        }
    }
}

fn registry_error(e: anyhow::Error) -> UpdateError {
    UpdateError::Registry(format!("{e:#}"))
}
