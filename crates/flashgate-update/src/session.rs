//! State of one admitted update session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::error::{Result, UpdateError};
use crate::guard::GuardToken;
use crate::image::{
    AppDescriptor, HeaderMode, HeaderOutcome, HeaderProbe, HeaderState, ImageDescriptor,
};
use crate::partition::{Partition, StagingWriter};
use crate::policy::{VersionDecision, VersionHistory};
use crate::progress::{UpdatePhase, UpdateProgress};

/// Lifecycle of a session after admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Streaming bytes into the staging partition
    Receiving,
    /// Staged image flushed and closed
    Sealed,
    /// Boot pointer names the staged image
    Committed,
    /// Restart collaborator signalled; terminal
    RestartRequested,
    /// Session ended without touching the boot pointer; terminal
    Aborted,
}

impl SessionState {
    /// Whether the session can make no further progress
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::RestartRequested | SessionState::Aborted)
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session id used in logs
    pub session_id: Uuid,
    /// Admission time
    pub started_at: DateTime<Utc>,
    /// When the report was taken
    pub finished_at: DateTime<Utc>,
    /// Partition the image was staged into
    pub target: Partition,
    /// Length promised by the transport
    pub declared_length: u64,
    /// Bytes written to the staging partition
    pub bytes_written: u64,
    /// SHA-256 of the bytes written, hex encoded
    pub sha256: String,
    /// Decoded image descriptor
    pub descriptor: Option<AppDescriptor>,
    /// Version policy outcome
    pub decision: Option<VersionDecision>,
    /// Header validation state
    pub header_state: HeaderState,
    /// Advisory warnings raised along the way
    pub warnings: Vec<String>,
    /// Final state
    pub state: SessionState,
}

/// One firmware upload from admission through commit or abort
///
/// Owns the staging writer and the guard token; dropping the session
/// releases both.
pub struct UpdateSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    target: Partition,
    history: VersionHistory,
    declared_length: u64,
    bytes_written: u64,
    writer: Option<Box<dyn StagingWriter>>,
    probe: HeaderProbe,
    descriptor: Option<ImageDescriptor>,
    decision: Option<VersionDecision>,
    warnings: Vec<String>,
    state: SessionState,
    hasher: Sha256,
    cancel_rx: mpsc::Receiver<()>,
    _token: GuardToken,
}

impl std::fmt::Debug for UpdateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSession")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("declared_length", &self.declared_length)
            .field("bytes_written", &self.bytes_written)
            .field("header_state", &self.probe.state())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl UpdateSession {
    pub(crate) fn new(
        token: GuardToken,
        target: Partition,
        history: VersionHistory,
        declared_length: u64,
        writer: Box<dyn StagingWriter>,
        header_mode: HeaderMode,
        cancel_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            id: token.session_id(),
            started_at: Utc::now(),
            target,
            history,
            declared_length,
            bytes_written: 0,
            writer: Some(writer),
            probe: HeaderProbe::new(header_mode),
            descriptor: None,
            decision: None,
            warnings: Vec::new(),
            state: SessionState::Receiving,
            hasher: Sha256::new(),
            cancel_rx,
            _token: token,
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Partition being written
    pub fn target(&self) -> &Partition {
        &self.target
    }

    /// Running and last failed descriptors seen at admission
    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    /// Length promised by the transport
    pub fn declared_length(&self) -> u64 {
        self.declared_length
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes still expected
    pub fn remaining(&self) -> u64 {
        self.declared_length.saturating_sub(self.bytes_written)
    }

    /// Whether every declared byte has been written
    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.declared_length
    }

    /// Header validation state
    pub fn header_state(&self) -> HeaderState {
        self.probe.state()
    }

    /// Header mode the session runs under
    pub fn header_mode(&self) -> HeaderMode {
        self.probe.mode()
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Decoded image descriptor
    pub fn descriptor(&self) -> Option<&ImageDescriptor> {
        self.descriptor.as_ref()
    }

    /// Version policy outcome
    pub fn decision(&self) -> Option<VersionDecision> {
        self.decision
    }

    /// Advisory warnings raised so far
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Whether the staging writer is still held
    pub fn holds_writer(&self) -> bool {
        self.writer.is_some()
    }

    /// Progress snapshot for `phase`
    pub fn progress(&self, phase: UpdatePhase) -> UpdateProgress {
        UpdateProgress::new(self.id, phase, self.bytes_written, self.declared_length)
    }

    pub(crate) fn cancel_rx(&mut self) -> &mut mpsc::Receiver<()> {
        &mut self.cancel_rx
    }

    pub(crate) fn cancel_requested(&mut self) -> bool {
        self.cancel_rx.try_recv().is_ok()
    }

    pub(crate) fn observe_header(&mut self, chunk: &[u8]) -> Option<HeaderOutcome> {
        self.probe.observe(chunk)
    }

    pub(crate) fn finish_header(&mut self) -> Option<HeaderOutcome> {
        self.probe.finish()
    }

    pub(crate) fn record_header(&mut self, descriptor: ImageDescriptor, decision: VersionDecision) {
        self.descriptor = Some(descriptor);
        self.decision = Some(decision);
    }

    pub(crate) fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Append `chunk` at the cursor
    ///
    /// The overrun check runs before the writer sees any byte of the chunk.
    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let received = self.bytes_written.saturating_add(chunk.len() as u64);
        if received > self.declared_length {
            return Err(UpdateError::LengthExceeded {
                declared: self.declared_length,
                received,
            });
        }
        let offset = self.bytes_written;
        let writer = self.writer.as_mut().ok_or_else(|| UpdateError::WriteFailure {
            offset,
            reason: "staging writer already released".to_string(),
        })?;
        writer
            .write(chunk)
            .await
            .map_err(|e| UpdateError::WriteFailure {
                offset,
                reason: format!("{e:#}"),
            })?;
        self.hasher.update(chunk);
        self.bytes_written = received;
        Ok(())
    }

    pub(crate) fn take_writer(&mut self) -> Option<Box<dyn StagingWriter>> {
        self.writer.take()
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Drop the writer and mark the session aborted
    pub(crate) fn abort(&mut self, reason: &UpdateError) {
        self.writer = None;
        self.state = SessionState::Aborted;
        error!(
            session_id = %self.id,
            kind = %reason.kind(),
            bytes_written = self.bytes_written,
            declared_length = self.declared_length,
            "Update session aborted: {}",
            reason
        );
    }

    /// Hex SHA-256 of the bytes written so far
    pub fn digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Snapshot the session as a report
    pub fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            target: self.target.clone(),
            declared_length: self.declared_length,
            bytes_written: self.bytes_written,
            sha256: self.digest(),
            descriptor: self.descriptor.as_ref().map(|d| d.app.clone()),
            decision: self.decision,
            header_state: self.probe.state(),
            warnings: self.warnings.clone(),
            state: self.state,
        }
    }
}
