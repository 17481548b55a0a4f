//! Version policy for candidate images
//!
//! The decision is a pure function of three version fields and only
//! annotates the session. Whether an annotation blocks the write is decided
//! separately by [`enforce`] under the configured [`VersionMode`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};
use crate::image::{AppDescriptor, FirmwareVersion};

/// Outcome of comparing a candidate against the device's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionDecision {
    /// Candidate is new to this device
    Proceed,
    /// Candidate equals the version that last failed to boot and was rolled back
    WarnSameAsFailed,
    /// Candidate equals the running version
    WarnNoNewer,
}

impl VersionDecision {
    /// Whether the decision carries a warning
    pub fn is_warning(self) -> bool {
        self != VersionDecision::Proceed
    }

    /// Operator-facing description
    pub fn describe(self, candidate: &FirmwareVersion) -> String {
        match self {
            VersionDecision::Proceed => format!("version {candidate} is new to this device"),
            VersionDecision::WarnSameAsFailed => format!(
                "version {candidate} previously failed to boot and was rolled back"
            ),
            VersionDecision::WarnNoNewer => {
                format!("version {candidate} is already running")
            }
        }
    }
}

/// Decide how a candidate version relates to the running and last failed versions
///
/// Exact byte-wise equality only; there is no ordering between versions. An
/// absent version never matches.
pub fn decide(
    candidate: &FirmwareVersion,
    running: Option<&FirmwareVersion>,
    last_failed: Option<&FirmwareVersion>,
) -> VersionDecision {
    if last_failed == Some(candidate) {
        VersionDecision::WarnSameAsFailed
    } else if running == Some(candidate) {
        VersionDecision::WarnNoNewer
    } else {
        VersionDecision::Proceed
    }
}

/// Descriptors a candidate is compared against
///
/// Read once at admission, before the staging partition is erased, since the
/// staging partition may hold the image that last failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionHistory {
    /// Descriptor of the running image
    pub running: Option<AppDescriptor>,
    /// Descriptor of the image that last failed to boot
    pub last_failed: Option<AppDescriptor>,
}

impl VersionHistory {
    /// [`decide`] against this history
    pub fn decide(&self, candidate: &FirmwareVersion) -> VersionDecision {
        decide(
            candidate,
            self.running.as_ref().map(|d| &d.version),
            self.last_failed.as_ref().map(|d| &d.version),
        )
    }
}

/// How version decisions affect the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionMode {
    /// Warnings are logged and the write proceeds
    #[default]
    Advisory,
    /// A version that previously failed to boot aborts the session
    RejectKnownBad,
}

/// Apply `mode` to a decision
///
/// # Errors
///
/// Returns [`UpdateError::VersionRejected`] when `mode` is
/// [`VersionMode::RejectKnownBad`] and the decision is
/// [`VersionDecision::WarnSameAsFailed`].
pub fn enforce(
    decision: VersionDecision,
    mode: VersionMode,
    candidate: &FirmwareVersion,
) -> Result<()> {
    match (mode, decision) {
        (VersionMode::RejectKnownBad, VersionDecision::WarnSameAsFailed) => {
            Err(UpdateError::VersionRejected(decision.describe(candidate)))
        }
        _ => Ok(()),
    }
}
