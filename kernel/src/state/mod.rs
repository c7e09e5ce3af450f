// Summary Log State Machine
//
// Lifecycle states of a summary log and the legal edges between them.
// This module is pure, deterministic, and side-effect free.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod expiry;

/// Lifecycle state of a summary log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLogStatus {
    /// Upload accepted, file still being scanned by the uploader.
    Preprocessing,

    /// File is available and the content validator is running.
    Validating,

    /// Content passed validation and may be submitted.
    Validated,

    /// Uploader rejected the file.
    Rejected,

    /// Content failed validation.
    Invalid,

    /// Claimed for submission. At most one per org/reg pair.
    Submitting,

    /// Submission completed.
    Submitted,

    /// Retired because a newer upload exists for the same pair.
    Superseded,
}

impl SummaryLogStatus {
    pub const ALL: [SummaryLogStatus; 8] = [
        SummaryLogStatus::Preprocessing,
        SummaryLogStatus::Validating,
        SummaryLogStatus::Validated,
        SummaryLogStatus::Rejected,
        SummaryLogStatus::Invalid,
        SummaryLogStatus::Submitting,
        SummaryLogStatus::Submitted,
        SummaryLogStatus::Superseded,
    ];

    /// Statuses the supersede sweep is allowed to retire.
    pub const SUPERSEDABLE: [SummaryLogStatus; 3] = [
        SummaryLogStatus::Preprocessing,
        SummaryLogStatus::Validating,
        SummaryLogStatus::Validated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryLogStatus::Preprocessing => "preprocessing",
            SummaryLogStatus::Validating => "validating",
            SummaryLogStatus::Validated => "validated",
            SummaryLogStatus::Rejected => "rejected",
            SummaryLogStatus::Invalid => "invalid",
            SummaryLogStatus::Submitting => "submitting",
            SummaryLogStatus::Submitted => "submitted",
            SummaryLogStatus::Superseded => "superseded",
        }
    }

    /// No status-changing operation is defined on terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SummaryLogStatus::Submitted | SummaryLogStatus::Superseded | SummaryLogStatus::Rejected
        )
    }

    pub fn is_supersedable(&self) -> bool {
        Self::SUPERSEDABLE.contains(self)
    }

    /// Whether a `failureReason` may accompany this status.
    pub fn carries_failure_reason(&self) -> bool {
        matches!(self, SummaryLogStatus::Invalid | SummaryLogStatus::Rejected)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: SummaryLogStatus) -> bool {
        use SummaryLogStatus::*;

        matches!(
            (self, next),
            (Preprocessing, Validating | Rejected | Superseded)
                | (Validating, Validated | Invalid | Superseded)
                // Re-attempt after a failed validation
                | (Invalid, Validating)
                | (Validated, Submitting | Superseded)
                // Losing an exclusivity race hands the claim back
                | (Submitting, Submitted | Validated)
        )
    }
}

impl fmt::Display for SummaryLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryLogStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StateError::UnknownStatus(s.to_string()))
    }
}

/// Outcome of the upload, as reported on `file.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Rejected,
    Complete,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Rejected => "rejected",
            UploadStatus::Complete => "complete",
        }
    }

    /// Status a freshly inserted summary log starts in.
    pub fn initial_status(&self) -> SummaryLogStatus {
        match self {
            UploadStatus::Pending => SummaryLogStatus::Preprocessing,
            UploadStatus::Complete => SummaryLogStatus::Validating,
            UploadStatus::Rejected => SummaryLogStatus::Rejected,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "rejected" => Ok(UploadStatus::Rejected),
            "complete" => Ok(UploadStatus::Complete),
            other => Err(StateError::UnknownUploadStatus(other.to_string())),
        }
    }
}

/// Errors produced during state transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Cannot transition summary log from {from} to {to}")]
    IllegalTransition {
        from: SummaryLogStatus,
        to: SummaryLogStatus,
    },

    #[error("unknown summary log status: {0}")]
    UnknownStatus(String),

    #[error("Invalid upload status: {0}")]
    UnknownUploadStatus(String),
}

/// Check a status change.
///
/// Staying in the same status is always allowed.
pub fn check_transition(
    from: SummaryLogStatus,
    to: SummaryLogStatus,
) -> Result<SummaryLogStatus, StateError> {
    if from == to || from.can_transition_to(to) {
        Ok(to)
    } else {
        Err(StateError::IllegalTransition { from, to })
    }
}
