// Structured Logging Vocabulary
//
// Category/action pairs attached to store log events, so conflicts can
// be filtered by kind and traced back to the affected record.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Database,
    Consistency,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Database => "database",
            EventCategory::Consistency => "consistency",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    VersionConflictDetected,
    DuplicateIdRejected,
    SubmissionInProgress,
    IllegalStateChange,
    SubmissionClaimLost,
    PendingLogsSuperseded,
    ReadVisibilityTimeout,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::VersionConflictDetected => "version_conflict_detected",
            EventAction::DuplicateIdRejected => "duplicate_id_rejected",
            EventAction::SubmissionInProgress => "submission_in_progress",
            EventAction::IllegalStateChange => "illegal_state_change",
            EventAction::SubmissionClaimLost => "submission_claim_lost",
            EventAction::PendingLogsSuperseded => "pending_logs_superseded",
            EventAction::ReadVisibilityTimeout => "read_visibility_timeout",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
