// Summary Log Storage Abstraction
//
// Defines the persistence contract consumed by upload handlers,
// validation workers and the submission workflow.
//
// Implementations may persist to disk, databases, or memory, but must
// all pass the same contract suite.

use crate::invariants::InvariantViolation;
use crate::record::{SummaryLog, SummaryLogInsert, SummaryLogUpdate, Version, VersionedSummaryLog};
use crate::state::expiry::ExpiryError;
use crate::state::{check_transition, SummaryLogStatus};
use crate::telemetry::{EventAction, EventCategory};
use crate::validation::ValidationError;

pub mod guard;
pub mod lagging;
pub mod memory;
pub mod sqlite;
pub mod sweep;

pub use lagging::ReplicaLagStore;
pub use memory::InMemorySummaryLogStore;
pub use sqlite::SqliteSummaryLogStore;

/// A write lost against concurrent or prior state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("Summary log with id {id} already exists")]
    DuplicateId { id: String },

    #[error(
        "Version conflict: attempted to update with version {attempted} but current version is {current}"
    )]
    StaleVersion {
        id: String,
        attempted: Version,
        current: Version,
    },

    #[error("A submission is in progress. Please wait.")]
    SubmissionInProgress {
        organisation_id: String,
        registration_id: String,
    },

    #[error("Summary log must be validated before submission. Current status: {current}")]
    NotValidated {
        id: String,
        current: SummaryLogStatus,
    },

    #[error("Cannot transition summary log from {from} to {to}")]
    IllegalTransition {
        id: String,
        from: SummaryLogStatus,
        to: SummaryLogStatus,
    },
}

impl Conflict {
    /// Record id, or the org/reg pair for pair-scoped conflicts.
    pub fn reference(&self) -> String {
        match self {
            Conflict::DuplicateId { id }
            | Conflict::StaleVersion { id, .. }
            | Conflict::NotValidated { id, .. }
            | Conflict::IllegalTransition { id, .. } => id.clone(),
            Conflict::SubmissionInProgress {
                organisation_id,
                registration_id,
            } => format!("{organisation_id}/{registration_id}"),
        }
    }

    pub fn action(&self) -> EventAction {
        match self {
            Conflict::DuplicateId { .. } => EventAction::DuplicateIdRejected,
            Conflict::StaleVersion { .. } => EventAction::VersionConflictDetected,
            Conflict::SubmissionInProgress { .. } => EventAction::SubmissionInProgress,
            Conflict::NotValidated { .. } | Conflict::IllegalTransition { .. } => {
                EventAction::IllegalStateChange
            }
        }
    }
}

/// Errors surfaced across the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Summary log with id {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Expiry(#[from] ExpiryError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored document could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// HTTP-style class of the error.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Validation(_) => 422,
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::Invariant(_)
            | StoreError::Expiry(_)
            | StoreError::Sqlite(_)
            | StoreError::Serialization(_)
            | StoreError::Backend(_) => 500,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn as_conflict(&self) -> Option<&Conflict> {
        match self {
            StoreError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Outcome of `transition_to_submitting_exclusive`.
///
/// Losing the race is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Claimed {
        summary_log: SummaryLog,
        version: Version,
    },
    AlreadySubmitting,
}

impl SubmissionOutcome {
    pub fn success(&self) -> bool {
        matches!(self, SubmissionOutcome::Claimed { .. })
    }

    pub fn version(&self) -> Option<Version> {
        match self {
            SubmissionOutcome::Claimed { version, .. } => Some(*version),
            SubmissionOutcome::AlreadySubmitting => None,
        }
    }
}

/// Storage backend for summary logs.
///
/// Properties required from implementations:
/// - CAS semantics on `(id, version)` for every mutation
/// - At most one `submitting` record per org/reg pair, for every write path
/// - No physical deletes
///
/// Implementations MUST NOT:
/// - Auto-retry a write conflict
/// - Partially apply a rejected write
pub trait SummaryLogStore: Send + Sync {
    /// Persist a new record at version 1.
    fn insert(&self, id: &str, data: &SummaryLogInsert) -> Result<(), StoreError>;

    /// Apply `updates` only if the stored version equals `expected_version`.
    fn update(
        &self,
        id: &str,
        expected_version: Version,
        updates: &SummaryLogUpdate,
    ) -> Result<(), StoreError>;

    /// Pure read. May lag recent writes on replicated backends.
    fn find_by_id(&self, id: &str) -> Result<Option<VersionedSummaryLog>, StoreError>;

    /// Claim the org/reg pair's single submission slot for `id`.
    fn transition_to_submitting_exclusive(&self, id: &str)
        -> Result<SubmissionOutcome, StoreError>;

    /// Retire pending records of the pair that are no newer than `exclude_id`.
    ///
    /// Returns the number of records actually transitioned.
    fn supersede_pending_logs(
        &self,
        organisation_id: &str,
        registration_id: &str,
        exclude_id: &str,
    ) -> Result<usize, StoreError>;

    fn has_submitting_log(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<bool, StoreError>;

    /// Most recently submitted record of the pair, by `submittedAt`.
    fn find_latest_submitted_for_org_reg(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<Option<VersionedSummaryLog>, StoreError>;

    /// Pre-insert check: fails 409 while a sibling submission is in flight.
    fn check_for_submitting_log(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<(), StoreError> {
        if self.has_submitting_log(organisation_id, registration_id)? {
            return Err(conflict(Conflict::SubmissionInProgress {
                organisation_id: organisation_id.to_string(),
                registration_id: registration_id.to_string(),
            }));
        }
        Ok(())
    }
}

impl<S: SummaryLogStore + ?Sized> SummaryLogStore for std::sync::Arc<S> {
    fn insert(&self, id: &str, data: &SummaryLogInsert) -> Result<(), StoreError> {
        (**self).insert(id, data)
    }

    fn update(
        &self,
        id: &str,
        expected_version: Version,
        updates: &SummaryLogUpdate,
    ) -> Result<(), StoreError> {
        (**self).update(id, expected_version, updates)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<VersionedSummaryLog>, StoreError> {
        (**self).find_by_id(id)
    }

    fn transition_to_submitting_exclusive(
        &self,
        id: &str,
    ) -> Result<SubmissionOutcome, StoreError> {
        (**self).transition_to_submitting_exclusive(id)
    }

    fn supersede_pending_logs(
        &self,
        organisation_id: &str,
        registration_id: &str,
        exclude_id: &str,
    ) -> Result<usize, StoreError> {
        (**self).supersede_pending_logs(organisation_id, registration_id, exclude_id)
    }

    fn has_submitting_log(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<bool, StoreError> {
        (**self).has_submitting_log(organisation_id, registration_id)
    }

    fn find_latest_submitted_for_org_reg(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<Option<VersionedSummaryLog>, StoreError> {
        (**self).find_latest_submitted_for_org_reg(organisation_id, registration_id)
    }
}

/// Log a conflict with its metadata and wrap it for the caller.
pub(crate) fn conflict(conflict: Conflict) -> StoreError {
    let reference = conflict.reference();
    let action = conflict.action();
    match &conflict {
        Conflict::StaleVersion { .. } => tracing::error!(
            event.category = %EventCategory::Database,
            event.action = %action,
            event.reference = %reference,
            "Version conflict detected for summary log {reference}: {conflict}"
        ),
        _ => tracing::warn!(
            event.category = %EventCategory::Database,
            event.action = %action,
            event.reference = %reference,
            "{conflict}"
        ),
    }
    StoreError::Conflict(conflict)
}

/// Compute the record an update produces, enforcing the status machine.
pub(crate) fn apply_update(
    current: &VersionedSummaryLog,
    updates: &SummaryLogUpdate,
) -> Result<SummaryLog, Conflict> {
    if let Some(to) = updates.status {
        let from = current.summary_log.status;
        check_transition(from, to).map_err(|_| Conflict::IllegalTransition {
            id: current.id.clone(),
            from,
            to,
        })?;
    }
    Ok(updates.merge_into(&current.summary_log))
}

/// Stable, lexically sortable timestamp encoding for indexed columns.
pub(crate) fn sortable_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
