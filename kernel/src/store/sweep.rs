// Supersede Sweep
//
// Selection and retirement rules shared by both backends. The backends
// own the version-checked write; a candidate that lost its race is
// skipped, never retried.

use chrono::{DateTime, Utc};

use crate::record::{SummaryLog, Version, VersionedSummaryLog};
use crate::state::expiry::{ExpiryError, ExpiryPolicy};
use crate::state::SummaryLogStatus;
use crate::telemetry::{EventAction, EventCategory};

/// A record picked for retirement, pinned to the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SweepCandidate {
    pub id: String,
    pub version: Version,
}

/// `createdAt` of the newest upload. `None` turns the sweep into a no-op.
pub(crate) fn cutoff(anchor: Option<&VersionedSummaryLog>) -> Option<DateTime<Utc>> {
    anchor.and_then(|record| record.summary_log.created_at)
}

pub(crate) fn is_candidate(
    id: &str,
    log: &SummaryLog,
    organisation_id: &str,
    registration_id: &str,
    exclude_id: &str,
    cutoff: DateTime<Utc>,
) -> bool {
    id != exclude_id
        && log.belongs_to(organisation_id, registration_id)
        && log.status.is_supersedable()
        && log.created_at.is_some_and(|created| created <= cutoff)
}

/// The retired record, or `None` if `log` is no longer supersedable.
pub(crate) fn retired(
    log: &SummaryLog,
    now: DateTime<Utc>,
    expiry: &ExpiryPolicy,
) -> Result<Option<SummaryLog>, ExpiryError> {
    if !log.status.is_supersedable() {
        return Ok(None);
    }
    let mut next = log.clone();
    next.status = SummaryLogStatus::Superseded;
    next.expires_at = expiry.expires_at(SummaryLogStatus::Superseded, now)?;
    Ok(Some(next))
}

pub(crate) fn log_skipped(id: &str) {
    tracing::debug!(
        event.category = %EventCategory::Database,
        event.action = %EventAction::PendingLogsSuperseded,
        event.reference = %id,
        "supersede candidate changed concurrently, skipping"
    );
}

pub(crate) fn log_swept(organisation_id: &str, registration_id: &str, count: usize) {
    if count > 0 {
        let reference = format!("{organisation_id}/{registration_id}");
        tracing::info!(
            event.category = %EventCategory::Database,
            event.action = %EventAction::PendingLogsSuperseded,
            event.reference = %reference,
            "Superseded {count} pending summary logs for organisationId={organisation_id}, registrationId={registration_id}"
        );
    }
}
