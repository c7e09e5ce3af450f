// Exclusive-Submission Guard
//
// Backend-independent half of the submission claim: the precondition on
// the target record and the shape of the claimed record. The atomic
// "no sibling is submitting" check lives in each backend's write path.

use chrono::{DateTime, Utc};

use crate::record::{SummaryLog, VersionedSummaryLog};
use crate::state::expiry::{ExpiryError, ExpiryPolicy};
use crate::state::SummaryLogStatus;
use crate::store::Conflict;
use crate::telemetry::{EventAction, EventCategory};

/// Only validated records can be claimed.
pub(crate) fn ensure_validated(record: &VersionedSummaryLog) -> Result<(), Conflict> {
    match record.summary_log.status {
        SummaryLogStatus::Validated => Ok(()),
        current => Err(Conflict::NotValidated {
            id: record.id.clone(),
            current,
        }),
    }
}

/// The record as it looks once claimed at `now`.
pub(crate) fn claimed(
    log: &SummaryLog,
    now: DateTime<Utc>,
    expiry: &ExpiryPolicy,
) -> Result<SummaryLog, ExpiryError> {
    let mut next = log.clone();
    next.status = SummaryLogStatus::Submitting;
    next.submitted_at = Some(now);
    next.expires_at = expiry.expires_at(SummaryLogStatus::Submitting, now)?;
    next.failure_reason = None;
    Ok(next)
}

/// Would writing `next` for `id` put a second submitting record in its pair?
pub(crate) fn collides<'a, I>(id: &str, next: &SummaryLog, others: I) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a SummaryLog)>,
{
    if next.status != SummaryLogStatus::Submitting {
        return false;
    }
    let Some((org, reg)) = next.org_reg() else {
        return false;
    };
    others.into_iter().any(|(other_id, other)| {
        other_id != id && other.status == SummaryLogStatus::Submitting && other.belongs_to(org, reg)
    })
}

pub(crate) fn log_claim_lost(id: &str) {
    tracing::info!(
        event.category = %EventCategory::Database,
        event.action = %EventAction::SubmissionClaimLost,
        event.reference = %id,
        "another summary log for the same organisation/registration is already submitting"
    );
}
