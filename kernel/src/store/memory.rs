// In-Memory Summary Log Store
//
// Test double with the same contract as the durable backend. A single
// id -> record map stands in for the storage engine, and every mutation
// goes through `compare_and_swap`, which also plays the role of the
// partial unique index on submitting records.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::invariants::InvariantEngine;
use crate::record::{SummaryLog, SummaryLogInsert, SummaryLogUpdate, Version, VersionedSummaryLog};
use crate::state::expiry::ExpiryPolicy;
use crate::state::SummaryLogStatus;
use crate::store::sweep::{self, SweepCandidate};
use crate::store::{
    apply_update, conflict, guard, Conflict, StoreError, SubmissionOutcome, SummaryLogStore,
};
use crate::validation::validate_id;

#[derive(Debug, Clone)]
struct Stored {
    version: Version,
    summary_log: SummaryLog,
}

impl Stored {
    fn versioned(&self, id: &str) -> VersionedSummaryLog {
        VersionedSummaryLog {
            id: id.to_string(),
            version: self.version,
            summary_log: self.summary_log.clone(),
        }
    }
}

/// What the write expects to find under the id.
#[derive(Debug, Clone, Copy)]
enum Precondition {
    Absent,
    Version(Version),
}

#[derive(Debug)]
enum Swap {
    Applied(VersionedSummaryLog),
    Exists,
    Missing,
    Stale {
        current: Version,
    },
    /// A sibling in the same pair is already submitting.
    Collision {
        organisation_id: String,
        registration_id: String,
    },
}

#[derive(Debug)]
pub struct InMemorySummaryLogStore {
    records: Mutex<HashMap<String, Stored>>,
    invariants: InvariantEngine,
    expiry: ExpiryPolicy,
}

impl InMemorySummaryLogStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            invariants: InvariantEngine::standard(),
            expiry: ExpiryPolicy::default_policy(),
        }
    }

    pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_invariants(mut self, invariants: InvariantEngine) -> Self {
        self.invariants = invariants;
        self
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Stored>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".into()))
    }

    /// The one mutation path: check the precondition, build the next
    /// record, refuse a second submitter, check invariants, commit.
    fn compare_and_swap<F>(
        &self,
        id: &str,
        precondition: Precondition,
        apply: F,
    ) -> Result<Swap, StoreError>
    where
        F: FnOnce(Option<&VersionedSummaryLog>) -> Result<SummaryLog, StoreError>,
    {
        let mut records = self.lock()?;
        let previous = records.get(id).map(|stored| stored.versioned(id));

        let next_version = match (precondition, &previous) {
            (Precondition::Absent, None) => 1,
            (Precondition::Absent, Some(_)) => return Ok(Swap::Exists),
            (Precondition::Version(_), None) => return Ok(Swap::Missing),
            (Precondition::Version(expected), Some(current)) if current.version != expected => {
                return Ok(Swap::Stale {
                    current: current.version,
                })
            }
            (Precondition::Version(_), Some(current)) => current.version + 1,
        };

        let summary_log = apply(previous.as_ref())?;

        let siblings = records
            .iter()
            .map(|(other_id, stored)| (other_id.as_str(), &stored.summary_log));
        if guard::collides(id, &summary_log, siblings) {
            let (org, reg) = summary_log.org_reg().unwrap_or_default();
            return Ok(Swap::Collision {
                organisation_id: org.to_string(),
                registration_id: reg.to_string(),
            });
        }

        let next = VersionedSummaryLog {
            id: id.to_string(),
            version: next_version,
            summary_log,
        };
        self.invariants.evaluate(previous.as_ref(), &next)?;

        records.insert(
            id.to_string(),
            Stored {
                version: next.version,
                summary_log: next.summary_log.clone(),
            },
        );
        Ok(Swap::Applied(next))
    }
}

impl Default for InMemorySummaryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected(swap: Swap) -> StoreError {
    StoreError::Backend(format!("unexpected compare-and-swap outcome: {swap:?}"))
}

fn in_progress(organisation_id: String, registration_id: String) -> StoreError {
    conflict(Conflict::SubmissionInProgress {
        organisation_id,
        registration_id,
    })
}

impl SummaryLogStore for InMemorySummaryLogStore {
    fn insert(&self, id: &str, data: &SummaryLogInsert) -> Result<(), StoreError> {
        let id = validate_id(id)?;
        data.validate()?;

        let now = Utc::now();
        match self.compare_and_swap(id, Precondition::Absent, |_| {
            Ok(data.clone().into_summary_log(now))
        })? {
            Swap::Applied(_) => Ok(()),
            Swap::Exists => Err(conflict(Conflict::DuplicateId { id: id.to_string() })),
            Swap::Collision {
                organisation_id,
                registration_id,
            } => Err(in_progress(organisation_id, registration_id)),
            other => Err(unexpected(other)),
        }
    }

    fn update(
        &self,
        id: &str,
        expected_version: Version,
        updates: &SummaryLogUpdate,
    ) -> Result<(), StoreError> {
        let id = validate_id(id)?;
        updates.validate()?;

        let outcome = self.compare_and_swap(id, Precondition::Version(expected_version), |current| {
            let current = current.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            apply_update(current, updates).map_err(conflict)
        })?;

        match outcome {
            Swap::Applied(_) => Ok(()),
            Swap::Missing => Err(StoreError::NotFound(id.to_string())),
            Swap::Stale { current } => Err(conflict(Conflict::StaleVersion {
                id: id.to_string(),
                attempted: expected_version,
                current,
            })),
            Swap::Collision {
                organisation_id,
                registration_id,
            } => Err(in_progress(organisation_id, registration_id)),
            other => Err(unexpected(other)),
        }
    }

    fn find_by_id(&self, id: &str) -> Result<Option<VersionedSummaryLog>, StoreError> {
        let id = validate_id(id)?;
        Ok(self.lock()?.get(id).map(|stored| stored.versioned(id)))
    }

    fn transition_to_submitting_exclusive(
        &self,
        id: &str,
    ) -> Result<SubmissionOutcome, StoreError> {
        let id = validate_id(id)?;
        let current = self
            .find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        guard::ensure_validated(&current).map_err(conflict)?;

        let now = Utc::now();
        let outcome = self.compare_and_swap(id, Precondition::Version(current.version), |existing| {
            let existing = existing.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            guard::ensure_validated(existing).map_err(conflict)?;
            Ok(guard::claimed(&existing.summary_log, now, &self.expiry)?)
        })?;

        match outcome {
            Swap::Applied(next) => Ok(SubmissionOutcome::Claimed {
                summary_log: next.summary_log,
                version: next.version,
            }),
            Swap::Collision { .. } => {
                guard::log_claim_lost(id);
                Ok(SubmissionOutcome::AlreadySubmitting)
            }
            Swap::Stale { current: now_at } => Err(conflict(Conflict::StaleVersion {
                id: id.to_string(),
                attempted: current.version,
                current: now_at,
            })),
            Swap::Missing => Err(StoreError::NotFound(id.to_string())),
            other => Err(unexpected(other)),
        }
    }

    fn supersede_pending_logs(
        &self,
        organisation_id: &str,
        registration_id: &str,
        exclude_id: &str,
    ) -> Result<usize, StoreError> {
        let exclude_id = validate_id(exclude_id)?;
        let Some(cutoff) = sweep::cutoff(self.find_by_id(exclude_id)?.as_ref()) else {
            return Ok(0);
        };

        let candidates: Vec<SweepCandidate> = self
            .lock()?
            .iter()
            .filter(|(id, stored)| {
                sweep::is_candidate(
                    id,
                    &stored.summary_log,
                    organisation_id,
                    registration_id,
                    exclude_id,
                    cutoff,
                )
            })
            .map(|(id, stored)| SweepCandidate {
                id: id.clone(),
                version: stored.version,
            })
            .collect();

        let now = Utc::now();
        let mut superseded = 0;
        for candidate in candidates {
            let outcome = self.compare_and_swap(
                &candidate.id,
                Precondition::Version(candidate.version),
                |existing| {
                    let existing =
                        existing.ok_or_else(|| StoreError::NotFound(candidate.id.clone()))?;
                    sweep::retired(&existing.summary_log, now, &self.expiry)?.ok_or_else(|| {
                        StoreError::Conflict(Conflict::IllegalTransition {
                            id: candidate.id.clone(),
                            from: existing.summary_log.status,
                            to: SummaryLogStatus::Superseded,
                        })
                    })
                },
            );

            match outcome {
                Ok(Swap::Applied(_)) => superseded += 1,
                Ok(_) | Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {
                    sweep::log_skipped(&candidate.id)
                }
                Err(err) => return Err(err),
            }
        }

        sweep::log_swept(organisation_id, registration_id, superseded);
        Ok(superseded)
    }

    fn has_submitting_log(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.lock()?.values().any(|stored| {
            stored.summary_log.status == SummaryLogStatus::Submitting
                && stored.summary_log.belongs_to(organisation_id, registration_id)
        }))
    }

    fn find_latest_submitted_for_org_reg(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<Option<VersionedSummaryLog>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(_, stored)| {
                stored.summary_log.status == SummaryLogStatus::Submitted
                    && stored.summary_log.belongs_to(organisation_id, registration_id)
            })
            .max_by(|(a_id, a), (b_id, b)| {
                a.summary_log
                    .submitted_at
                    .cmp(&b.summary_log.submitted_at)
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, stored)| stored.versioned(id)))
    }
}
