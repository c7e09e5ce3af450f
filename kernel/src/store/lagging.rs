// Replica Lag Store
//
// Wraps any store and makes reads trail writes: after a write to an id,
// the next `lag_reads` reads of that id see the record as it was before
// the write. Stands in for a replicated backend when exercising
// read-after-write handling.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::record::{SummaryLogInsert, SummaryLogUpdate, Version, VersionedSummaryLog};
use crate::store::{StoreError, SubmissionOutcome, SummaryLogStore};

#[derive(Debug)]
struct Lagged {
    snapshot: Option<VersionedSummaryLog>,
    remaining: usize,
}

#[derive(Debug)]
pub struct ReplicaLagStore<S> {
    inner: S,
    lag_reads: usize,
    lagging: Mutex<HashMap<String, Lagged>>,
}

impl<S: SummaryLogStore> ReplicaLagStore<S> {
    pub fn new(inner: S, lag_reads: usize) -> Self {
        Self {
            inner,
            lag_reads,
            lagging: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Lagged>>, StoreError> {
        self.lagging
            .lock()
            .map_err(|_| StoreError::Backend("replica lag lock poisoned".into()))
    }

    /// Run `write` against the primary, leaving the previous state visible.
    fn lag_behind<T, F>(&self, id: &str, write: F) -> Result<T, StoreError>
    where
        F: FnOnce(&S) -> Result<T, StoreError>,
    {
        let snapshot = self.inner.find_by_id(id)?;
        let out = write(&self.inner)?;
        if self.lag_reads > 0 {
            self.lock()?.insert(
                id.to_string(),
                Lagged {
                    snapshot,
                    remaining: self.lag_reads,
                },
            );
        }
        Ok(out)
    }
}

impl<S: SummaryLogStore> SummaryLogStore for ReplicaLagStore<S> {
    fn insert(&self, id: &str, data: &SummaryLogInsert) -> Result<(), StoreError> {
        self.lag_behind(id, |inner| inner.insert(id, data))
    }

    fn update(
        &self,
        id: &str,
        expected_version: Version,
        updates: &SummaryLogUpdate,
    ) -> Result<(), StoreError> {
        self.lag_behind(id, |inner| inner.update(id, expected_version, updates))
    }

    fn find_by_id(&self, id: &str) -> Result<Option<VersionedSummaryLog>, StoreError> {
        {
            let mut lagging = self.lock()?;
            if let Some(lagged) = lagging.get_mut(id) {
                lagged.remaining -= 1;
                let snapshot = lagged.snapshot.clone();
                if lagged.remaining == 0 {
                    lagging.remove(id);
                }
                return Ok(snapshot);
            }
        }
        self.inner.find_by_id(id)
    }

    fn transition_to_submitting_exclusive(
        &self,
        id: &str,
    ) -> Result<SubmissionOutcome, StoreError> {
        self.lag_behind(id, |inner| inner.transition_to_submitting_exclusive(id))
    }

    // Bulk paths read the primary.
    fn supersede_pending_logs(
        &self,
        organisation_id: &str,
        registration_id: &str,
        exclude_id: &str,
    ) -> Result<usize, StoreError> {
        self.inner
            .supersede_pending_logs(organisation_id, registration_id, exclude_id)
    }

    fn has_submitting_log(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner.has_submitting_log(organisation_id, registration_id)
    }

    fn find_latest_submitted_for_org_reg(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<Option<VersionedSummaryLog>, StoreError> {
        self.inner
            .find_latest_submitted_for_org_reg(organisation_id, registration_id)
    }
}
