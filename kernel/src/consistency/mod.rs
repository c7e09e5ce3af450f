// Read-After-Write Consistency
//
// Reads against a replicated backend may trail the caller's own writes.
// `wait_for_version` polls until the record reaches the version the
// caller just wrote, within a bounded retry budget.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{Version, VersionedSummaryLog};
use crate::store::{StoreError, SummaryLogStore};
use crate::telemetry::{EventAction, EventCategory};

/// Retry budget for `wait_for_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl ConsistencyConfig {
    /// Two seconds of polling in total.
    pub fn production() -> Self {
        Self {
            max_attempts: 20,
            retry_delay_ms: 100,
        }
    }

    pub fn test_profile() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 10,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self::production()
    }
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(
        "Timed out waiting for summary log {id} to reach version {expected} \
         after {attempts} attempts (last seen: {})",
        seen(.last_seen)
    )]
    Timeout {
        id: String,
        expected: Version,
        last_seen: Option<Version>,
        attempts: u32,
    },
}

fn seen(version: &Option<Version>) -> String {
    version.map_or_else(|| "none".to_string(), |v| v.to_string())
}

/// Poll `find_by_id` until the record is at `expected_version` or later.
///
/// A missing record counts as not yet visible. Store errors end the wait
/// immediately.
pub fn wait_for_version<S>(
    store: &S,
    id: &str,
    expected_version: Version,
    config: &ConsistencyConfig,
) -> Result<VersionedSummaryLog, ConsistencyError>
where
    S: SummaryLogStore + ?Sized,
{
    let attempts = config.max_attempts.max(1);
    let mut last_seen = None;

    for attempt in 1..=attempts {
        if let Some(record) = store.find_by_id(id)? {
            if record.version >= expected_version {
                return Ok(record);
            }
            last_seen = Some(record.version);
        }
        if attempt < attempts {
            thread::sleep(config.retry_delay());
        }
    }

    tracing::warn!(
        event.category = %EventCategory::Consistency,
        event.action = %EventAction::ReadVisibilityTimeout,
        event.reference = %id,
        expected_version,
        attempts,
        "summary log did not reach expected version in time"
    );

    Err(ConsistencyError::Timeout {
        id: id.to_string(),
        expected: expected_version,
        last_seen,
        attempts,
    })
}
