// Expiry Policy
//
// Maps a lifecycle status to the instant a summary log becomes stale.
// The store only stamps `expiresAt`; nothing here deletes records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::SummaryLogStatus;

/// Longest TTL a policy may configure: ten years.
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpiryError {
    #[error("expiry {field} must be between 0 and {} seconds, got {secs}", MAX_TTL_SECS)]
    TtlOutOfRange { field: &'static str, secs: i64 },

    #[error("expiry for status {status} overflows: {secs} seconds after {now}")]
    Overflow {
        status: SummaryLogStatus,
        secs: i64,
        now: DateTime<Utc>,
    },
}

/// Time-to-live per status group, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryPolicy {
    /// preprocessing, validating
    pub in_flight_ttl_secs: i64,

    /// validated, invalid, rejected
    pub reviewable_ttl_secs: i64,

    pub submitting_ttl_secs: i64,

    pub superseded_ttl_secs: i64,
}

impl ExpiryPolicy {
    /// Default built-in policy.
    pub fn default_policy() -> Self {
        Self {
            in_flight_ttl_secs: 24 * 60 * 60,
            reviewable_ttl_secs: 7 * 24 * 60 * 60,
            submitting_ttl_secs: 20 * 60,
            superseded_ttl_secs: 24 * 60 * 60,
        }
    }

    /// Reject negative TTLs and TTLs beyond `MAX_TTL_SECS`.
    pub fn validate(&self) -> Result<(), ExpiryError> {
        let fields = [
            ("in_flight_ttl_secs", self.in_flight_ttl_secs),
            ("reviewable_ttl_secs", self.reviewable_ttl_secs),
            ("submitting_ttl_secs", self.submitting_ttl_secs),
            ("superseded_ttl_secs", self.superseded_ttl_secs),
        ];
        for (field, secs) in fields {
            if !(0..=MAX_TTL_SECS).contains(&secs) {
                return Err(ExpiryError::TtlOutOfRange { field, secs });
            }
        }
        Ok(())
    }

    /// Compute `expiresAt` for a record entering `status` at `now`.
    ///
    /// Submitted logs are kept indefinitely and get `None`.
    pub fn expires_at(
        &self,
        status: SummaryLogStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ExpiryError> {
        use SummaryLogStatus::*;

        let ttl = match status {
            Preprocessing | Validating => self.in_flight_ttl_secs,
            Validated | Invalid | Rejected => self.reviewable_ttl_secs,
            Submitting => self.submitting_ttl_secs,
            Superseded => self.superseded_ttl_secs,
            Submitted => return Ok(None),
        };

        Duration::try_seconds(ttl)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(Some)
            .ok_or(ExpiryError::Overflow {
                status,
                secs: ttl,
                now,
            })
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}
