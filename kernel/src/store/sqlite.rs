// SQLite Summary Log Store
//
// Durable backend. Each operation opens its own connection to a WAL
// journaled database file, so concurrent callers are serialized by
// SQLite's write lock rather than by anything in this process.
//
// One row per record: indexed columns for the predicates the store
// filters on, plus the full record as a JSON document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{ffi, params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};

use crate::config::StoreConfig;
use crate::invariants::InvariantEngine;
use crate::record::{SummaryLog, SummaryLogInsert, SummaryLogUpdate, Version, VersionedSummaryLog};
use crate::state::expiry::ExpiryPolicy;
use crate::store::{
    apply_update, conflict, guard, sortable_timestamp, sweep, Conflict, StoreError,
    SubmissionOutcome, SummaryLogStore,
};
use crate::validation::validate_id;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS summary_logs (
    id              TEXT PRIMARY KEY NOT NULL,
    version         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    organisation_id TEXT,
    registration_id TEXT,
    created_at      TEXT,
    submitted_at    TEXT,
    document        TEXT NOT NULL
);

-- At most one submitting summary log per organisation/registration
CREATE UNIQUE INDEX IF NOT EXISTS summary_logs_one_submitting
    ON summary_logs (organisation_id, registration_id)
    WHERE status = 'submitting';

CREATE INDEX IF NOT EXISTS summary_logs_org_reg_status
    ON summary_logs (organisation_id, registration_id, status, submitted_at);
";

const SELECT_BY_ID: &str = "SELECT id, version, document FROM summary_logs WHERE id = ?1";

const INSERT: &str = "
INSERT INTO summary_logs
    (id, version, status, organisation_id, registration_id, created_at, submitted_at, document)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const COMPARE_AND_SWAP: &str = "
UPDATE summary_logs
SET version = ?1, status = ?2, organisation_id = ?3, registration_id = ?4,
    submitted_at = ?5, document = ?6
WHERE id = ?7 AND version = ?8";

// Version check and sibling check folded into one statement.
const CLAIM_SUBMISSION: &str = "
UPDATE summary_logs
SET version = ?1, status = 'submitting', submitted_at = ?2, document = ?3
WHERE id = ?4 AND version = ?5 AND status = 'validated'
  AND NOT EXISTS (
    SELECT 1 FROM summary_logs AS sibling
    WHERE sibling.organisation_id = ?6
      AND sibling.registration_id = ?7
      AND sibling.status = 'submitting'
      AND sibling.id <> ?4
  )";

const SELECT_SUPERSEDABLE: &str = "
SELECT id, version, document FROM summary_logs
WHERE organisation_id = ?1 AND registration_id = ?2
  AND status IN ('preprocessing', 'validating', 'validated')
  AND id <> ?3";

const HAS_SUBMITTING: &str = "
SELECT EXISTS (
    SELECT 1 FROM summary_logs
    WHERE organisation_id = ?1 AND registration_id = ?2 AND status = 'submitting'
)";

const LATEST_SUBMITTED: &str = "
SELECT id, version, document FROM summary_logs
WHERE organisation_id = ?1 AND registration_id = ?2 AND status = 'submitted'
ORDER BY submitted_at DESC, id DESC
LIMIT 1";

/// Which constraint a failed write tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Violated {
    PrimaryKey,
    SubmittingSlot,
}

fn violated(err: &rusqlite::Error) -> Option<Violated> {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Some(Violated::PrimaryKey),
                ffi::SQLITE_CONSTRAINT_UNIQUE => Some(Violated::SubmittingSlot),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Indexed projection of a record.
struct Columns<'a> {
    status: &'static str,
    organisation_id: Option<&'a str>,
    registration_id: Option<&'a str>,
    created_at: Option<String>,
    submitted_at: Option<String>,
    document: String,
}

impl<'a> Columns<'a> {
    fn of(log: &'a SummaryLog) -> Result<Self, StoreError> {
        Ok(Self {
            status: log.status.as_str(),
            organisation_id: log.organisation_id.as_deref(),
            registration_id: log.registration_id.as_deref(),
            created_at: log.created_at.as_ref().map(sortable_timestamp),
            submitted_at: log.submitted_at.as_ref().map(sortable_timestamp),
            document: serde_json::to_string(log)?,
        })
    }
}

type RawRow = (String, i64, String);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode((id, version, document): RawRow) -> Result<VersionedSummaryLog, StoreError> {
    let version = Version::try_from(version)
        .map_err(|_| StoreError::Backend(format!("negative version {version} stored for {id}")))?;
    Ok(VersionedSummaryLog {
        id,
        version,
        summary_log: serde_json::from_str(&document)?,
    })
}

fn fetch(conn: &Connection, id: &str) -> Result<Option<VersionedSummaryLog>, StoreError> {
    conn.query_row(SELECT_BY_ID, params![id], raw_row)
        .optional()?
        .map(decode)
        .transpose()
}

/// Write `next` only if the row is still at `expected`. `false` if it moved.
fn compare_and_swap(
    conn: &Connection,
    next: &VersionedSummaryLog,
    columns: &Columns<'_>,
    expected: Version,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        COMPARE_AND_SWAP,
        params![
            next.version,
            columns.status,
            columns.organisation_id,
            columns.registration_id,
            columns.submitted_at,
            columns.document,
            next.id,
            expected,
        ],
    )?;
    Ok(changed == 1)
}

#[derive(Debug)]
pub struct SqliteSummaryLogStore {
    path: PathBuf,
    busy_timeout: Duration,
    invariants: InvariantEngine,
    expiry: ExpiryPolicy,
}

impl SqliteSummaryLogStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>, config: &StoreConfig) -> Result<Self, StoreError> {
        config.expiry.validate()?;
        let store = Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            invariants: InvariantEngine::standard(),
            expiry: config.expiry.clone(),
        };

        let conn = store.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %store.path.display(), journal_mode = %mode, "opened summary log store");
        conn.execute_batch(SCHEMA)?;

        Ok(store)
    }

    pub fn with_invariants(mut self, invariants: InvariantEngine) -> Self {
        self.invariants = invariants;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    /// The row moved between read and write: report what it moved to.
    fn lost_race(conn: &Connection, id: &str, attempted: Version) -> StoreError {
        match fetch(conn, id) {
            Ok(Some(latest)) => conflict(Conflict::StaleVersion {
                id: id.to_string(),
                attempted,
                current: latest.version,
            }),
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(err) => err,
        }
    }
}

fn in_progress(log: &SummaryLog) -> StoreError {
    let (org, reg) = log.org_reg().unwrap_or_default();
    conflict(Conflict::SubmissionInProgress {
        organisation_id: org.to_string(),
        registration_id: reg.to_string(),
    })
}

impl SummaryLogStore for SqliteSummaryLogStore {
    fn insert(&self, id: &str, data: &SummaryLogInsert) -> Result<(), StoreError> {
        let id = validate_id(id)?;
        data.validate()?;

        let next = VersionedSummaryLog {
            id: id.to_string(),
            version: 1,
            summary_log: data.clone().into_summary_log(Utc::now()),
        };
        self.invariants.evaluate(None, &next)?;
        let columns = Columns::of(&next.summary_log)?;

        let conn = self.connect()?;
        let result = conn.execute(
            INSERT,
            params![
                id,
                next.version,
                columns.status,
                columns.organisation_id,
                columns.registration_id,
                columns.created_at,
                columns.submitted_at,
                columns.document,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) => match violated(&err) {
                Some(Violated::PrimaryKey) => {
                    Err(conflict(Conflict::DuplicateId { id: id.to_string() }))
                }
                Some(Violated::SubmittingSlot) => Err(in_progress(&next.summary_log)),
                None => Err(err.into()),
            },
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

        let conn = self.connect()?;
        let current = fetch(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.version != expected_version {
            return Err(conflict(Conflict::StaleVersion {
                id: id.to_string(),
                attempted: expected_version,
                current: current.version,
            }));
        }

        let next = VersionedSummaryLog {
            id: id.to_string(),
            version: expected_version + 1,
            summary_log: apply_update(&current, updates).map_err(conflict)?,
        };
        self.invariants.evaluate(Some(&current), &next)?;
        let columns = Columns::of(&next.summary_log)?;

        match compare_and_swap(&conn, &next, &columns, expected_version) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Self::lost_race(&conn, id, expected_version)),
            Err(err) if violated(&err) == Some(Violated::SubmittingSlot) => {
                Err(in_progress(&next.summary_log))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn find_by_id(&self, id: &str) -> Result<Option<VersionedSummaryLog>, StoreError> {
        let id = validate_id(id)?;
        let conn = self.connect()?;
        fetch(&conn, id)
    }

    fn transition_to_submitting_exclusive(
        &self,
        id: &str,
    ) -> Result<SubmissionOutcome, StoreError> {
        let id = validate_id(id)?;
        let conn = self.connect()?;
        let current = fetch(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        guard::ensure_validated(&current).map_err(conflict)?;

        let now = Utc::now();
        let next = VersionedSummaryLog {
            id: id.to_string(),
            version: current.version + 1,
            summary_log: guard::claimed(&current.summary_log, now, &self.expiry)?,
        };
        self.invariants.evaluate(Some(&current), &next)?;
        let columns = Columns::of(&next.summary_log)?;

        let result = conn.execute(
            CLAIM_SUBMISSION,
            params![
                next.version,
                columns.submitted_at,
                columns.document,
                id,
                current.version,
                current.summary_log.organisation_id,
                current.summary_log.registration_id,
            ],
        );

        match result {
            Ok(1) => Ok(SubmissionOutcome::Claimed {
                summary_log: next.summary_log,
                version: next.version,
            }),
            Ok(_) => match fetch(&conn, id)? {
                None => Err(StoreError::NotFound(id.to_string())),
                Some(latest) if latest.version != current.version => {
                    Err(conflict(Conflict::StaleVersion {
                        id: id.to_string(),
                        attempted: current.version,
                        current: latest.version,
                    }))
                }
                Some(_) => {
                    guard::log_claim_lost(id);
                    Ok(SubmissionOutcome::AlreadySubmitting)
                }
            },
            Err(err) if violated(&err) == Some(Violated::SubmittingSlot) => {
                guard::log_claim_lost(id);
                Ok(SubmissionOutcome::AlreadySubmitting)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn supersede_pending_logs(
        &self,
        organisation_id: &str,
        registration_id: &str,
        exclude_id: &str,
    ) -> Result<usize, StoreError> {
        let exclude_id = validate_id(exclude_id)?;
        let conn = self.connect()?;
        let Some(cutoff) = sweep::cutoff(fetch(&conn, exclude_id)?.as_ref()) else {
            return Ok(0);
        };

        let candidates = {
            let mut stmt = conn.prepare(SELECT_SUPERSEDABLE)?;
            let rows = stmt.query_map(params![organisation_id, registration_id, exclude_id], raw_row)?;
            let mut candidates = Vec::new();
            for row in rows {
                let record = decode(row?)?;
                if sweep::is_candidate(
                    &record.id,
                    &record.summary_log,
                    organisation_id,
                    registration_id,
                    exclude_id,
                    cutoff,
                ) {
                    candidates.push(record);
                }
            }
            candidates
        };

        let now = Utc::now();
        let mut superseded = 0;
        for candidate in candidates {
            let Some(summary_log) = sweep::retired(&candidate.summary_log, now, &self.expiry)? else {
                sweep::log_skipped(&candidate.id);
                continue;
            };
            let next = VersionedSummaryLog {
                id: candidate.id.clone(),
                version: candidate.version + 1,
                summary_log,
            };
            self.invariants.evaluate(Some(&candidate), &next)?;
            let columns = Columns::of(&next.summary_log)?;

            if compare_and_swap(&conn, &next, &columns, candidate.version)? {
                superseded += 1;
            } else {
                sweep::log_skipped(&candidate.id);
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
        let conn = self.connect()?;
        Ok(conn.query_row(
            HAS_SUBMITTING,
            params![organisation_id, registration_id],
            |row| row.get(0),
        )?)
    }

    fn find_latest_submitted_for_org_reg(
        &self,
        organisation_id: &str,
        registration_id: &str,
    ) -> Result<Option<VersionedSummaryLog>, StoreError> {
        let conn = self.connect()?;
        conn.query_row(
            LATEST_SUBMITTED,
            params![organisation_id, registration_id],
            raw_row,
        )
        .optional()?
        .map(decode)
        .transpose()
    }
}
