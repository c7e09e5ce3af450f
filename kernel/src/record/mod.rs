// Summary Log Records
//
// Entity shape of a summary log, the typed write payloads, and the
// versioned envelope returned by reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::{SummaryLogStatus, UploadStatus};

/// Optimistic concurrency counter. `1` at insert.
pub type Version = u64;

/// Where a completed upload can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub bucket: String,
    pub key: String,
}

impl FileLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// The uploaded file, keyed on its upload status.
///
/// Only a complete upload has a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SummaryLogFile {
    Pending {
        id: String,
        name: String,
    },
    Rejected {
        id: String,
        name: String,
    },
    Complete {
        id: String,
        name: String,
        location: FileLocation,
    },
}

impl SummaryLogFile {
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        SummaryLogFile::Pending {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn rejected(id: impl Into<String>, name: impl Into<String>) -> Self {
        SummaryLogFile::Rejected {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn complete(
        id: impl Into<String>,
        name: impl Into<String>,
        location: FileLocation,
    ) -> Self {
        SummaryLogFile::Complete {
            id: id.into(),
            name: name.into(),
            location,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SummaryLogFile::Pending { id, .. }
            | SummaryLogFile::Rejected { id, .. }
            | SummaryLogFile::Complete { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SummaryLogFile::Pending { name, .. }
            | SummaryLogFile::Rejected { name, .. }
            | SummaryLogFile::Complete { name, .. } => name,
        }
    }

    pub fn upload_status(&self) -> UploadStatus {
        match self {
            SummaryLogFile::Pending { .. } => UploadStatus::Pending,
            SummaryLogFile::Rejected { .. } => UploadStatus::Rejected,
            SummaryLogFile::Complete { .. } => UploadStatus::Complete,
        }
    }

    pub fn location(&self) -> Option<&FileLocation> {
        match self {
            SummaryLogFile::Complete { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// A stored summary log, without its id and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryLog {
    pub status: SummaryLogStatus,
    pub file: SummaryLogFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organisation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loads: Option<Value>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl SummaryLog {
    /// The org/reg pair, when both halves are present.
    pub fn org_reg(&self) -> Option<(&str, &str)> {
        match (&self.organisation_id, &self.registration_id) {
            (Some(org), Some(reg)) => Some((org.as_str(), reg.as_str())),
            _ => None,
        }
    }

    pub fn belongs_to(&self, organisation_id: &str, registration_id: &str) -> bool {
        self.org_reg() == Some((organisation_id, registration_id))
    }
}

/// Result of a read: the record plus its current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedSummaryLog {
    pub id: String,
    pub version: Version,
    pub summary_log: SummaryLog,
}

/// Fresh random id for a new summary log.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Payload accepted by `insert`.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryLogInsert {
    pub status: SummaryLogStatus,
    pub file: SummaryLogFile,
    pub organisation_id: Option<String>,
    pub registration_id: Option<String>,
    pub failure_reason: Option<String>,
    pub validation: Option<Value>,
    pub loads: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Stamped by the store when absent.
    pub created_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl SummaryLogInsert {
    pub fn new(status: SummaryLogStatus, file: SummaryLogFile) -> Self {
        Self {
            status,
            file,
            organisation_id: None,
            registration_id: None,
            failure_reason: None,
            validation: None,
            loads: None,
            expires_at: None,
            created_at: None,
            submitted_at: None,
        }
    }

    /// A new upload, starting in the status its file's outcome implies.
    pub fn for_upload(file: SummaryLogFile) -> Self {
        let status = file.upload_status().initial_status();
        Self::new(status, file)
    }

    pub fn with_org_reg(
        mut self,
        organisation_id: impl Into<String>,
        registration_id: impl Into<String>,
    ) -> Self {
        self.organisation_id = Some(organisation_id.into());
        self.registration_id = Some(registration_id.into());
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = Some(submitted_at);
        self
    }

    pub fn org_reg(&self) -> Option<(&str, &str)> {
        match (&self.organisation_id, &self.registration_id) {
            (Some(org), Some(reg)) => Some((org.as_str(), reg.as_str())),
            _ => None,
        }
    }

    /// Materialize the stored shape, stamping `createdAt` if unset.
    pub fn into_summary_log(self, now: DateTime<Utc>) -> SummaryLog {
        SummaryLog {
            status: self.status,
            file: self.file,
            organisation_id: self.organisation_id,
            registration_id: self.registration_id,
            failure_reason: self.failure_reason,
            validation: self.validation,
            loads: self.loads,
            expires_at: self.expires_at,
            created_at: Some(self.created_at.unwrap_or(now)),
            submitted_at: self.submitted_at,
        }
    }
}

/// Payload accepted by `update`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryLogUpdate {
    pub status: Option<SummaryLogStatus>,
    pub file: Option<SummaryLogFile>,
    pub organisation_id: Option<String>,
    pub registration_id: Option<String>,
    pub failure_reason: Option<String>,
    pub validation: Option<Value>,
    pub loads: Option<Value>,
    /// `Some(None)` clears the stored value.
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl SummaryLogUpdate {
    pub fn status(status: SummaryLogStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file: SummaryLogFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_validation(mut self, validation: Value) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_loads(mut self, loads: Value) -> Self {
        self.loads = Some(loads);
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_organisation_id(mut self, organisation_id: impl Into<String>) -> Self {
        self.organisation_id = Some(organisation_id.into());
        self
    }

    pub fn with_registration_id(mut self, registration_id: impl Into<String>) -> Self {
        self.registration_id = Some(registration_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Overlay this update on `current`. No transition checks here.
    pub fn merge_into(&self, current: &SummaryLog) -> SummaryLog {
        let mut next = current.clone();

        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(file) = &self.file {
            next.file = file.clone();
        }
        if let Some(org) = &self.organisation_id {
            next.organisation_id = Some(org.clone());
        }
        if let Some(reg) = &self.registration_id {
            next.registration_id = Some(reg.clone());
        }
        if let Some(reason) = &self.failure_reason {
            next.failure_reason = Some(reason.clone());
        }
        if let Some(validation) = &self.validation {
            next.validation = Some(validation.clone());
        }
        if let Some(loads) = &self.loads {
            next.loads = Some(loads.clone());
        }
        if let Some(expires_at) = self.expires_at {
            next.expires_at = expires_at;
        }
        if let Some(submitted_at) = self.submitted_at {
            next.submitted_at = Some(submitted_at);
        }
        if !next.status.carries_failure_reason() {
            next.failure_reason = None;
        }

        next
    }
}
