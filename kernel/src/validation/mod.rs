// Input Validation
//
// Boundary checks for summary log ids and write payloads. Raw JSON is
// parsed into the typed payloads here: unknown keys are dropped, `file`
// is dispatched on its upload status, and every violation is reported.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::record::{FileLocation, SummaryLogFile, SummaryLogInsert, SummaryLogUpdate};
use crate::state::{SummaryLogStatus, UploadStatus};

const ROOT: &str = "(root)";

/// A single rule failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Payload or id failed validation. Nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            violations: vec![Violation {
                path: path.into(),
                message: message.into(),
            }],
        }
    }

    /// Whether any violation is reported against `path`.
    pub fn mentions(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path == path)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Invalid summary log data: ")?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Violations(Vec<Violation>);

impl Violations {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(Violation {
            path: path.into(),
            message: message.into(),
        });
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations: self.0 })
        }
    }
}

/// Reject ids that cannot address a record.
pub fn validate_id(id: &str) -> Result<&str, ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::single("id", "must be a non-empty string"));
    }
    Ok(id)
}

/// Extract an id from untyped input.
pub fn parse_id(value: &Value) -> Result<String, ValidationError> {
    match value {
        Value::String(id) => validate_id(id).map(str::to_string),
        _ => Err(ValidationError::single("id", "must be a string")),
    }
}

impl SummaryLogInsert {
    /// Rules the types cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut v = Violations::default();
        check_file(&self.file, &mut v);
        check_non_empty("organisationId", self.organisation_id.as_deref(), &mut v);
        check_non_empty("registrationId", self.registration_id.as_deref(), &mut v);
        check_failure_reason(Some(self.status), self.failure_reason.as_deref(), &mut v);
        v.finish()
    }
}

impl SummaryLogUpdate {
    /// Rules the types cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut v = Violations::default();
        if self.is_empty() {
            v.push(ROOT, "must contain at least one updatable field");
        }
        if let Some(file) = &self.file {
            check_file(file, &mut v);
        }
        check_non_empty("organisationId", self.organisation_id.as_deref(), &mut v);
        check_non_empty("registrationId", self.registration_id.as_deref(), &mut v);
        check_failure_reason(self.status, self.failure_reason.as_deref(), &mut v);
        v.finish()
    }
}

/// Parse an insert payload.
pub fn parse_insert(value: &Value) -> Result<SummaryLogInsert, ValidationError> {
    let obj = as_object(value)?;
    let mut v = Violations::default();

    let status = match obj.get("status") {
        None | Some(Value::Null) => {
            v.push("status", "is required");
            None
        }
        Some(raw) => parse_status(raw, &mut v),
    };
    let file = match obj.get("file") {
        None | Some(Value::Null) => {
            v.push("file", "is required");
            None
        }
        Some(raw) => parse_file(raw, &mut v),
    };
    let organisation_id = optional_string(obj, "organisationId", &mut v);
    let registration_id = optional_string(obj, "registrationId", &mut v);
    let failure_reason = optional_string(obj, "failureReason", &mut v);
    let expires_at = optional_timestamp(obj, "expiresAt", &mut v).flatten();
    let created_at = optional_timestamp(obj, "createdAt", &mut v).flatten();
    let submitted_at = optional_timestamp(obj, "submittedAt", &mut v).flatten();

    if let Some(status) = status {
        check_failure_reason(Some(status), failure_reason.as_deref(), &mut v);
    }

    match (status, file) {
        (Some(status), Some(file)) if v.is_empty() => Ok(SummaryLogInsert {
            status,
            file,
            organisation_id,
            registration_id,
            failure_reason,
            validation: optional_value(obj, "validation"),
            loads: optional_value(obj, "loads"),
            expires_at,
            created_at,
            submitted_at,
        }),
        _ => Err(ValidationError { violations: v.0 }),
    }
}

/// Parse an update payload.
pub fn parse_update(value: &Value) -> Result<SummaryLogUpdate, ValidationError> {
    let obj = as_object(value)?;
    let mut v = Violations::default();

    if obj.contains_key("createdAt") {
        v.push("createdAt", "cannot be changed after insert");
    }

    let status = match obj.get("status") {
        None | Some(Value::Null) => None,
        Some(raw) => parse_status(raw, &mut v),
    };
    let file = match obj.get("file") {
        None | Some(Value::Null) => None,
        Some(raw) => parse_file(raw, &mut v),
    };

    let update = SummaryLogUpdate {
        status,
        file,
        organisation_id: optional_string(obj, "organisationId", &mut v),
        registration_id: optional_string(obj, "registrationId", &mut v),
        failure_reason: optional_string(obj, "failureReason", &mut v),
        validation: optional_value(obj, "validation"),
        loads: optional_value(obj, "loads"),
        expires_at: optional_timestamp(obj, "expiresAt", &mut v),
        submitted_at: optional_timestamp(obj, "submittedAt", &mut v).flatten(),
    };

    v.finish()?;
    update.validate()?;
    Ok(update)
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, ValidationError> {
    value
        .as_object()
        .ok_or_else(|| ValidationError::single(ROOT, "must be an object"))
}

fn parse_status(raw: &Value, v: &mut Violations) -> Option<SummaryLogStatus> {
    let Some(s) = raw.as_str() else {
        v.push("status", "must be a string");
        return None;
    };
    match s.parse() {
        Ok(status) => Some(status),
        Err(_) => {
            let allowed: Vec<_> = SummaryLogStatus::ALL.iter().map(|s| s.as_str()).collect();
            v.push("status", format!("must be one of [{}]", allowed.join(", ")));
            None
        }
    }
}

fn parse_file(raw: &Value, v: &mut Violations) -> Option<SummaryLogFile> {
    let Some(obj) = raw.as_object() else {
        v.push("file", "must be an object");
        return None;
    };

    let upload_status = match obj.get("status") {
        None | Some(Value::Null) => {
            v.push("file.status", "is required");
            None
        }
        Some(Value::String(s)) => match s.parse::<UploadStatus>() {
            Ok(status) => Some(status),
            Err(_) => {
                v.push("file.status", "must be one of [pending, rejected, complete]");
                None
            }
        },
        Some(_) => {
            v.push("file.status", "must be a string");
            None
        }
    };

    let id = required_string(obj, "id", "file.id", v);
    let name = required_string(obj, "name", "file.name", v);

    let location = match upload_status {
        Some(UploadStatus::Complete) => parse_location(obj.get("location"), v),
        Some(other) => {
            if obj.get("location").is_some_and(|l| !l.is_null()) {
                v.push(
                    "file.location",
                    format!("is not allowed when file.status is {other}"),
                );
            }
            None
        }
        None => None,
    };

    match (upload_status?, id?, name?) {
        (UploadStatus::Pending, id, name) => Some(SummaryLogFile::Pending { id, name }),
        (UploadStatus::Rejected, id, name) => Some(SummaryLogFile::Rejected { id, name }),
        (UploadStatus::Complete, id, name) => Some(SummaryLogFile::Complete {
            id,
            name,
            location: location?,
        }),
    }
}

fn parse_location(raw: Option<&Value>, v: &mut Violations) -> Option<FileLocation> {
    let obj = match raw {
        None | Some(Value::Null) => {
            v.push("file.location", "is required when file.status is complete");
            return None;
        }
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            v.push("file.location", "must be an object");
            return None;
        }
    };

    let bucket = required_string(obj, "bucket", "file.location.bucket", v);
    let key = required_string(obj, "key", "file.location.key", v);
    Some(FileLocation {
        bucket: bucket?,
        key: key?,
    })
}

fn required_string(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    v: &mut Violations,
) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            v.push(path, "is required");
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            v.push(path, "must not be empty");
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            v.push(path, "must be a string");
            None
        }
    }
}

fn optional_string(obj: &Map<String, Value>, key: &str, v: &mut Violations) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(_) => required_string(obj, key, key, v),
    }
}

/// `None` when absent, `Some(None)` for an explicit null.
fn optional_timestamp(
    obj: &Map<String, Value>,
    key: &str,
    v: &mut Violations,
) -> Option<Option<DateTime<Utc>>> {
    match obj.get(key) {
        None => None,
        Some(Value::Null) => Some(None),
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => Some(Some(ts.with_timezone(&Utc))),
            Err(_) => {
                v.push(key, "must be an RFC 3339 timestamp");
                None
            }
        },
        Some(_) => {
            v.push(key, "must be an RFC 3339 timestamp or null");
            None
        }
    }
}

fn optional_value(obj: &Map<String, Value>, key: &str) -> Option<Value> {
    obj.get(key).filter(|value| !value.is_null()).cloned()
}

fn check_file(file: &SummaryLogFile, v: &mut Violations) {
    check_non_empty("file.id", Some(file.id()), v);
    check_non_empty("file.name", Some(file.name()), v);
    if let Some(location) = file.location() {
        check_non_empty("file.location.bucket", Some(&location.bucket), v);
        check_non_empty("file.location.key", Some(&location.key), v);
    }
}

fn check_non_empty(path: &str, value: Option<&str>, v: &mut Violations) {
    if value.is_some_and(|s| s.trim().is_empty()) {
        v.push(path, "must not be empty");
    }
}

fn check_failure_reason(status: Option<SummaryLogStatus>, reason: Option<&str>, v: &mut Violations) {
    if let (Some(status), Some(_)) = (status, reason) {
        if !status.carries_failure_reason() {
            v.push(
                "failureReason",
                format!("is only allowed when status is invalid or rejected, not {status}"),
            );
        }
    }
}
