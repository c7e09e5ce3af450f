// Store Invariant Framework
//
// Invariants are pure rules that must hold for every committed write.
// Both backends evaluate them against the previous and next record
// *before* the write reaches storage.

use crate::record::VersionedSummaryLog;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
///
/// `previous` is `None` for an insert.
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        previous: Option<&VersionedSummaryLog>,
        next: &VersionedSummaryLog,
    ) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.invariants.iter().map(|i| i.name()))
            .finish()
    }
}

impl InvariantEngine {
    /// Create an empty invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine preloaded with the rules every store enforces.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(InitialVersionIsOne);
        engine.register(VersionAdvancesByOne);
        engine.register(CreatedAtImmutable);
        engine.register(FailureReasonScoped);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: Option<&VersionedSummaryLog>,
        next: &VersionedSummaryLog,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// Inserts start the version counter at 1.
pub struct InitialVersionIsOne;

impl Invariant for InitialVersionIsOne {
    fn name(&self) -> &'static str {
        "initial-version-is-one"
    }

    fn validate(
        &self,
        previous: Option<&VersionedSummaryLog>,
        next: &VersionedSummaryLog,
    ) -> InvariantResult {
        match previous {
            None if next.version != 1 => {
                InvariantResult::Fail(format!("inserted at version {}", next.version))
            }
            _ => InvariantResult::Pass,
        }
    }
}

/// Every mutation bumps the version by exactly one.
pub struct VersionAdvancesByOne;

impl Invariant for VersionAdvancesByOne {
    fn name(&self) -> &'static str {
        "version-advances-by-one"
    }

    fn validate(
        &self,
        previous: Option<&VersionedSummaryLog>,
        next: &VersionedSummaryLog,
    ) -> InvariantResult {
        match previous {
            Some(prev) if next.version != prev.version + 1 => InvariantResult::Fail(format!(
                "version moved from {} to {}",
                prev.version, next.version
            )),
            _ => InvariantResult::Pass,
        }
    }
}

/// `createdAt` is written once.
pub struct CreatedAtImmutable;

impl Invariant for CreatedAtImmutable {
    fn name(&self) -> &'static str {
        "created-at-immutable"
    }

    fn validate(
        &self,
        previous: Option<&VersionedSummaryLog>,
        next: &VersionedSummaryLog,
    ) -> InvariantResult {
        match previous {
            Some(prev) if prev.summary_log.created_at != next.summary_log.created_at => {
                InvariantResult::Fail(format!("createdAt changed on {}", next.id))
            }
            _ => InvariantResult::Pass,
        }
    }
}

/// `failureReason` only accompanies invalid/rejected records.
pub struct FailureReasonScoped;

impl Invariant for FailureReasonScoped {
    fn name(&self) -> &'static str {
        "failure-reason-scoped"
    }

    fn validate(
        &self,
        _previous: Option<&VersionedSummaryLog>,
        next: &VersionedSummaryLog,
    ) -> InvariantResult {
        let log = &next.summary_log;
        if log.failure_reason.is_some() && !log.status.carries_failure_reason() {
            InvariantResult::Fail(format!("failureReason present while {}", log.status))
        } else {
            InvariantResult::Pass
        }
    }
}
