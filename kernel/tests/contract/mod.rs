// Store Contract
//
// Behaviour every `SummaryLogStore` backend must share. Each backend's
// test binary instantiates the suite with `store_contract_tests!`.

#![allow(dead_code)]

use std::sync::Barrier;
use std::thread;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use summary_log_kernel::consistency::{wait_for_version, ConsistencyConfig};
use summary_log_kernel::record::{SummaryLogFile, SummaryLogInsert, SummaryLogUpdate};
use summary_log_kernel::state::SummaryLogStatus;
use summary_log_kernel::store::{Conflict, StoreError, SubmissionOutcome, SummaryLogStore};

/// Expand one `#[test]` per contract case. `$make` builds a fresh
/// fixture exposing `store()`; it is evaluated once per test.
macro_rules! store_contract_tests {
    (@cases $make:expr; $($case:ident),* $(,)?) => {
        $(
            #[test]
            fn $case() {
                let fixture = $make;
                contract::$case(fixture.store());
            }
        )*
    };
    ($make:expr) => {
        store_contract_tests!(@cases $make;
            insert_starts_at_version_one,
            sequential_updates_advance_version_by_one,
            stale_update_is_rejected_and_record_unchanged,
            update_of_missing_record_is_not_found,
            illegal_transition_is_rejected,
            invalid_payloads_are_rejected,
            duplicate_insert_is_rejected,
            concurrent_stale_updates_have_one_winner,
            concurrent_inserts_have_one_winner,
            concurrent_claims_have_one_submitter,
            update_into_submitting_respects_the_slot,
            insert_as_submitting_respects_the_slot,
            claim_of_validated_record_succeeds,
            second_claim_in_pair_loses,
            claim_is_scoped_to_the_pair,
            claim_requires_validated_record,
            supersede_retires_older_pending_logs,
            supersede_never_touches_settled_records,
            supersede_skips_newer_and_foreign_records,
            supersede_with_unknown_anchor_is_a_no_op,
            claim_and_supersede_race_resolves_one_way,
            submitting_log_checks,
            latest_submitted_is_newest_by_submitted_at,
            latest_submitted_ties_break_on_id,
            released_claim_frees_the_slot,
            wait_for_version_reads_own_write,
        );
    };
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
}

fn pending_file() -> SummaryLogFile {
    SummaryLogFile::pending("file-1", "summary.xlsx")
}

fn log(status: SummaryLogStatus, org: &str, reg: &str) -> SummaryLogInsert {
    SummaryLogInsert::new(status, pending_file()).with_org_reg(org, reg)
}

fn validated() -> SummaryLogInsert {
    log(SummaryLogStatus::Validated, "org1", "reg1")
}

fn status_of<S: SummaryLogStore>(store: &S, id: &str) -> (SummaryLogStatus, u64) {
    let record = store.find_by_id(id).unwrap().expect("record exists");
    (record.summary_log.status, record.version)
}

fn to(status: SummaryLogStatus) -> SummaryLogUpdate {
    SummaryLogUpdate::status(status)
}

pub fn insert_starts_at_version_one<S: SummaryLogStore>(store: &S) {
    store
        .insert("log-1", &log(SummaryLogStatus::Preprocessing, "org1", "reg1"))
        .unwrap();

    let record = store.find_by_id("log-1").unwrap().unwrap();
    assert_eq!(record.id, "log-1");
    assert_eq!(record.version, 1);
    assert_eq!(record.summary_log.status, SummaryLogStatus::Preprocessing);
    assert!(record.summary_log.created_at.is_some());
    assert!(store.find_by_id("log-2").unwrap().is_none());
}

pub fn sequential_updates_advance_version_by_one<S: SummaryLogStore>(store: &S) {
    store
        .insert("log-1", &log(SummaryLogStatus::Preprocessing, "org1", "reg1"))
        .unwrap();

    let updates = [
        to(SummaryLogStatus::Validating),
        SummaryLogUpdate::default().with_loads(json!({ "added": 3 })),
        to(SummaryLogStatus::Validated).with_validation(json!({ "issues": [] })),
    ];
    for (n, update) in updates.iter().enumerate() {
        store.update("log-1", 1 + n as u64, update).unwrap();
    }

    let record = store.find_by_id("log-1").unwrap().unwrap();
    assert_eq!(record.version, 1 + updates.len() as u64);
    assert_eq!(record.summary_log.status, SummaryLogStatus::Validated);
    assert_eq!(record.summary_log.loads, Some(json!({ "added": 3 })));
}

pub fn stale_update_is_rejected_and_record_unchanged<S: SummaryLogStore>(store: &S) {
    store
        .insert("log-a", &log(SummaryLogStatus::Preprocessing, "org1", "reg1"))
        .unwrap();
    store
        .update("log-a", 1, &to(SummaryLogStatus::Validating))
        .unwrap();
    let before = store.find_by_id("log-a").unwrap().unwrap();

    let err = store
        .update(
            "log-a",
            1,
            &to(SummaryLogStatus::Rejected).with_failure_reason("late"),
        )
        .unwrap_err();

    assert_eq!(err.status_code(), 409);
    assert!(matches!(
        err.as_conflict(),
        Some(Conflict::StaleVersion {
            attempted: 1,
            current: 2,
            ..
        })
    ));
    let message = err.to_string();
    assert!(message.contains("version 1"), "{message}");
    assert!(message.contains("current version is 2"), "{message}");
    assert_eq!(store.find_by_id("log-a").unwrap().unwrap(), before);
}

pub fn update_of_missing_record_is_not_found<S: SummaryLogStore>(store: &S) {
    let err = store
        .update("missing", 1, &to(SummaryLogStatus::Validating))
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.status_code(), 404);
}

pub fn illegal_transition_is_rejected<S: SummaryLogStore>(store: &S) {
    store
        .insert("log-1", &log(SummaryLogStatus::Preprocessing, "org1", "reg1"))
        .unwrap();

    let err = store
        .update("log-1", 1, &to(SummaryLogStatus::Submitted))
        .unwrap_err();

    assert!(matches!(
        err.as_conflict(),
        Some(Conflict::IllegalTransition { .. })
    ));
    assert_eq!(
        status_of(store, "log-1"),
        (SummaryLogStatus::Preprocessing, 1)
    );
}

pub fn invalid_payloads_are_rejected<S: SummaryLogStore>(store: &S) {
    let err = store.insert("", &validated()).unwrap_err();
    assert_eq!(err.status_code(), 422);

    let err = store
        .insert(
            "log-1",
            &validated().with_failure_reason("not allowed while validated"),
        )
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert!(err.to_string().starts_with("Invalid summary log data: "));
    assert!(store.find_by_id("log-1").unwrap().is_none());

    store.insert("log-1", &validated()).unwrap();
    let err = store
        .update("log-1", 1, &SummaryLogUpdate::default())
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert_eq!(status_of(store, "log-1"), (SummaryLogStatus::Validated, 1));
}

pub fn duplicate_insert_is_rejected<S: SummaryLogStore>(store: &S) {
    store.insert("log-1", &validated()).unwrap();

    let err = store
        .insert("log-1", &log(SummaryLogStatus::Preprocessing, "org2", "reg2"))
        .unwrap_err();

    assert!(matches!(err.as_conflict(), Some(Conflict::DuplicateId { .. })));
    assert_eq!(err.to_string(), "Summary log with id log-1 already exists");
    let record = store.find_by_id("log-1").unwrap().unwrap();
    assert_eq!(record.summary_log.status, SummaryLogStatus::Validated);
    assert_eq!(record.summary_log.organisation_id.as_deref(), Some("org1"));
}

pub fn concurrent_stale_updates_have_one_winner<S: SummaryLogStore>(store: &S) {
    store
        .insert("log-1", &log(SummaryLogStatus::Validating, "org1", "reg1"))
        .unwrap();
    let barrier = Barrier::new(2);

    let results: Vec<(&str, Result<(), StoreError>)> = thread::scope(|s| {
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|writer| {
                let barrier = &barrier;
                s.spawn(move || {
                    let update = SummaryLogUpdate::default()
                        .with_validation(json!({ "writer": writer }));
                    barrier.wait();
                    (writer, store.update("log-1", 1, &update))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&str> = results
        .iter()
        .filter(|(_, result)| result.is_ok())
        .map(|(writer, _)| *writer)
        .collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    for (_, result) in &results {
        if let Err(err) = result {
            assert!(matches!(
                err.as_conflict(),
                Some(Conflict::StaleVersion { .. })
            ));
        }
    }

    let record = store.find_by_id("log-1").unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(
        record.summary_log.validation,
        Some(json!({ "writer": winners[0] }))
    );
}

pub fn concurrent_inserts_have_one_winner<S: SummaryLogStore>(store: &S) {
    let barrier = Barrier::new(2);

    let results: Vec<(&str, Result<(), StoreError>)> = thread::scope(|s| {
        let handles: Vec<_> = ["first.xlsx", "second.xlsx"]
            .into_iter()
            .map(|name| {
                let barrier = &barrier;
                s.spawn(move || {
                    let data = SummaryLogInsert::new(
                        SummaryLogStatus::Preprocessing,
                        SummaryLogFile::pending("file-1", name),
                    );
                    barrier.wait();
                    (name, store.insert("log-1", &data))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&str> = results
        .iter()
        .filter(|(_, result)| result.is_ok())
        .map(|(name, _)| *name)
        .collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    assert!(results.iter().all(|(_, result)| match result {
        Ok(()) => true,
        Err(err) => matches!(err.as_conflict(), Some(Conflict::DuplicateId { .. })),
    }));

    let record = store.find_by_id("log-1").unwrap().unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.summary_log.file.name(), winners[0]);
}

pub fn concurrent_claims_have_one_submitter<S: SummaryLogStore>(store: &S) {
    let ids = ["log-1", "log-2", "log-3", "log-4"];
    for id in ids {
        store.insert(id, &validated()).unwrap();
    }
    let barrier = Barrier::new(ids.len());

    let outcomes: Vec<SubmissionOutcome> = thread::scope(|s| {
        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    store.transition_to_submitting_exclusive(id).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|o| o.success()).count(), 1);
    let submitting = ids
        .iter()
        .filter(|id| status_of(store, id).0 == SummaryLogStatus::Submitting)
        .count();
    assert_eq!(submitting, 1);
    assert!(store.has_submitting_log("org1", "reg1").unwrap());
}

pub fn update_into_submitting_respects_the_slot<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();
    store.insert("y", &validated()).unwrap();
    assert!(store.transition_to_submitting_exclusive("x").unwrap().success());

    let err = store
        .update("y", 1, &to(SummaryLogStatus::Submitting))
        .unwrap_err();

    assert!(matches!(
        err.as_conflict(),
        Some(Conflict::SubmissionInProgress { .. })
    ));
    assert_eq!(err.to_string(), "A submission is in progress. Please wait.");
    assert_eq!(status_of(store, "y"), (SummaryLogStatus::Validated, 1));
}

pub fn insert_as_submitting_respects_the_slot<S: SummaryLogStore>(store: &S) {
    store
        .insert("x", &log(SummaryLogStatus::Submitting, "org1", "reg1"))
        .unwrap();

    let err = store
        .insert("z", &log(SummaryLogStatus::Submitting, "org1", "reg1"))
        .unwrap_err();

    assert!(matches!(
        err.as_conflict(),
        Some(Conflict::SubmissionInProgress { .. })
    ));
    assert!(store.find_by_id("z").unwrap().is_none());
    store
        .insert("w", &log(SummaryLogStatus::Submitting, "org1", "reg2"))
        .unwrap();
}

pub fn claim_of_validated_record_succeeds<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();

    let outcome = store.transition_to_submitting_exclusive("x").unwrap();

    assert!(outcome.success());
    assert_eq!(outcome.version(), Some(2));
    match outcome {
        SubmissionOutcome::Claimed { summary_log, .. } => {
            assert_eq!(summary_log.status, SummaryLogStatus::Submitting);
            assert!(summary_log.submitted_at.is_some());
            assert!(summary_log.expires_at.is_some());
        }
        other => panic!("expected a claim, got {other:?}"),
    }
    assert_eq!(status_of(store, "x"), (SummaryLogStatus::Submitting, 2));
}

pub fn second_claim_in_pair_loses<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();
    store.insert("y", &validated()).unwrap();
    assert!(store.transition_to_submitting_exclusive("x").unwrap().success());

    let outcome = store.transition_to_submitting_exclusive("y").unwrap();

    assert_eq!(outcome, SubmissionOutcome::AlreadySubmitting);
    assert!(!outcome.success());
    assert_eq!(status_of(store, "y"), (SummaryLogStatus::Validated, 1));
}

pub fn claim_is_scoped_to_the_pair<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();
    store
        .insert("y", &log(SummaryLogStatus::Validated, "org1", "reg2"))
        .unwrap();
    store
        .insert("z", &log(SummaryLogStatus::Validated, "org2", "reg1"))
        .unwrap();

    for id in ["x", "y", "z"] {
        assert!(store.transition_to_submitting_exclusive(id).unwrap().success());
    }
}

pub fn claim_requires_validated_record<S: SummaryLogStore>(store: &S) {
    store
        .insert("x", &log(SummaryLogStatus::Validating, "org1", "reg1"))
        .unwrap();

    let err = store.transition_to_submitting_exclusive("x").unwrap_err();
    assert!(matches!(
        err.as_conflict(),
        Some(Conflict::NotValidated {
            current: SummaryLogStatus::Validating,
            ..
        })
    ));
    assert_eq!(status_of(store, "x"), (SummaryLogStatus::Validating, 1));

    let err = store.transition_to_submitting_exclusive("missing").unwrap_err();
    assert!(err.is_not_found());
}

pub fn supersede_retires_older_pending_logs<S: SummaryLogStore>(store: &S) {
    store
        .insert(
            "a",
            &log(SummaryLogStatus::Preprocessing, "org1", "reg1").with_created_at(at(0)),
        )
        .unwrap();
    store
        .insert("b", &validated().with_created_at(at(1)))
        .unwrap();

    let count = store.supersede_pending_logs("org1", "reg1", "b").unwrap();

    assert_eq!(count, 1);
    let a = store.find_by_id("a").unwrap().unwrap();
    assert_eq!(a.version, 2);
    assert_eq!(a.summary_log.status, SummaryLogStatus::Superseded);
    assert!(a.summary_log.expires_at.is_some());
    assert_eq!(status_of(store, "b"), (SummaryLogStatus::Validated, 1));

    // Idempotent: nothing left to retire.
    assert_eq!(store.supersede_pending_logs("org1", "reg1", "b").unwrap(), 0);
}

pub fn supersede_never_touches_settled_records<S: SummaryLogStore>(store: &S) {
    store
        .insert(
            "submitting",
            &log(SummaryLogStatus::Submitting, "org1", "reg1").with_created_at(at(0)),
        )
        .unwrap();
    store
        .insert(
            "submitted",
            &log(SummaryLogStatus::Submitted, "org1", "reg1")
                .with_created_at(at(0))
                .with_submitted_at(at(2)),
        )
        .unwrap();
    store
        .insert(
            "invalid",
            &log(SummaryLogStatus::Invalid, "org1", "reg1")
                .with_failure_reason("bad rows")
                .with_created_at(at(0)),
        )
        .unwrap();
    store
        .insert(
            "validating",
            &log(SummaryLogStatus::Validating, "org1", "reg1").with_created_at(at(0)),
        )
        .unwrap();
    store
        .insert("anchor", &validated().with_created_at(at(5)))
        .unwrap();

    let count = store.supersede_pending_logs("org1", "reg1", "anchor").unwrap();

    assert_eq!(count, 1);
    assert_eq!(
        status_of(store, "submitting"),
        (SummaryLogStatus::Submitting, 1)
    );
    assert_eq!(
        status_of(store, "submitted"),
        (SummaryLogStatus::Submitted, 1)
    );
    assert_eq!(status_of(store, "invalid"), (SummaryLogStatus::Invalid, 1));
    assert_eq!(
        status_of(store, "validating"),
        (SummaryLogStatus::Superseded, 2)
    );
}

pub fn supersede_skips_newer_and_foreign_records<S: SummaryLogStore>(store: &S) {
    store
        .insert("anchor", &validated().with_created_at(at(5)))
        .unwrap();
    store
        .insert(
            "newer",
            &log(SummaryLogStatus::Preprocessing, "org1", "reg1").with_created_at(at(9)),
        )
        .unwrap();
    store
        .insert(
            "same-instant",
            &log(SummaryLogStatus::Preprocessing, "org1", "reg1").with_created_at(at(5)),
        )
        .unwrap();
    store
        .insert(
            "other-reg",
            &log(SummaryLogStatus::Validated, "org1", "reg2").with_created_at(at(0)),
        )
        .unwrap();

    let count = store.supersede_pending_logs("org1", "reg1", "anchor").unwrap();

    assert_eq!(count, 1);
    assert_eq!(
        status_of(store, "newer"),
        (SummaryLogStatus::Preprocessing, 1)
    );
    assert_eq!(
        status_of(store, "same-instant"),
        (SummaryLogStatus::Superseded, 2)
    );
    assert_eq!(
        status_of(store, "other-reg"),
        (SummaryLogStatus::Validated, 1)
    );
    assert_eq!(status_of(store, "anchor"), (SummaryLogStatus::Validated, 1));
}

pub fn supersede_with_unknown_anchor_is_a_no_op<S: SummaryLogStore>(store: &S) {
    store
        .insert(
            "a",
            &log(SummaryLogStatus::Preprocessing, "org1", "reg1").with_created_at(at(0)),
        )
        .unwrap();

    assert_eq!(
        store.supersede_pending_logs("org1", "reg1", "missing").unwrap(),
        0
    );
    assert_eq!(
        status_of(store, "a"),
        (SummaryLogStatus::Preprocessing, 1)
    );
}

pub fn claim_and_supersede_race_resolves_one_way<S: SummaryLogStore>(store: &S) {
    store
        .insert("older", &validated().with_created_at(at(0)))
        .unwrap();
    store
        .insert("newer", &validated().with_created_at(at(1)))
        .unwrap();
    let barrier = Barrier::new(2);

    let (claim, swept) = thread::scope(|s| {
        let claim = s.spawn(|| {
            barrier.wait();
            store.transition_to_submitting_exclusive("older")
        });
        let sweep = s.spawn(|| {
            barrier.wait();
            store.supersede_pending_logs("org1", "reg1", "newer")
        });
        (claim.join().unwrap(), sweep.join().unwrap().unwrap())
    });

    let (status, version) = status_of(store, "older");
    assert_eq!(version, 2);
    match claim {
        Ok(outcome) => {
            assert!(outcome.success());
            assert_eq!(swept, 0);
            assert_eq!(status, SummaryLogStatus::Submitting);
        }
        Err(err) => {
            assert!(err.is_conflict(), "{err}");
            assert_eq!(swept, 1);
            assert_eq!(status, SummaryLogStatus::Superseded);
        }
    }
}

pub fn submitting_log_checks<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();
    assert!(!store.has_submitting_log("org1", "reg1").unwrap());
    store.check_for_submitting_log("org1", "reg1").unwrap();

    store.transition_to_submitting_exclusive("x").unwrap();

    assert!(store.has_submitting_log("org1", "reg1").unwrap());
    assert!(!store.has_submitting_log("org1", "reg2").unwrap());
    let err = store.check_for_submitting_log("org1", "reg1").unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.to_string(), "A submission is in progress. Please wait.");
}

pub fn latest_submitted_is_newest_by_submitted_at<S: SummaryLogStore>(store: &S) {
    assert!(store
        .find_latest_submitted_for_org_reg("org1", "reg1")
        .unwrap()
        .is_none());

    for (id, submitted) in [("first", at(10)), ("third", at(30)), ("second", at(20))] {
        store
            .insert(
                id,
                &log(SummaryLogStatus::Submitted, "org1", "reg1").with_submitted_at(submitted),
            )
            .unwrap();
    }
    store
        .insert(
            "elsewhere",
            &log(SummaryLogStatus::Submitted, "org1", "reg2").with_submitted_at(at(50)),
        )
        .unwrap();
    store.insert("claimed", &validated()).unwrap();
    store.transition_to_submitting_exclusive("claimed").unwrap();

    let latest = store
        .find_latest_submitted_for_org_reg("org1", "reg1")
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, "third");
    assert_eq!(latest.summary_log.submitted_at, Some(at(30)));
}

pub fn latest_submitted_ties_break_on_id<S: SummaryLogStore>(store: &S) {
    for id in ["b", "c", "a"] {
        store
            .insert(
                id,
                &log(SummaryLogStatus::Submitted, "org1", "reg1").with_submitted_at(at(15)),
            )
            .unwrap();
    }

    for _ in 0..3 {
        let latest = store
            .find_latest_submitted_for_org_reg("org1", "reg1")
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "c");
    }
}

pub fn released_claim_frees_the_slot<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();
    store.insert("y", &validated()).unwrap();
    store.transition_to_submitting_exclusive("x").unwrap();

    store
        .update("x", 2, &to(SummaryLogStatus::Validated))
        .unwrap();

    assert!(store.transition_to_submitting_exclusive("y").unwrap().success());
    let x = store.find_by_id("x").unwrap().unwrap();
    assert_eq!(x.version, 3);
    assert_eq!(x.summary_log.status, SummaryLogStatus::Validated);
}

pub fn wait_for_version_reads_own_write<S: SummaryLogStore>(store: &S) {
    store.insert("x", &validated()).unwrap();
    store.transition_to_submitting_exclusive("x").unwrap();

    let record = wait_for_version(store, "x", 2, &ConsistencyConfig::test_profile()).unwrap();

    assert_eq!(record.summary_log.status, SummaryLogStatus::Submitting);
    assert!(record.summary_log.submitted_at.unwrap() > Utc::now() - Duration::minutes(1));
}
