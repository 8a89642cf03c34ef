//! Merges a scored submission into a student's year progress.
//!
//! Everything here is pure: the caller reads a [`YearSnapshot`], calls
//! [`reconcile`], and hands the result to the store as one atomic write.
//! Year aggregates are always recomputed from the full record set rather
//! than patched, so a snapshot can be rebuilt from its records at any time.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::catalog::{self, Catalog};
use crate::error::{ProgressError, Result};
use crate::matcher;
use crate::models::{
    AttemptSnapshot, StudentYearSummary, Submission, TestRecord, YearProgress, YearSnapshot,
};
use crate::scoring::{self, rounded_ratio};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregates {
    pub completed_count: u32,
    pub approved_count: u32,
    pub average_percentage: u32,
    pub best_percentage: u32,
    pub worst_percentage: u32,
    pub approved_modules: BTreeSet<u32>,
    /// Highest catalog position that has a record.
    pub furthest_module: u32,
}

/// Aggregates over the record matched to each catalog module. Records that
/// match no module do not count.
pub fn aggregate(catalog: &Catalog, records: &BTreeMap<String, TestRecord>) -> Aggregates {
    let mut aggregates = Aggregates::default();
    let mut percentages = Vec::new();

    for module in catalog.modules() {
        let Some(found) = matcher::match_record(catalog, module.sequence_number, records) else {
            continue;
        };
        aggregates.completed_count += 1;
        aggregates.furthest_module = module.sequence_number;
        if found.record.approved {
            aggregates.approved_count += 1;
            aggregates.approved_modules.insert(module.sequence_number);
        }
        percentages.push(found.record.percentage);
    }

    if !percentages.is_empty() {
        let sum: u64 = percentages.iter().map(|p| u64::from(*p)).sum();
        aggregates.average_percentage = rounded_ratio(sum, percentages.len() as u64) as u32;
        aggregates.best_percentage = percentages.iter().copied().max().unwrap_or(0);
        aggregates.worst_percentage = percentages.iter().copied().min().unwrap_or(0);
    }

    aggregates
}

/// Rebuilds a year's progress document from its records.
pub fn recompute_year(
    catalog: &Catalog,
    student_id: &str,
    records: BTreeMap<String, TestRecord>,
) -> YearProgress {
    let aggregates = aggregate(catalog, &records);
    YearProgress {
        student_id: student_id.to_string(),
        year: catalog.year,
        total_modules: catalog.total_modules(),
        completed_count: aggregates.completed_count,
        approved_count: aggregates.approved_count,
        average_percentage: aggregates.average_percentage,
        best_percentage: aggregates.best_percentage,
        worst_percentage: aggregates.worst_percentage,
        records,
    }
}

/// Rebuilds the profile projection from records alone. The stored
/// `completed_levels` may legitimately be higher (it never decreases), so
/// callers compare it as a lower bound.
pub fn recompute_summary(catalog: &Catalog, records: &BTreeMap<String, TestRecord>) -> StudentYearSummary {
    let aggregates = aggregate(catalog, records);
    StudentYearSummary {
        completed_levels: aggregates.furthest_module,
        approved_levels: aggregates.approved_modules.len() as u32,
        approved_module_numbers: aggregates.approved_modules,
        average_percentage: aggregates.average_percentage,
        is_complete: aggregates.furthest_module >= catalog.total_modules(),
    }
}

/// Projection that disagreed with the records it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub projected: BTreeSet<u32>,
    pub recomputed: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub record: TestRecord,
    pub progress: YearProgress,
    pub summary: StudentYearSummary,
    /// Score being replaced, when this was a retake.
    pub previous: Option<AttemptSnapshot>,
    pub drift: Option<DriftReport>,
}

impl Reconciliation {
    pub fn is_retake(&self) -> bool {
        self.previous.is_some()
    }

    pub fn improvement(&self) -> i64 {
        self.previous
            .as_ref()
            .map(|previous| i64::from(self.record.percentage) - i64::from(previous.percentage))
            .unwrap_or(0)
    }
}

pub fn reconcile(
    catalog: &Catalog,
    student_id: &str,
    snapshot: &YearSnapshot,
    module_number: u32,
    submission: &Submission,
    now: DateTime<Utc>,
) -> Result<Reconciliation> {
    let score = scoring::score_submission(submission)?;
    let reference = catalog
        .reference(module_number)
        .ok_or(ProgressError::UnknownModule {
            year: catalog.year,
            module: module_number,
        })?;
    let module = catalog.module(module_number).ok_or(ProgressError::UnknownModule {
        year: catalog.year,
        module: module_number,
    })?;
    let slug = Some(module.slug.to_string());
    let approved = score.percentage >= module.passing_threshold;

    let mut records = snapshot.records().cloned().unwrap_or_default();
    let existing = matcher::match_record(catalog, module_number, &records)
        .map(|found| (found.key.to_string(), found.record.clone()));

    let (record, previous) = match existing {
        Some((key, prior)) => {
            let previous = prior.snapshot();
            let mut attempt_history = prior.attempt_history;
            attempt_history.push(previous.clone());
            let record = TestRecord {
                record_key: key,
                module_number,
                slug,
                total_questions: score.total_questions,
                correct_count: score.correct_count,
                percentage: score.percentage,
                approved,
                completed_at: now,
                attempt_number: prior.attempt_number.max(1) + 1,
                attempt_history,
                answers: submission.answers.clone(),
            };
            (record, Some(previous))
        }
        None => {
            let record = TestRecord {
                record_key: catalog::record_key(reference),
                module_number,
                slug,
                total_questions: score.total_questions,
                correct_count: score.correct_count,
                percentage: score.percentage,
                approved,
                completed_at: now,
                attempt_number: 1,
                attempt_history: Vec::new(),
                answers: submission.answers.clone(),
            };
            (record, None)
        }
    };

    records.insert(record.record_key.clone(), record.clone());
    let progress = recompute_year(catalog, student_id, records);
    let recomputed = aggregate(catalog, &progress.records).approved_modules;

    let prior_summary = snapshot.summary.clone().unwrap_or_default();
    let mut approved_modules = prior_summary.approved_module_numbers.clone();
    if record.approved {
        approved_modules.insert(module_number);
    } else {
        approved_modules.remove(&module_number);
    }

    let drift = if approved_modules != recomputed {
        tracing::warn!(
            student = student_id,
            year = %catalog.year,
            projected = ?approved_modules,
            recomputed = ?recomputed,
            "approved modules drifted from records, rebuilding projection"
        );
        let report = DriftReport {
            projected: approved_modules,
            recomputed: recomputed.clone(),
        };
        approved_modules = recomputed;
        Some(report)
    } else {
        None
    };

    let completed_levels = prior_summary.completed_levels.max(module_number);
    let summary = StudentYearSummary {
        completed_levels,
        approved_levels: approved_modules.len() as u32,
        approved_module_numbers: approved_modules,
        average_percentage: progress.average_percentage,
        is_complete: completed_levels >= catalog.total_modules(),
    };

    Ok(Reconciliation {
        record,
        progress,
        summary,
        previous,
        drift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CohortYear, ModuleStatus};
    use crate::status::derive_status;
    use chrono::{Duration, TimeZone};

    const STUDENT: &str = "student-1";

    fn catalog() -> &'static Catalog {
        Catalog::for_year(CohortYear::First)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn submission(correct: i64, total: i64) -> Submission {
        Submission {
            total_questions: total,
            correct_count: correct,
            answers: BTreeMap::new(),
        }
    }

    fn apply(snapshot: &YearSnapshot, result: &Reconciliation) -> YearSnapshot {
        YearSnapshot {
            progress: Some(result.progress.clone()),
            summary: Some(result.summary.clone()),
            version: snapshot.version + 1,
        }
    }

    fn submit_all(plan: &[(u32, i64, i64)]) -> YearSnapshot {
        let mut snapshot = YearSnapshot::absent();
        for (step, (module, correct, total)) in plan.iter().enumerate() {
            let result = reconcile(
                catalog(),
                STUDENT,
                &snapshot,
                *module,
                &submission(*correct, *total),
                at(step as i64),
            )
            .unwrap();
            snapshot = apply(&snapshot, &result);
        }
        snapshot
    }

    fn status_of(snapshot: &YearSnapshot, module: u32) -> ModuleStatus {
        let progress = snapshot.progress.as_ref().unwrap();
        let matched = matcher::match_record(catalog(), module, &progress.records).map(|m| m.record);
        derive_status(module, matched, progress.completed_count, progress.approved_count)
    }

    fn assert_counters_consistent(snapshot: &YearSnapshot) {
        let progress = snapshot.progress.as_ref().unwrap();
        let summary = snapshot.summary.as_ref().unwrap();
        assert_eq!(summary.approved_levels, progress.approved_count);
        assert_eq!(summary.approved_module_numbers.len() as u32, summary.approved_levels);
        assert!(progress.approved_count <= progress.completed_count);
        assert!(progress.completed_count <= progress.total_modules);
    }

    #[test]
    fn first_attempt_creates_record() {
        // Module 3 of a 6-module year, 4 of 5 correct.
        let before = submit_all(&[(1, 5, 5), (2, 4, 5)]);
        let before_progress = before.progress.clone().unwrap();

        let result = reconcile(catalog(), STUDENT, &before, 3, &submission(4, 5), at(10)).unwrap();
        assert!(!result.is_retake());
        assert_eq!(result.record.record_key, "module3");
        assert_eq!(result.record.percentage, 80);
        assert!(result.record.approved);
        assert_eq!(result.record.attempt_number, 1);
        assert!(result.record.attempt_history.is_empty());
        assert_eq!(result.progress.completed_count, before_progress.completed_count + 1);
        assert_eq!(result.progress.approved_count, before_progress.approved_count + 1);

        let after = apply(&before, &result);
        assert_eq!(status_of(&after, 3), ModuleStatus::Approved);
        assert_counters_consistent(&after);
    }

    #[test]
    fn retake_improvement_flips_to_approved() {
        let before = submit_all(&[(1, 5, 5), (2, 5, 5), (3, 2, 5)]);
        assert_eq!(status_of(&before, 3), ModuleStatus::Failed);
        let before_progress = before.progress.clone().unwrap();

        let result = reconcile(catalog(), STUDENT, &before, 3, &submission(9, 10), at(20)).unwrap();
        assert!(result.is_retake());
        assert_eq!(result.record.record_key, "module3");
        assert_eq!(result.record.attempt_number, 2);
        assert_eq!(
            result.record.attempt_history,
            vec![AttemptSnapshot {
                percentage: 40,
                approved: false,
                completed_at: at(2),
            }]
        );
        assert_eq!(result.improvement(), 50);
        assert!(result.summary.approved_module_numbers.contains(&3));
        assert_eq!(result.progress.approved_count, before_progress.approved_count + 1);
        assert_eq!(result.progress.completed_count, before_progress.completed_count);
        assert_eq!(result.progress.records.len(), 3);

        let after = apply(&before, &result);
        assert_eq!(status_of(&after, 3), ModuleStatus::Approved);
        assert_counters_consistent(&after);
    }

    #[test]
    fn retake_regression_flips_to_failed() {
        let before = submit_all(&[(1, 5, 5), (2, 5, 5), (3, 17, 20)]);
        assert_eq!(before.progress.as_ref().unwrap().records["module3"].percentage, 85);

        let result = reconcile(catalog(), STUDENT, &before, 3, &submission(5, 10), at(30)).unwrap();
        assert!(!result.record.approved);
        assert!(!result.summary.approved_module_numbers.contains(&3));
        assert_eq!(result.progress.approved_count, 2);
        assert!(result.drift.is_none());

        let after = apply(&before, &result);
        assert_eq!(status_of(&after, 3), ModuleStatus::Failed);
        assert_counters_consistent(&after);
    }

    #[test]
    fn next_module_after_completed_prefix_is_in_progress() {
        let snapshot = submit_all(&[(1, 5, 5), (2, 1, 5), (3, 4, 5), (4, 5, 5)]);
        let statuses: Vec<ModuleStatus> = (1..=6).map(|n| status_of(&snapshot, n)).collect();
        assert_eq!(
            statuses,
            vec![
                ModuleStatus::Approved,
                ModuleStatus::Failed,
                ModuleStatus::Approved,
                ModuleStatus::Approved,
                ModuleStatus::InProgress,
                ModuleStatus::Pending,
            ]
        );
    }

    #[test]
    fn retake_of_legacy_record_overwrites_in_place() {
        let mut records = BTreeMap::new();
        records.insert(
            "test_so_001".to_string(),
            TestRecord {
                record_key: "test_so_001".to_string(),
                module_number: 3,
                slug: None,
                total_questions: 5,
                correct_count: 2,
                percentage: 40,
                approved: false,
                completed_at: at(0),
                attempt_number: 1,
                attempt_history: Vec::new(),
                answers: BTreeMap::new(),
            },
        );
        let snapshot = YearSnapshot {
            progress: Some(recompute_year(catalog(), STUDENT, records)),
            summary: Some(StudentYearSummary {
                completed_levels: 3,
                ..StudentYearSummary::default()
            }),
            version: 4,
        };

        let result = reconcile(catalog(), STUDENT, &snapshot, 3, &submission(5, 5), at(5)).unwrap();
        assert_eq!(result.record.record_key, "test_so_001");
        assert_eq!(result.record.slug.as_deref(), Some("sistema_operativo"));
        assert_eq!(result.progress.records.len(), 1);
        assert_eq!(result.progress.completed_count, 1);
    }

    #[test]
    fn completed_levels_never_decrease() {
        let mut snapshot = YearSnapshot::absent();
        let mut last = 0;
        for (step, (module, correct)) in [(4, 5), (1, 0), (2, 5), (4, 1), (6, 3), (3, 5)]
            .into_iter()
            .enumerate()
        {
            let result =
                reconcile(catalog(), STUDENT, &snapshot, module, &submission(correct, 5), at(step as i64))
                    .unwrap();
            assert!(result.summary.completed_levels >= last);
            last = result.summary.completed_levels;
            snapshot = apply(&snapshot, &result);
            assert_counters_consistent(&snapshot);
        }
        assert_eq!(last, 6);
        assert!(snapshot.summary.unwrap().is_complete);
    }

    #[test]
    fn recomputation_ignores_submission_order() {
        let plan = [(1, 5, 5), (2, 2, 5), (3, 4, 5), (5, 7, 10), (6, 1, 3)];
        let forward = submit_all(&plan);
        let mut reversed_plan = plan;
        reversed_plan.reverse();
        let backward = submit_all(&reversed_plan);

        let forward_progress = forward.progress.unwrap();
        let backward_progress = backward.progress.unwrap();
        let strip = |mut progress: YearProgress| {
            for record in progress.records.values_mut() {
                record.completed_at = at(0);
            }
            progress
        };
        assert_eq!(strip(forward_progress.clone()), strip(backward_progress));
        assert_eq!(forward.summary, backward.summary);

        let rebuilt = recompute_year(catalog(), STUDENT, forward_progress.records.clone());
        assert_eq!(rebuilt, forward_progress);
        assert_eq!(
            recompute_summary(catalog(), &forward_progress.records),
            forward.summary.unwrap()
        );
        assert_eq!(forward_progress.average_percentage, 65);
        assert_eq!(forward_progress.best_percentage, 100);
        assert_eq!(forward_progress.worst_percentage, 33);
    }

    #[test]
    fn stale_projection_is_reported_and_rebuilt() {
        let snapshot = YearSnapshot {
            progress: None,
            summary: Some(StudentYearSummary {
                completed_levels: 2,
                approved_levels: 2,
                approved_module_numbers: BTreeSet::from([1, 2]),
                average_percentage: 90,
                is_complete: false,
            }),
            version: 1,
        };

        let result = reconcile(catalog(), STUDENT, &snapshot, 3, &submission(5, 5), at(0)).unwrap();
        let drift = result.drift.clone().unwrap();
        assert_eq!(drift.projected, BTreeSet::from([1, 2, 3]));
        assert_eq!(drift.recomputed, BTreeSet::from([3]));
        assert_eq!(result.summary.approved_module_numbers, BTreeSet::from([3]));
        assert_eq!(result.summary.approved_levels, result.progress.approved_count);
        assert_eq!(result.summary.completed_levels, 3);
    }

    #[test]
    fn invalid_submission_and_unknown_module_are_rejected() {
        let snapshot = YearSnapshot::absent();
        let err = reconcile(catalog(), STUDENT, &snapshot, 1, &submission(3, 0), at(0)).unwrap_err();
        assert!(matches!(err, ProgressError::InvalidSubmission(_)));

        let err = reconcile(catalog(), STUDENT, &snapshot, 7, &submission(3, 5), at(0)).unwrap_err();
        assert!(matches!(err, ProgressError::UnknownModule { module: 7, .. }));
    }

    #[test]
    fn first_attempt_never_takes_over_another_modules_legacy_record() {
        let legacy = TestRecord {
            record_key: "test_intro_soporte".to_string(),
            module_number: 1,
            slug: None,
            total_questions: 10,
            correct_count: 9,
            percentage: 90,
            approved: true,
            completed_at: at(0),
            attempt_number: 1,
            attempt_history: Vec::new(),
            answers: BTreeMap::new(),
        };
        let records: BTreeMap<String, TestRecord> =
            [(legacy.record_key.clone(), legacy)].into_iter().collect();
        let progress = recompute_year(catalog(), STUDENT, records);
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.approved_count, 1);

        let before = YearSnapshot {
            summary: Some(recompute_summary(catalog(), &progress.records)),
            progress: Some(progress),
            version: 1,
        };
        let result = reconcile(catalog(), STUDENT, &before, 2, &submission(1, 5), at(5)).unwrap();
        assert!(!result.is_retake());
        assert_eq!(result.record.record_key, "module2");
        assert_eq!(result.record.attempt_number, 1);
        assert_eq!(result.progress.records.len(), 2);
        assert_eq!(result.progress.completed_count, 2);
        assert_eq!(result.progress.approved_count, 1);

        let after = apply(&before, &result);
        assert_eq!(status_of(&after, 1), ModuleStatus::Approved);
        assert_eq!(status_of(&after, 2), ModuleStatus::Failed);
        assert!(result.drift.is_none());
    }
}
