use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::attempts::{self, AttemptStats, RetakeEligibility};
use crate::catalog::Catalog;
use crate::dashboard::{self, Dashboard, Freshness};
use crate::error::{ProgressError, Result};
use crate::matcher::{self, MatchTier};
use crate::models::{AttemptSnapshot, CohortYear, Submission, TestRecord, YearSnapshot, YearWrite};
use crate::reconcile::{self, Reconciliation};
use crate::scoring;
use crate::store::ProgressStore;

/// Historical test record as exported by older clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRecord {
    pub record_key: String,
    pub slug: Option<String>,
    pub total_questions: i64,
    pub correct_count: i64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported { module: u32, tier: MatchTier },
    /// A record for the same module is already stored.
    AlreadyPresent { module: u32 },
    Unresolved,
    /// Counts that cannot form a score; nothing is stored.
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFinding {
    pub student_id: String,
    pub year: CohortYear,
    pub problems: Vec<String>,
}

/// Read and write paths over a progress store.
pub struct ProgressService {
    store: Arc<dyn ProgressStore>,
    max_attempts: Option<u32>,
    last_good: Mutex<HashMap<(String, CohortYear), Dashboard>>,
}

impl ProgressService {
    pub fn new(store: Arc<dyn ProgressStore>, max_attempts: Option<u32>) -> Self {
        Self {
            store,
            max_attempts,
            last_good: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, student_id: &str, dashboard: &Dashboard) {
        if let Ok(mut cache) = self.last_good.lock() {
            cache.insert((student_id.to_string(), dashboard.year), dashboard.clone());
        }
    }

    fn cached(&self, student_id: &str, year: CohortYear) -> Option<Dashboard> {
        self.last_good
            .lock()
            .ok()
            .and_then(|cache| cache.get(&(student_id.to_string(), year)).cloned())
    }

    /// Never fails: a store error yields the last good dashboard for this
    /// student-year, or an all-pending one.
    pub async fn get_dashboard(&self, student_id: &str, year: CohortYear) -> Dashboard {
        let catalog = Catalog::for_year(year);
        match self.store.load_year(student_id, year).await {
            Ok(snapshot) => {
                let dashboard = dashboard::build_dashboard(catalog, &snapshot);
                self.remember(student_id, &dashboard);
                dashboard
            }
            Err(err) => {
                tracing::warn!(student = student_id, %year, error = %err, "serving dashboard without store");
                match self.cached(student_id, year) {
                    Some(mut dashboard) => {
                        dashboard.freshness = Freshness::Stale;
                        dashboard
                    }
                    None => dashboard::fallback_dashboard(catalog),
                }
            }
        }
    }

    /// Scores a submission and commits the reconciled documents in one
    /// atomic write. Nothing is written when validation or the write fails.
    pub async fn submit_test(
        &self,
        student_id: &str,
        year: CohortYear,
        module_number: u32,
        submission: &Submission,
    ) -> Result<Reconciliation> {
        self.submit_test_at(student_id, year, module_number, submission, Utc::now())
            .await
    }

    pub async fn submit_test_at(
        &self,
        student_id: &str,
        year: CohortYear,
        module_number: u32,
        submission: &Submission,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation> {
        let catalog = Catalog::for_year(year);
        scoring::score_submission(submission)?;
        if catalog.module(module_number).is_none() {
            return Err(ProgressError::UnknownModule {
                year,
                module: module_number,
            });
        }

        if self.store.load_student(student_id).await?.is_none() {
            return Err(ProgressError::StudentNotFound(student_id.to_string()));
        }

        let snapshot = self.store.load_year(student_id, year).await?;
        let result = reconcile::reconcile(catalog, student_id, &snapshot, module_number, submission, now)?;

        let write = YearWrite {
            student_id: student_id.to_string(),
            year,
            expected_version: snapshot.version,
            record: result.record.clone(),
            progress: result.progress.clone(),
            summary: result.summary.clone(),
        };
        let version = self.store.commit_year(&write).await?;

        tracing::info!(
            student = student_id,
            %year,
            module = module_number,
            percentage = result.record.percentage,
            approved = result.record.approved,
            attempt = result.record.attempt_number,
            version,
            "test result saved"
        );

        let committed = YearSnapshot {
            progress: Some(result.progress.clone()),
            summary: Some(result.summary.clone()),
            version,
        };
        self.remember(student_id, &dashboard::build_dashboard(catalog, &committed));

        Ok(result)
    }

    async fn matched_record(
        &self,
        student_id: &str,
        year: CohortYear,
        module_number: u32,
    ) -> Result<Option<TestRecord>> {
        let catalog = Catalog::for_year(year);
        let snapshot = self.store.load_year(student_id, year).await?;
        Ok(snapshot.records().and_then(|records| {
            matcher::match_record(catalog, module_number, records).map(|found| found.record.clone())
        }))
    }

    pub async fn attempt_history(
        &self,
        student_id: &str,
        year: CohortYear,
        module_number: u32,
    ) -> Result<Vec<AttemptSnapshot>> {
        Ok(self
            .matched_record(student_id, year, module_number)
            .await?
            .map(|record| attempts::history(&record))
            .unwrap_or_default())
    }

    pub async fn retake_eligibility(
        &self,
        student_id: &str,
        year: CohortYear,
        module_number: u32,
    ) -> Result<RetakeEligibility> {
        let record = self.matched_record(student_id, year, module_number).await?;
        Ok(attempts::retake_eligibility(record.as_ref(), self.max_attempts))
    }

    /// Clears the attempt counter of a module's record without touching its
    /// score. Returns false when the module has no record.
    pub async fn reset_attempts(
        &self,
        student_id: &str,
        year: CohortYear,
        module_number: u32,
    ) -> Result<bool> {
        let Some(record) = self.matched_record(student_id, year, module_number).await? else {
            return Ok(false);
        };
        let reset = self
            .store
            .reset_record_attempts(student_id, year, &record.record_key)
            .await?;
        if reset {
            tracing::info!(student = student_id, %year, module = module_number, "attempts reset");
        }
        Ok(reset)
    }

    pub async fn attempt_stats(&self, student_id: &str, year: CohortYear) -> Result<AttemptStats> {
        let snapshot = self.store.load_year(student_id, year).await?;
        Ok(snapshot
            .records()
            .map(|records| attempts::attempt_stats(Catalog::for_year(year), records))
            .unwrap_or_default())
    }

    /// Stores a historical record, resolving its module once from the key
    /// and slug. Existing records for the module are left alone.
    pub async fn import_legacy(
        &self,
        student_id: &str,
        year: CohortYear,
        legacy: &LegacyRecord,
    ) -> Result<ImportOutcome> {
        let catalog = Catalog::for_year(year);
        let score = match scoring::score_submission(&Submission {
            total_questions: legacy.total_questions,
            correct_count: legacy.correct_count,
            answers: Default::default(),
        }) {
            Ok(score) => score,
            Err(ProgressError::InvalidSubmission(reason)) => {
                tracing::warn!(student = student_id, key = %legacy.record_key, %reason, "legacy record skipped");
                return Ok(ImportOutcome::Invalid { reason });
            }
            Err(err) => return Err(err),
        };

        let Some((module, tier)) = matcher::resolve_key(catalog, &legacy.record_key, legacy.slug.as_deref())
        else {
            tracing::warn!(student = student_id, key = %legacy.record_key, "legacy record matches no module");
            return Ok(ImportOutcome::Unresolved);
        };

        if self.store.load_student(student_id).await?.is_none() {
            return Err(ProgressError::StudentNotFound(student_id.to_string()));
        }

        let snapshot = self.store.load_year(student_id, year).await?;
        let mut records = snapshot.records().cloned().unwrap_or_default();
        if matcher::match_record(catalog, module, &records).is_some() {
            return Ok(ImportOutcome::AlreadyPresent { module });
        }

        let record = TestRecord {
            record_key: legacy.record_key.clone(),
            module_number: module,
            slug: legacy.slug.clone(),
            total_questions: score.total_questions,
            correct_count: score.correct_count,
            percentage: score.percentage,
            approved: score.approved,
            completed_at: legacy.completed_at,
            attempt_number: 1,
            attempt_history: Vec::new(),
            answers: Default::default(),
        };
        records.insert(record.record_key.clone(), record.clone());

        let progress = reconcile::recompute_year(catalog, student_id, records);
        let mut summary = reconcile::recompute_summary(catalog, &progress.records);
        if let Some(prior) = &snapshot.summary {
            summary.completed_levels = summary.completed_levels.max(prior.completed_levels);
            summary.is_complete = summary.completed_levels >= catalog.total_modules();
        }

        self.store
            .commit_year(&YearWrite {
                student_id: student_id.to_string(),
                year,
                expected_version: snapshot.version,
                record,
                progress,
                summary,
            })
            .await?;

        Ok(ImportOutcome::Imported { module, tier })
    }

    /// Recomputes every stored student-year from its records and reports
    /// projections that disagree.
    pub async fn audit(&self) -> Result<Vec<AuditFinding>> {
        let mut findings = Vec::new();

        for (student_id, year) in self.store.list_years().await? {
            let catalog = Catalog::for_year(year);
            let snapshot = self.store.load_year(&student_id, year).await?;
            let records = snapshot.records().cloned().unwrap_or_default();
            let expected_progress = reconcile::recompute_year(catalog, &student_id, records);
            let expected_summary = reconcile::recompute_summary(catalog, &expected_progress.records);
            let mut problems = Vec::new();

            if let Some(progress) = &snapshot.progress {
                for (name, stored, expected) in [
                    ("completed_count", progress.completed_count, expected_progress.completed_count),
                    ("approved_count", progress.approved_count, expected_progress.approved_count),
                    ("average_percentage", progress.average_percentage, expected_progress.average_percentage),
                    ("best_percentage", progress.best_percentage, expected_progress.best_percentage),
                    ("worst_percentage", progress.worst_percentage, expected_progress.worst_percentage),
                ] {
                    if stored != expected {
                        problems.push(format!("{name} is {stored}, records give {expected}"));
                    }
                }
            }

            if let Some(summary) = &snapshot.summary {
                if summary.approved_module_numbers != expected_summary.approved_module_numbers {
                    problems.push(format!(
                        "approved modules are {:?}, records give {:?}",
                        summary.approved_module_numbers, expected_summary.approved_module_numbers
                    ));
                }
                if summary.approved_levels != summary.approved_module_numbers.len() as u32 {
                    problems.push(format!(
                        "approved_levels is {} for {} approved modules",
                        summary.approved_levels,
                        summary.approved_module_numbers.len()
                    ));
                }
                if summary.completed_levels < expected_summary.completed_levels {
                    problems.push(format!(
                        "completed_levels {} is behind recorded module {}",
                        summary.completed_levels, expected_summary.completed_levels
                    ));
                }
                if summary.is_complete != (summary.completed_levels >= catalog.total_modules()) {
                    problems.push("is_complete disagrees with completed_levels".to_string());
                }
            }

            if !problems.is_empty() {
                tracing::warn!(student = %student_id, %year, count = problems.len(), "aggregate drift detected");
                findings.push(AuditFinding {
                    student_id,
                    year,
                    problems,
                });
            }
        }

        Ok(findings)
    }
}
