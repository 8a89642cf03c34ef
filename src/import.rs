use std::io::Read;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{CohortYear, Submission};
use crate::scoring::{self, GradedSheet};
use crate::service::LegacyRecord;

#[derive(Debug, Deserialize)]
struct LegacyRow {
    student_id: String,
    year: i64,
    record_key: Option<String>,
    slug: Option<String>,
    total_questions: i64,
    correct_count: i64,
    completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyImport {
    pub student_id: String,
    pub year: CohortYear,
    pub record: LegacyRecord,
}

fn cohort_year(value: i64, line: usize) -> anyhow::Result<CohortYear> {
    CohortYear::from_index(value).with_context(|| format!("row {line}: unknown cohort year {value}"))
}

/// Reads historical test records. Rows without a key get a generated one,
/// so their module can only come from the slug.
pub fn read_legacy<R: Read>(source: R) -> anyhow::Result<Vec<LegacyImport>> {
    let mut reader = csv::Reader::from_reader(source);
    let mut rows = Vec::new();

    for (index, result) in reader.deserialize::<LegacyRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("row {line}: malformed legacy record"))?;
        let record_key = row
            .record_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| format!("legacy-{}", Uuid::new_v4()));

        rows.push(LegacyImport {
            student_id: row.student_id,
            year: cohort_year(row.year, line)?,
            record: LegacyRecord {
                record_key,
                slug: row.slug.filter(|slug| !slug.trim().is_empty()),
                total_questions: row.total_questions,
                correct_count: row.correct_count,
                completed_at: row.completed_at,
            },
        });
    }

    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct SimulationRow {
    student_id: String,
    year: i64,
    module: u32,
    answer_key: String,
    answers: String,
}

#[derive(Debug, Clone)]
pub struct SimulatedSubmission {
    pub student_id: String,
    pub year: CohortYear,
    pub module: u32,
    pub sheet: GradedSheet,
    pub submission: Submission,
}

/// Reads answer sheets to replay. Both answer columns are comma separated
/// lists in question order.
pub fn read_simulation<R: Read>(source: R) -> anyhow::Result<Vec<SimulatedSubmission>> {
    let mut reader = csv::Reader::from_reader(source);
    let mut rows = Vec::new();

    for (index, result) in reader.deserialize::<SimulationRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("row {line}: malformed submission"))?;
        let answer_key: Vec<String> = row.answer_key.split(',').map(|value| value.trim().to_string()).collect();
        let answers = scoring::parse_answer_list(&row.answers);
        let sheet = scoring::grade(&answer_key, &answers);

        rows.push(SimulatedSubmission {
            student_id: row.student_id,
            year: cohort_year(row.year, line)?,
            module: row.module,
            submission: sheet.clone().into_submission(answers),
            sheet,
        });
    }

    Ok(rows)
}
