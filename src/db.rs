use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::StoreError;
use crate::models::{
    AttemptSnapshot, CohortYear, Role, Student, StudentPatch, StudentYearSummary, TestRecord,
    YearProgress, YearSnapshot, YearWrite,
};
use crate::store::ProgressStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Inserts the demo roster and returns it.
pub async fn seed(pool: &PgPool) -> anyhow::Result<Vec<Student>> {
    let registered = Utc
        .with_ymd_and_hms(2026, 2, 2, 8, 0, 0)
        .single()
        .context("invalid date")?;
    let students = vec![
        seed_student("Avery Lee", "avery.lee@portal.edu", "1720011223", CohortYear::First, registered),
        seed_student("Jules Moreno", "jules.moreno@portal.edu", "1720044556", CohortYear::Second, registered),
        seed_student("Kiara Patel", "kiara.patel@portal.edu", "1720077889", CohortYear::First, registered),
    ];

    let store = PgStore::new(pool.clone());
    for student in &students {
        store.upsert_student(student).await?;
    }

    Ok(students)
}

fn seed_student(
    name: &str,
    email: &str,
    national_id: &str,
    cohort_year: CohortYear,
    registered_at: DateTime<Utc>,
) -> Student {
    Student {
        id: email.split('@').next().unwrap_or(email).replace('.', "-"),
        full_name: name.to_string(),
        email: email.to_string(),
        username: email.split('@').next().unwrap_or(email).to_string(),
        national_id: national_id.to_string(),
        phone: String::new(),
        age: Some(16),
        cohort_year,
        role: Role::Student,
        penalized: false,
        penalty_reason: String::new(),
        registered_at: Some(registered_at),
        last_access: None,
    }
}

/// Postgres-backed progress store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        student_id: &str,
        year: CohortYear,
    ) -> Result<i64, StoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM progress_tracker.year_progress \
             WHERE student_id = $1 AND year_index = $2 FOR UPDATE",
        )
        .bind(student_id)
        .bind(year.index())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(version.unwrap_or(0))
    }
}

fn column_u32(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.get(column);
    u32::try_from(value).map_err(|_| StoreError::Malformed(format!("{column} is negative: {value}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn year_from_row(row: &PgRow, column: &str) -> Result<CohortYear, StoreError> {
    let index: i16 = row.get(column);
    CohortYear::from_index(i64::from(index))
        .ok_or_else(|| StoreError::Malformed(format!("unknown cohort year {index}")))
}

fn record_from_row(row: &PgRow) -> Result<TestRecord, StoreError> {
    let Json(attempt_history): Json<Vec<AttemptSnapshot>> = row.get("attempt_history");
    let Json(answers): Json<BTreeMap<u32, String>> = row.get("answers");
    Ok(TestRecord {
        record_key: row.get("record_key"),
        module_number: column_u32(row, "module_number")?,
        slug: row.get("slug"),
        total_questions: column_u32(row, "total_questions")?,
        correct_count: column_u32(row, "correct_count")?,
        percentage: column_u32(row, "percentage")?,
        approved: row.get("approved"),
        completed_at: row.get("completed_at"),
        attempt_number: column_u32(row, "attempt_number")?,
        attempt_history,
        answers,
    })
}

fn student_from_row(row: &PgRow) -> Result<Student, StoreError> {
    let age: Option<i32> = row.get("age");
    let role: String = row.get("role");
    Ok(Student {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        username: row.get("username"),
        national_id: row.get("national_id"),
        phone: row.get("phone"),
        age: age.and_then(|value| u32::try_from(value).ok()),
        cohort_year: year_from_row(row, "cohort_year")?,
        role: Role::parse(&role),
        penalized: row.get("penalized"),
        penalty_reason: row.get("penalty_reason"),
        registered_at: row.get("registered_at"),
        last_access: row.get("last_access"),
    })
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn load_year(&self, student_id: &str, year: CohortYear) -> Result<YearSnapshot, StoreError> {
        let progress_row = sqlx::query(
            "SELECT total_modules, completed_count, approved_count, average_percentage, \
             best_percentage, worst_percentage, version \
             FROM progress_tracker.year_progress WHERE student_id = $1 AND year_index = $2",
        )
        .bind(student_id)
        .bind(year.index())
        .fetch_optional(&self.pool)
        .await?;

        let summary_row = sqlx::query(
            "SELECT completed_levels, approved_levels, approved_modules, average_percentage, is_complete \
             FROM progress_tracker.year_summaries WHERE student_id = $1 AND year_index = $2",
        )
        .bind(student_id)
        .bind(year.index())
        .fetch_optional(&self.pool)
        .await?;

        let mut version = 0;
        let progress = match progress_row {
            Some(row) => {
                version = row.get("version");
                let record_rows = sqlx::query(
                    "SELECT record_key, module_number, slug, total_questions, correct_count, \
                     percentage, approved, completed_at, attempt_number, attempt_history, answers \
                     FROM progress_tracker.test_records \
                     WHERE student_id = $1 AND year_index = $2",
                )
                .bind(student_id)
                .bind(year.index())
                .fetch_all(&self.pool)
                .await?;

                let mut records = BTreeMap::new();
                for record_row in record_rows {
                    let record = record_from_row(&record_row)?;
                    records.insert(record.record_key.clone(), record);
                }

                Some(YearProgress {
                    student_id: student_id.to_string(),
                    year,
                    total_modules: column_u32(&row, "total_modules")?,
                    completed_count: column_u32(&row, "completed_count")?,
                    approved_count: column_u32(&row, "approved_count")?,
                    average_percentage: column_u32(&row, "average_percentage")?,
                    best_percentage: column_u32(&row, "best_percentage")?,
                    worst_percentage: column_u32(&row, "worst_percentage")?,
                    records,
                })
            }
            None => None,
        };

        let summary = match summary_row {
            Some(row) => {
                let approved: Vec<i32> = row.get("approved_modules");
                Some(StudentYearSummary {
                    completed_levels: column_u32(&row, "completed_levels")?,
                    approved_levels: column_u32(&row, "approved_levels")?,
                    approved_module_numbers: approved
                        .into_iter()
                        .filter_map(|n| u32::try_from(n).ok())
                        .collect(),
                    average_percentage: column_u32(&row, "average_percentage")?,
                    is_complete: row.get("is_complete"),
                })
            }
            None => None,
        };

        Ok(YearSnapshot {
            progress,
            summary,
            version,
        })
    }

    async fn commit_year(&self, write: &YearWrite) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let next_version = write.expected_version + 1;

        // Row locks only cover existing rows; a concurrent first insert is
        // caught by the version guard on the upsert below.
        let found = Self::current_version(&mut tx, &write.student_id, write.year).await?;
        if found != write.expected_version {
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                student_id: write.student_id.clone(),
                year: write.year,
                expected: write.expected_version,
                found,
            });
        }
        let progress = &write.progress;

        let updated = sqlx::query(
            r#"
            INSERT INTO progress_tracker.year_progress
            (student_id, year_index, total_modules, completed_count, approved_count,
             average_percentage, best_percentage, worst_percentage, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (student_id, year_index) DO UPDATE
            SET total_modules = EXCLUDED.total_modules,
                completed_count = EXCLUDED.completed_count,
                approved_count = EXCLUDED.approved_count,
                average_percentage = EXCLUDED.average_percentage,
                best_percentage = EXCLUDED.best_percentage,
                worst_percentage = EXCLUDED.worst_percentage,
                version = EXCLUDED.version,
                updated_at = NOW()
            WHERE progress_tracker.year_progress.version = $10
            "#,
        )
        .bind(&write.student_id)
        .bind(write.year.index())
        .bind(to_i32(progress.total_modules))
        .bind(to_i32(progress.completed_count))
        .bind(to_i32(progress.approved_count))
        .bind(to_i32(progress.average_percentage))
        .bind(to_i32(progress.best_percentage))
        .bind(to_i32(progress.worst_percentage))
        .bind(next_version)
        .bind(write.expected_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let found = Self::current_version(&mut tx, &write.student_id, write.year).await?;
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                student_id: write.student_id.clone(),
                year: write.year,
                expected: write.expected_version,
                found,
            });
        }

        let record = &write.record;
        sqlx::query(
            r#"
            INSERT INTO progress_tracker.test_records
            (student_id, year_index, record_key, module_number, slug, total_questions,
             correct_count, percentage, approved, completed_at, attempt_number,
             attempt_history, answers)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (student_id, year_index, record_key) DO UPDATE
            SET module_number = EXCLUDED.module_number,
                slug = EXCLUDED.slug,
                total_questions = EXCLUDED.total_questions,
                correct_count = EXCLUDED.correct_count,
                percentage = EXCLUDED.percentage,
                approved = EXCLUDED.approved,
                completed_at = EXCLUDED.completed_at,
                attempt_number = EXCLUDED.attempt_number,
                attempt_history = EXCLUDED.attempt_history,
                answers = EXCLUDED.answers
            "#,
        )
        .bind(&write.student_id)
        .bind(write.year.index())
        .bind(&record.record_key)
        .bind(to_i32(record.module_number))
        .bind(record.slug.as_deref())
        .bind(to_i32(record.total_questions))
        .bind(to_i32(record.correct_count))
        .bind(to_i32(record.percentage))
        .bind(record.approved)
        .bind(record.completed_at)
        .bind(to_i32(record.attempt_number))
        .bind(Json(&record.attempt_history))
        .bind(Json(&record.answers))
        .execute(&mut *tx)
        .await?;

        let summary = &write.summary;
        let approved_modules: Vec<i32> = summary
            .approved_module_numbers
            .iter()
            .map(|n| to_i32(*n))
            .collect();
        sqlx::query(
            r#"
            INSERT INTO progress_tracker.year_summaries
            (student_id, year_index, completed_levels, approved_levels, approved_modules,
             average_percentage, is_complete, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (student_id, year_index) DO UPDATE
            SET completed_levels = EXCLUDED.completed_levels,
                approved_levels = EXCLUDED.approved_levels,
                approved_modules = EXCLUDED.approved_modules,
                average_percentage = EXCLUDED.average_percentage,
                is_complete = EXCLUDED.is_complete,
                updated_at = NOW()
            "#,
        )
        .bind(&write.student_id)
        .bind(write.year.index())
        .bind(to_i32(summary.completed_levels))
        .bind(to_i32(summary.approved_levels))
        .bind(&approved_modules)
        .bind(to_i32(summary.average_percentage))
        .bind(summary.is_complete)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE progress_tracker.students SET last_access = NOW() WHERE id = $1",
        )
        .bind(&write.student_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            student = %write.student_id,
            year = %write.year,
            record = %record.record_key,
            version = next_version,
            "committed year progress"
        );
        Ok(next_version)
    }

    async fn reset_record_attempts(
        &self,
        student_id: &str,
        year: CohortYear,
        record_key: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE progress_tracker.test_records
            SET attempt_number = 1, attempt_history = '[]'::jsonb
            WHERE student_id = $1 AND year_index = $2 AND record_key = $3
            "#,
        )
        .bind(student_id)
        .bind(year.index())
        .bind(record_key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE progress_tracker.year_progress SET version = version + 1, updated_at = NOW() \
             WHERE student_id = $1 AND year_index = $2",
        )
        .bind(student_id)
        .bind(year.index())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_years(&self) -> Result<Vec<(String, CohortYear)>, StoreError> {
        let rows = sqlx::query(
            "SELECT student_id, year_index FROM progress_tracker.year_progress \
             UNION SELECT student_id, year_index FROM progress_tracker.year_summaries \
             ORDER BY student_id, year_index",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut years = Vec::new();
        for row in rows {
            years.push((row.get("student_id"), year_from_row(&row, "year_index")?));
        }
        Ok(years)
    }

    async fn load_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let row = sqlx::query("SELECT * FROM progress_tracker.students WHERE id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let rows = sqlx::query("SELECT * FROM progress_tracker.students")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn upsert_student(&self, student: &Student) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO progress_tracker.students
            (id, full_name, email, username, national_id, phone, age, cohort_year, role,
             penalized, penalty_reason, registered_at, last_access)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                username = EXCLUDED.username,
                national_id = EXCLUDED.national_id,
                phone = EXCLUDED.phone,
                age = EXCLUDED.age,
                cohort_year = EXCLUDED.cohort_year,
                penalized = EXCLUDED.penalized,
                penalty_reason = EXCLUDED.penalty_reason
            "#,
        )
        .bind(&student.id)
        .bind(&student.full_name)
        .bind(&student.email)
        .bind(&student.username)
        .bind(&student.national_id)
        .bind(&student.phone)
        .bind(student.age.map(to_i32))
        .bind(student.cohort_year.index())
        .bind(student.role.as_str())
        .bind(student.penalized)
        .bind(&student.penalty_reason)
        .bind(student.registered_at)
        .bind(student.last_access)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_student(
        &self,
        student_id: &str,
        patch: &StudentPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE progress_tracker.students
            SET full_name = COALESCE($2, full_name),
                username = COALESCE($3, username),
                national_id = COALESCE($4, national_id),
                phone = COALESCE($5, phone),
                age = COALESCE($6, age),
                cohort_year = COALESCE($7, cohort_year),
                penalized = COALESCE($8, penalized),
                penalty_reason = COALESCE($9, penalty_reason),
                last_access = $10
            WHERE id = $1
            "#,
        )
        .bind(student_id)
        .bind(patch.full_name.as_deref())
        .bind(patch.username.as_deref())
        .bind(patch.national_id.as_deref())
        .bind(patch.phone.as_deref())
        .bind(patch.age.map(to_i32))
        .bind(patch.cohort_year.map(CohortYear::index))
        .bind(patch.penalized)
        .bind(patch.penalty_reason.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
