use thiserror::Error;

use crate::models::CohortYear;

/// Failures raised by a persistence adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Another session committed this student-year after it was read.
    #[error("progress for {student_id} ({year}) changed concurrently: expected version {expected}, found {found}")]
    Conflict {
        student_id: String,
        year: CohortYear,
        expected: i64,
        found: i64,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored document is malformed: {0}")]
    Malformed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("module {module} does not exist in the {year} catalog")]
    UnknownModule { year: CohortYear, module: u32 },

    #[error("student not found: {0}")]
    StudentNotFound(String),

    #[error("could not save results, try again: {0}")]
    Persistence(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ProgressError>;
