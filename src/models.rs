use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cohort year a curriculum belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CohortYear {
    First,
    Second,
}

impl CohortYear {
    pub fn index(self) -> i16 {
        match self {
            CohortYear::First => 1,
            CohortYear::Second => 2,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            1 => Some(CohortYear::First),
            2 => Some(CohortYear::Second),
            _ => None,
        }
    }

    pub fn all() -> [CohortYear; 2] {
        [CohortYear::First, CohortYear::Second]
    }
}

impl fmt::Display for CohortYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "year {}", self.index())
    }
}

/// Typed identity of a module, produced once when a submission or import
/// enters the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleReference {
    pub year: CohortYear,
    pub sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    pub percentage: u32,
    pub approved: bool,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub record_key: String,
    pub module_number: u32,
    pub slug: Option<String>,
    pub total_questions: u32,
    pub correct_count: u32,
    pub percentage: u32,
    pub approved: bool,
    pub completed_at: DateTime<Utc>,
    pub attempt_number: u32,
    pub attempt_history: Vec<AttemptSnapshot>,
    pub answers: BTreeMap<u32, String>,
}

impl TestRecord {
    pub fn snapshot(&self) -> AttemptSnapshot {
        AttemptSnapshot {
            percentage: self.percentage,
            approved: self.approved,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearProgress {
    pub student_id: String,
    pub year: CohortYear,
    pub total_modules: u32,
    pub completed_count: u32,
    pub approved_count: u32,
    pub average_percentage: u32,
    pub best_percentage: u32,
    pub worst_percentage: u32,
    pub records: BTreeMap<String, TestRecord>,
}

impl YearProgress {
    #[cfg(test)]
    pub fn empty(student_id: &str, year: CohortYear, total_modules: u32) -> Self {
        Self {
            student_id: student_id.to_string(),
            year,
            total_modules,
            completed_count: 0,
            approved_count: 0,
            average_percentage: 0,
            best_percentage: 0,
            worst_percentage: 0,
            records: BTreeMap::new(),
        }
    }
}

/// Projection stored next to the student profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentYearSummary {
    pub completed_levels: u32,
    pub approved_levels: u32,
    pub approved_module_numbers: BTreeSet<u32>,
    pub average_percentage: u32,
    pub is_complete: bool,
}

/// Everything stored for one student-year, as read in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearSnapshot {
    pub progress: Option<YearProgress>,
    pub summary: Option<StudentYearSummary>,
    /// Zero when nothing has been committed yet.
    pub version: i64,
}

impl YearSnapshot {
    pub fn absent() -> Self {
        Self {
            progress: None,
            summary: None,
            version: 0,
        }
    }

    pub fn records(&self) -> Option<&BTreeMap<String, TestRecord>> {
        self.progress.as_ref().map(|progress| &progress.records)
    }
}

/// The batch handed to the store after a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearWrite {
    pub student_id: String,
    pub year: CohortYear,
    pub expected_version: i64,
    pub record: TestRecord,
    pub progress: YearProgress,
    pub summary: StudentYearSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub total_questions: i64,
    pub correct_count: i64,
    pub answers: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleStatus {
    Approved,
    Failed,
    InProgress,
    Pending,
}

impl ModuleStatus {
    pub fn label(self) -> &'static str {
        match self {
            ModuleStatus::Approved => "approved",
            ModuleStatus::Failed => "failed",
            ModuleStatus::InProgress => "in progress",
            ModuleStatus::Pending => "pending",
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, ModuleStatus::Approved | ModuleStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            _ => Role::Student,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub username: String,
    pub national_id: String,
    pub phone: String,
    pub age: Option<u32>,
    pub cohort_year: CohortYear,
    pub role: Role,
    pub penalized: bool,
    pub penalty_reason: String,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_access: Option<DateTime<Utc>>,
}

/// Editable profile fields. Identity fields (id, email, role) are not part
/// of the patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentPatch {
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub national_id: Option<String>,
    pub phone: Option<String>,
    pub age: Option<u32>,
    pub cohort_year: Option<CohortYear>,
    pub penalized: Option<bool>,
    pub penalty_reason: Option<String>,
}

impl StudentPatch {
    pub fn apply(&self, student: &mut Student, now: DateTime<Utc>) {
        if let Some(value) = &self.full_name {
            student.full_name = value.clone();
        }
        if let Some(value) = &self.username {
            student.username = value.clone();
        }
        if let Some(value) = &self.national_id {
            student.national_id = value.clone();
        }
        if let Some(value) = &self.phone {
            student.phone = value.clone();
        }
        if let Some(value) = self.age {
            student.age = Some(value);
        }
        if let Some(value) = self.cohort_year {
            student.cohort_year = value;
        }
        if let Some(value) = self.penalized {
            student.penalized = value;
        }
        if let Some(value) = &self.penalty_reason {
            student.penalty_reason = value.clone();
        }
        student.last_access = Some(now);
    }
}
