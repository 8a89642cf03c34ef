use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};

use crate::models::{CohortYear, Role, Student};
use crate::scoring::rounded_ratio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Active,
    Penalized,
}

impl StatusFilter {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "all" | "" => Some(Self::All),
            "active" => Some(Self::Active),
            "penalized" => Some(Self::Penalized),
            _ => None,
        }
    }

    fn admits(self, student: &Student) -> bool {
        match self {
            Self::All => true,
            Self::Active => !student.penalized,
            Self::Penalized => student.penalized,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StudentQuery {
    pub term: Option<String>,
    pub year: Option<CohortYear>,
    pub status: StatusFilter,
}

pub fn is_admin(student: &Student, admin_emails: &[String]) -> bool {
    student.role == Role::Admin
        || admin_emails
            .iter()
            .any(|email| email.trim().eq_ignore_ascii_case(&student.email))
}

/// Non-admin profiles sorted by name, ignoring case.
pub fn students_only(students: &[Student], admin_emails: &[String]) -> Vec<Student> {
    let mut listed: Vec<Student> = students
        .iter()
        .filter(|student| !is_admin(student, admin_emails))
        .cloned()
        .collect();
    listed.sort_by_key(|student| student.full_name.to_lowercase());
    listed
}

fn matches_term(student: &Student, term: &str) -> bool {
    let needle = term.to_lowercase();
    student.full_name.to_lowercase().contains(&needle)
        || student.email.to_lowercase().contains(&needle)
        || student.username.to_lowercase().contains(&needle)
        || student.national_id.contains(term)
}

pub fn search(students: &[Student], query: &StudentQuery) -> Vec<Student> {
    let term = query.term.as_deref().map(str::trim).filter(|term| !term.is_empty());
    students
        .iter()
        .filter(|student| term.map_or(true, |term| matches_term(student, term)))
        .filter(|student| query.year.map_or(true, |year| student.cohort_year == year))
        .filter(|student| query.status.admits(student))
        .cloned()
        .collect()
}

/// Most recently active students first; never-seen students are left out.
pub fn recent(students: &[Student], limit: usize) -> Vec<Student> {
    let mut seen: Vec<Student> = students
        .iter()
        .filter(|student| student.last_access.is_some())
        .cloned()
        .collect();
    seen.sort_by(|a, b| b.last_access.cmp(&a.last_access));
    seen.truncate(limit);
    seen
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStats {
    pub total: u32,
    pub active: u32,
    pub penalized: u32,
    pub by_year: BTreeMap<CohortYear, u32>,
    pub activity_rate: u32,
    pub new_this_month: u32,
}

pub fn directory_stats(students: &[Student], now: DateTime<Utc>) -> DirectoryStats {
    let total = students.len() as u32;
    let penalized = students.iter().filter(|student| student.penalized).count() as u32;
    let active = total - penalized;

    let mut by_year: BTreeMap<CohortYear, u32> = CohortYear::all().into_iter().map(|year| (year, 0)).collect();
    for student in students {
        *by_year.entry(student.cohort_year).or_insert(0) += 1;
    }

    let new_this_month = students
        .iter()
        .filter_map(|student| student.registered_at)
        .filter(|registered| registered.year() == now.year() && registered.month() == now.month())
        .count() as u32;

    DirectoryStats {
        total,
        active,
        penalized,
        by_year,
        activity_rate: rounded_ratio(u64::from(active) * 100, u64::from(total)) as u32,
        new_this_month,
    }
}
