use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::catalog::Catalog;
use crate::directory::{self, DirectoryStats};
use crate::models::{CohortYear, Student, StudentYearSummary};
use crate::scoring::rounded_ratio;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearOverview {
    pub year: CohortYear,
    pub students: u32,
    pub finished: u32,
    pub approved_modules: u32,
    pub completed_modules: u32,
    pub average_percentage: u32,
}

pub fn summarize_years(summaries: &[(CohortYear, StudentYearSummary)]) -> Vec<YearOverview> {
    CohortYear::all()
        .into_iter()
        .map(|year| {
            let rows: Vec<&StudentYearSummary> = summaries
                .iter()
                .filter(|(row_year, _)| *row_year == year)
                .map(|(_, summary)| summary)
                .collect();
            let average_sum: u64 = rows.iter().map(|s| u64::from(s.average_percentage)).sum();
            YearOverview {
                year,
                students: rows.len() as u32,
                finished: rows.iter().filter(|s| s.is_complete).count() as u32,
                approved_modules: rows.iter().map(|s| s.approved_levels).sum(),
                completed_modules: rows.iter().map(|s| s.completed_levels).sum(),
                average_percentage: rounded_ratio(average_sum, rows.len() as u64) as u32,
            }
        })
        .collect()
}

pub fn build_report(
    generated_at: DateTime<Utc>,
    stats: &DirectoryStats,
    years: &[YearOverview],
    students: &[Student],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Student Progress Report");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Directory");
    let _ = writeln!(
        output,
        "- {} students, {} active, {} penalized ({}% active)",
        stats.total, stats.active, stats.penalized, stats.activity_rate
    );
    for (year, count) in &stats.by_year {
        let _ = writeln!(output, "- {}: {} students", Catalog::for_year(*year).title, count);
    }
    let _ = writeln!(output, "- {} registered this month", stats.new_this_month);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Progress by Year");

    if years.iter().all(|overview| overview.students == 0) {
        let _ = writeln!(output, "No progress recorded yet.");
    } else {
        for overview in years.iter().filter(|overview| overview.students > 0) {
            let catalog = Catalog::for_year(overview.year);
            let possible = u64::from(overview.students) * u64::from(catalog.total_modules());
            let _ = writeln!(
                output,
                "- {}: {} students, {} finished, {}% of modules completed, {}% approved, avg score {}%",
                catalog.title,
                overview.students,
                overview.finished,
                rounded_ratio(u64::from(overview.completed_modules) * 100, possible),
                rounded_ratio(u64::from(overview.approved_modules) * 100, possible),
                overview.average_percentage
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recently Active Students");

    let recent = directory::recent(students, 5);
    if recent.is_empty() {
        let _ = writeln!(output, "No student activity recorded.");
    } else {
        for student in &recent {
            let seen = student
                .last_access
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let flag = if student.penalized { " [penalized]" } else { "" };
            let _ = writeln!(
                output,
                "- {} ({}, {}) last seen {}{}",
                student.full_name, student.email, student.cohort_year, seen, flag
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::directory_stats;
    use crate::models::Role;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn summary(completed: u32, approved: u32, average: u32, complete: bool) -> StudentYearSummary {
        StudentYearSummary {
            completed_levels: completed,
            approved_levels: approved,
            approved_module_numbers: (1..=approved).collect::<BTreeSet<u32>>(),
            average_percentage: average,
            is_complete: complete,
        }
    }

    #[test]
    fn overview_groups_by_year() {
        let years = summarize_years(&[
            (CohortYear::First, summary(6, 5, 80, true)),
            (CohortYear::First, summary(3, 1, 55, false)),
            (CohortYear::Second, summary(2, 2, 90, false)),
        ]);

        assert_eq!(years.len(), 2);
        assert_eq!(years[0].students, 2);
        assert_eq!(years[0].finished, 1);
        assert_eq!(years[0].completed_modules, 9);
        assert_eq!(years[0].approved_modules, 6);
        assert_eq!(years[0].average_percentage, 68);
        assert_eq!(years[1].students, 1);
    }

    #[test]
    fn report_includes_sections() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let student = Student {
            id: "ana".to_string(),
            full_name: "Ana Ruiz".to_string(),
            email: "ana@portal.edu".to_string(),
            username: "ana".to_string(),
            national_id: "0911111111".to_string(),
            phone: String::new(),
            age: None,
            cohort_year: CohortYear::First,
            role: Role::Student,
            penalized: true,
            penalty_reason: "late".to_string(),
            registered_at: None,
            last_access: Some(now),
        };
        let stats = directory_stats(std::slice::from_ref(&student), now);
        let years = summarize_years(&[(CohortYear::First, summary(3, 3, 90, false))]);

        let report = build_report(now, &stats, &years, &[student]);
        assert!(report.contains("# Student Progress Report"));
        assert!(report.contains("- 1 students, 0 active, 1 penalized (0% active)"));
        assert!(report.contains("Primero de Bachillerato: 1 students, 0 finished, 50% of modules completed, 50% approved, avg score 90%"));
        assert!(report.contains("- Ana Ruiz (ana@portal.edu, year 1) last seen 2026-10-19 [penalized]"));
    }

    #[test]
    fn empty_report_uses_placeholders() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let report = build_report(now, &directory_stats(&[], now), &summarize_years(&[]), &[]);
        assert!(report.contains("No progress recorded yet."));
        assert!(report.contains("No student activity recorded."));
    }
}
