use std::collections::BTreeMap;

use crate::catalog::Catalog;
use crate::matcher;
use crate::models::{CohortYear, ModuleStatus, StudentYearSummary, TestRecord, YearSnapshot};
use crate::reconcile;
use crate::scoring::rounded_ratio;
use crate::status::{derive_status, display_percentage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleView {
    pub number: u32,
    pub title: &'static str,
    pub status: ModuleStatus,
    pub percentage: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardStats {
    pub total: u32,
    pub completed: u32,
    pub approved: u32,
    pub failed: u32,
    pub in_progress: u32,
    pub pending: u32,
    pub average_percentage: u32,
    pub best_percentage: u32,
}

/// Where the dashboard data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Live,
    /// Last good dashboard served because the store could not be read.
    Stale,
    /// Nothing cached and the store could not be read.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dashboard {
    pub year: CohortYear,
    pub year_title: &'static str,
    pub modules: Vec<ModuleView>,
    pub summary: StudentYearSummary,
    pub stats: DashboardStats,
    pub progress_percent: u32,
    pub next_modules: Vec<u32>,
    pub recent_modules: Vec<u32>,
    pub can_download_certificate: bool,
    pub freshness: Freshness,
}

impl Dashboard {
    #[cfg(test)]
    pub fn module(&self, number: u32) -> Option<&ModuleView> {
        self.modules.iter().find(|module| module.number == number)
    }
}

pub fn build_dashboard(catalog: &Catalog, snapshot: &YearSnapshot) -> Dashboard {
    let empty = BTreeMap::new();
    let records = snapshot.records().unwrap_or(&empty);

    // Documents written before progress was tracked per year only carry the
    // profile projection, so its levels stand in for the counters.
    let (completed_count, approved_count) = match (&snapshot.progress, &snapshot.summary) {
        (Some(progress), _) => (progress.completed_count, progress.approved_count),
        (None, Some(summary)) => (summary.completed_levels, summary.approved_levels),
        (None, None) => (0, 0),
    };

    let modules: Vec<ModuleView> = catalog
        .modules()
        .iter()
        .map(|module| {
            let matched = matcher::match_record(catalog, module.sequence_number, records)
                .map(|found| found.record);
            let status = derive_status(module.sequence_number, matched, completed_count, approved_count);
            ModuleView {
                number: module.sequence_number,
                title: module.title,
                status,
                percentage: display_percentage(status, matched),
                attempts: matched.map(|record| record.attempt_number).unwrap_or(0),
            }
        })
        .collect();

    let summary = match (&snapshot.summary, &snapshot.progress) {
        (Some(summary), _) => summary.clone(),
        (None, Some(progress)) => reconcile::recompute_summary(catalog, &progress.records),
        (None, None) => StudentYearSummary::default(),
    };

    assemble(catalog, modules, summary, Freshness::Live)
}

/// All-pending dashboard used when nothing can be read.
pub fn fallback_dashboard(catalog: &Catalog) -> Dashboard {
    let modules = catalog
        .modules()
        .iter()
        .map(|module| ModuleView {
            number: module.sequence_number,
            title: module.title,
            status: ModuleStatus::Pending,
            percentage: 0,
            attempts: 0,
        })
        .collect();

    assemble(catalog, modules, StudentYearSummary::default(), Freshness::Fallback)
}

fn assemble(
    catalog: &Catalog,
    modules: Vec<ModuleView>,
    summary: StudentYearSummary,
    freshness: Freshness,
) -> Dashboard {
    let stats = compute_stats(&modules);
    let progress_percent = rounded_ratio(u64::from(stats.completed) * 100, u64::from(stats.total)) as u32;

    let mut upcoming: Vec<&ModuleView> = modules
        .iter()
        .filter(|module| matches!(module.status, ModuleStatus::InProgress | ModuleStatus::Pending))
        .collect();
    upcoming.sort_by_key(|module| (module.status != ModuleStatus::InProgress, module.number));
    let next_modules = upcoming.iter().take(3).map(|module| module.number).collect();

    let recent_modules = modules
        .iter()
        .rev()
        .filter(|module| module.status.is_completed())
        .take(4)
        .map(|module| module.number)
        .collect();

    let can_download_certificate =
        freshness != Freshness::Fallback && (summary.is_complete || stats.completed >= stats.total);

    Dashboard {
        year: catalog.year,
        year_title: catalog.title,
        modules,
        summary,
        stats,
        progress_percent,
        next_modules,
        recent_modules,
        can_download_certificate,
        freshness,
    }
}

fn compute_stats(modules: &[ModuleView]) -> DashboardStats {
    let count = |status: ModuleStatus| modules.iter().filter(|m| m.status == status).count() as u32;
    let completed: Vec<&ModuleView> = modules.iter().filter(|m| m.status.is_completed()).collect();
    let sum: u64 = completed.iter().map(|m| u64::from(m.percentage)).sum();

    DashboardStats {
        total: modules.len() as u32,
        completed: completed.len() as u32,
        approved: count(ModuleStatus::Approved),
        failed: count(ModuleStatus::Failed),
        in_progress: count(ModuleStatus::InProgress),
        pending: count(ModuleStatus::Pending),
        average_percentage: rounded_ratio(sum, completed.len() as u64) as u32,
        best_percentage: modules.iter().map(|m| m.percentage).max().unwrap_or(0),
    }
}

/// Records of a snapshot keyed by the module they resolve to.
pub fn records_by_module<'a>(
    catalog: &Catalog,
    records: &'a BTreeMap<String, TestRecord>,
) -> BTreeMap<u32, &'a TestRecord> {
    catalog
        .modules()
        .iter()
        .filter_map(|module| {
            matcher::match_record(catalog, module.sequence_number, records)
                .map(|found| (module.sequence_number, found.record))
        })
        .collect()
}
