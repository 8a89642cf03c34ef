use std::collections::BTreeMap;

use crate::catalog::Catalog;
use crate::dashboard::records_by_module;
use crate::models::{AttemptSnapshot, TestRecord};
use crate::scoring::rounded_ratio;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetakeEligibility {
    pub can_retake: bool,
    pub attempts: u32,
    pub max_attempts: Option<u32>,
    pub last_percentage: Option<u32>,
}

/// Whether another attempt may be submitted. `max_attempts` of `None`
/// means unlimited; reconciliation itself never enforces a cap.
pub fn retake_eligibility(record: Option<&TestRecord>, max_attempts: Option<u32>) -> RetakeEligibility {
    let attempts = record.map(|record| record.attempt_number).unwrap_or(0);
    RetakeEligibility {
        can_retake: max_attempts.map_or(true, |max| attempts < max),
        attempts,
        max_attempts,
        last_percentage: record.map(|record| record.percentage),
    }
}

/// Every attempt of a record, most recent first.
pub fn history(record: &TestRecord) -> Vec<AttemptSnapshot> {
    let mut all = record.attempt_history.clone();
    all.push(record.snapshot());
    all.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    all
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptStats {
    pub attempted_modules: u32,
    pub total_attempts: u32,
    /// Tenths of an attempt, e.g. 15 for 1.5 attempts per module.
    pub average_attempts_tenths: u32,
    pub modules_with_retakes: u32,
}

impl AttemptStats {
    pub fn average_attempts(&self) -> f64 {
        f64::from(self.average_attempts_tenths) / 10.0
    }
}

pub fn attempt_stats(catalog: &Catalog, records: &BTreeMap<String, TestRecord>) -> AttemptStats {
    let by_module = records_by_module(catalog, records);
    let attempted_modules = by_module.len() as u32;
    let total_attempts: u32 = by_module.values().map(|record| record.attempt_number.max(1)).sum();
    let modules_with_retakes = by_module
        .values()
        .filter(|record| record.attempt_number > 1)
        .count() as u32;

    AttemptStats {
        attempted_modules,
        total_attempts,
        average_attempts_tenths: rounded_ratio(u64::from(total_attempts) * 10, u64::from(attempted_modules))
            as u32,
        modules_with_retakes,
    }
}
