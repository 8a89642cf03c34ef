//! Resolves which stored test record belongs to a catalog module.
//!
//! Records written by this crate are keyed `module<N>`, but older records
//! carry free-form keys such as `test_so_001`, sometimes with a slug. Every
//! record resolves to at most one module through [`record_module`]: a
//! structural key naming a catalog module wins, then a known slug, then the
//! first catalog module whose keyword matches the key. A module is matched
//! by the records resolving to it, best tier first; within a tier the
//! lexicographically smallest key wins, which the `BTreeMap` iteration
//! order gives us directly.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::catalog::Catalog;
use crate::models::TestRecord;

lazy_static! {
    static ref STRUCTURAL_KEY: Regex = Regex::new(r"(?i)modul[eo]_?(\d+)").unwrap();
}

/// Ordered from strongest to weakest evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    StructuralKey,
    Slug,
    Keyword,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordMatch<'a> {
    pub tier: MatchTier,
    pub key: &'a str,
    pub record: &'a TestRecord,
}

/// Module number encoded in a key such as `module3`, `modulo3` or
/// `1ro_modulo_3`.
pub fn structural_number(key: &str) -> Option<u32> {
    STRUCTURAL_KEY
        .captures(key)
        .and_then(|captures| captures.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

/// The one module a key and optional slug belong to. Structural numbers
/// outside the catalog carry no identity and fall through to the slug and
/// keyword tiers.
pub fn record_module(catalog: &Catalog, key: &str, slug: Option<&str>) -> Option<(u32, MatchTier)> {
    if let Some(number) = structural_number(key).filter(|n| catalog.module(*n).is_some()) {
        return Some((number, MatchTier::StructuralKey));
    }

    if let Some(module) = slug.and_then(|slug| catalog.module_for_slug(slug)) {
        return Some((module.sequence_number, MatchTier::Slug));
    }

    catalog
        .modules()
        .iter()
        .find(|module| module.keyword.is_match(key))
        .map(|module| (module.sequence_number, MatchTier::Keyword))
}

pub fn match_record<'a>(
    catalog: &Catalog,
    module_number: u32,
    records: &'a BTreeMap<String, TestRecord>,
) -> Option<RecordMatch<'a>> {
    let found = records
        .iter()
        .filter_map(|(key, record)| match record_module(catalog, key, record.slug.as_deref()) {
            Some((number, tier)) if number == module_number => Some(RecordMatch {
                tier,
                key: key.as_str(),
                record,
            }),
            _ => None,
        })
        // min_by_key keeps the first of equal tiers, so the smallest key.
        .min_by_key(|found| found.tier);

    if let Some(found) = &found {
        tracing::debug!(
            module = module_number,
            key = found.key,
            tier = ?found.tier,
            "matched test record"
        );
    }

    found
}

/// Resolves the module of a single loosely keyed record before it is
/// stored. Used once when legacy data is imported.
pub fn resolve_key(catalog: &Catalog, key: &str, slug: Option<&str>) -> Option<(u32, MatchTier)> {
    record_module(catalog, key, slug)
}
