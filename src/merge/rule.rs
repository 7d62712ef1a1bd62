// 📐 Merge Rules - One step of the ordered matching cascade
//
// A rule names the key columns that must agree between a reference row and a
// supplemental profile. Each key may list alternative supplemental columns;
// every combination of alternatives is tried and the candidate pairs are
// unioned.

use crate::error::{LinkageError, Result};
use crate::table::{parse_date, parse_year, RowRef, Table};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Extra pairwise condition supplied in code
pub type MatchPredicate = Arc<dyn Fn(RowRef<'_>, RowRef<'_>) -> bool + Send + Sync>;

fn default_true() -> bool {
    true
}

// ============================================================================
// KEY PAIR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Column of the reference table
    pub reference: String,

    /// Interchangeable columns of the supplemental profiles
    pub supplemental: Vec<String>,
}

impl KeyPair {
    pub fn same(column: &str) -> Self {
        KeyPair {
            reference: column.to_string(),
            supplemental: vec![column.to_string()],
        }
    }

    pub fn alternatives(reference: &str, supplemental: &[&str]) -> Self {
        KeyPair {
            reference: reference.to_string(),
            supplemental: supplemental.iter().map(|c| c.to_string()).collect(),
        }
    }
}

// ============================================================================
// PAIR FILTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairFilter {
    /// Values agree, or at least one side is null
    Compatible { reference: String, supplemental: String },

    /// Both dates present and at most `days` apart
    DateWithin {
        reference: String,
        supplemental: String,
        days: i64,
    },

    /// Both years present and at most `years` apart
    YearWithin {
        reference: String,
        supplemental: String,
        years: i32,
    },
}

impl PairFilter {
    fn columns(&self) -> (&str, &str) {
        match self {
            PairFilter::Compatible {
                reference,
                supplemental,
            }
            | PairFilter::DateWithin {
                reference,
                supplemental,
                ..
            }
            | PairFilter::YearWithin {
                reference,
                supplemental,
                ..
            } => (reference.as_str(), supplemental.as_str()),
        }
    }

    pub fn accepts(&self, reference: RowRef<'_>, supplemental: RowRef<'_>) -> bool {
        let (ref_col, sup_col) = self.columns();
        let left = reference.value(ref_col);
        let right = supplemental.value(sup_col);

        match self {
            PairFilter::Compatible { .. } => match (left, right) {
                (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
                _ => true,
            },
            PairFilter::DateWithin { days, .. } => {
                match (left.and_then(parse_date), right.and_then(parse_date)) {
                    (Some(a), Some(b)) => (a - b).num_days().abs() <= *days,
                    _ => false,
                }
            }
            PairFilter::YearWithin { years, .. } => {
                match (left.and_then(parse_year), right.and_then(parse_year)) {
                    (Some(a), Some(b)) => (a - b).abs() <= *years,
                    _ => false,
                }
            }
        }
    }
}

// ============================================================================
// MERGE RULE
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct MergeRule {
    /// Label recorded as `matched_on` for every pair this rule accepts
    pub name: String,

    pub keys: Vec<KeyPair>,

    /// Refuse pairs whose key is shared by several candidates, before filtering
    #[serde(default = "default_true")]
    pub reject_duplicates: bool,

    /// Skip reference rows already linked to this source's lineage
    #[serde(default)]
    pub exclude_merged: bool,

    #[serde(default)]
    pub filters: Vec<PairFilter>,

    #[serde(skip)]
    pub predicate: Option<MatchPredicate>,
}

impl fmt::Debug for MergeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRule")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("reject_duplicates", &self.reject_duplicates)
            .field("exclude_merged", &self.exclude_merged)
            .field("filters", &self.filters)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// A rule bound to column positions of one reference/supplemental pair
pub(crate) struct BoundRule<'r> {
    pub rule: &'r MergeRule,

    /// One (reference column, supplemental column) list per key combination
    pub combinations: Vec<Vec<(usize, usize)>>,
}

impl MergeRule {
    pub fn new(name: &str, keys: Vec<KeyPair>) -> Self {
        MergeRule {
            name: name.to_string(),
            keys,
            reject_duplicates: true,
            exclude_merged: false,
            filters: Vec::new(),
            predicate: None,
        }
    }

    /// Rule whose key columns have the same name on both sides
    pub fn on(name: &str, columns: &[&str]) -> Self {
        Self::new(name, columns.iter().map(|c| KeyPair::same(c)).collect())
    }

    pub fn allow_duplicates(mut self) -> Self {
        self.reject_duplicates = false;
        self
    }

    pub fn excluding_merged(mut self) -> Self {
        self.exclude_merged = true;
        self
    }

    pub fn with_filter(mut self, filter: PairFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(RowRef<'_>, RowRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LinkageError::config("merge rule: name is required"));
        }
        if self.keys.is_empty() {
            return Err(LinkageError::config(format!(
                "merge rule '{}': at least one key column is required",
                self.name
            )));
        }
        if let Some(key) = self.keys.iter().find(|k| k.supplemental.is_empty()) {
            return Err(LinkageError::config(format!(
                "merge rule '{}': key '{}' has no supplemental column",
                self.name, key.reference
            )));
        }
        Ok(())
    }

    /// Every concrete key mapping, as (reference, supplemental) column names
    pub fn combinations(&self) -> Vec<Vec<(&str, &str)>> {
        self.keys.iter().fold(vec![Vec::new()], |acc, key| {
            acc.iter()
                .flat_map(|prefix| {
                    key.supplemental.iter().map(move |sup| {
                        let mut next = prefix.clone();
                        next.push((key.reference.as_str(), sup.as_str()));
                        next
                    })
                })
                .collect()
        })
    }

    /// Columns the rule reads, as (reference, supplemental) name lists
    pub fn column_names(&self) -> (Vec<&str>, Vec<&str>) {
        let mut reference = Vec::new();
        let mut supplemental = Vec::new();
        for key in &self.keys {
            reference.push(key.reference.as_str());
            supplemental.extend(key.supplemental.iter().map(String::as_str));
        }
        for filter in &self.filters {
            let (r, s) = filter.columns();
            reference.push(r);
            supplemental.push(s);
        }
        (reference, supplemental)
    }

    /// Resolve column names against both tables; missing columns are errors
    pub(crate) fn bind(&self, reference: &Table, supplemental: &Table) -> Result<BoundRule<'_>> {
        for filter in &self.filters {
            let (ref_col, sup_col) = filter.columns();
            reference.require_column(ref_col)?;
            supplemental.require_column(sup_col)?;
        }

        let combinations = self
            .combinations()
            .into_iter()
            .map(|combo| {
                combo
                    .into_iter()
                    .map(|(r, s)| Ok((reference.require_column(r)?, supplemental.require_column(s)?)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BoundRule {
            rule: self,
            combinations,
        })
    }

    /// Filters and predicate, applied to one candidate pair
    pub fn accepts(&self, reference: RowRef<'_>, supplemental: RowRef<'_>) -> bool {
        self.filters.iter().all(|f| f.accepts(reference, supplemental))
            && self
                .predicate
                .as_ref()
                .map_or(true, |p| p(reference, supplemental))
    }
}

// ============================================================================
// TESTS
// ============================================================================
