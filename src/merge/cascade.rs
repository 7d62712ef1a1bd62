// 🪜 Match Cascade - Ordered rules over a shrinking pool of rows
//
// The cascade is a fold: each rule sees only the reference rows and
// supplemental profiles that every earlier rule left unmatched, and returns
// the smaller pools for the next rule. Pairs accepted by a rule are final.

use super::rule::{BoundRule, MergeRule};
use crate::error::Result;
use crate::table::{RowRef, Table};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Row index in the reference table
    pub reference_row: usize,

    /// Row index in the supplemental profile table
    pub supplemental_row: usize,

    /// Name of the rule (or "whitelist") that produced the pair
    pub matched_on: String,
}

/// A connected group of candidates that a rule refused to resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub rule: String,

    /// Supplemental local ids involved
    pub local_ids: Vec<String>,

    /// Reference UIDs involved
    pub uids: Vec<u64>,
}

// ============================================================================
// CASCADE STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CascadeState {
    pub reference_remaining: BTreeSet<usize>,
    pub supplemental_remaining: BTreeSet<usize>,
    pub matches: Vec<MatchRecord>,
    pub ambiguous: Vec<AmbiguousMatch>,
}

impl CascadeState {
    pub fn new(
        reference_rows: impl IntoIterator<Item = usize>,
        supplemental_rows: impl IntoIterator<Item = usize>,
    ) -> Self {
        CascadeState {
            reference_remaining: reference_rows.into_iter().collect(),
            supplemental_remaining: supplemental_rows.into_iter().collect(),
            matches: Vec::new(),
            ambiguous: Vec::new(),
        }
    }

    /// Record a final pair and take both rows out of the pools
    pub fn accept(&mut self, reference_row: usize, supplemental_row: usize, matched_on: &str) {
        self.reference_remaining.remove(&reference_row);
        self.supplemental_remaining.remove(&supplemental_row);
        self.matches.push(MatchRecord {
            reference_row,
            supplemental_row,
            matched_on: matched_on.to_string(),
        });
    }
}

/// Tables and row metadata shared by every rule of one merge
pub struct CascadeInput<'a> {
    /// Reference working copy, comparison keys derived
    pub reference: &'a Table,
    pub reference_uids: &'a [u64],

    /// Supplemental profiles, comparison keys derived
    pub supplemental: &'a Table,
    pub local_id_column: usize,

    /// Reference rows already linked to this source's lineage
    pub lineage_merged: &'a HashSet<usize>,
}

// ============================================================================
// CASCADE
// ============================================================================

pub fn run_cascade(
    input: &CascadeInput<'_>,
    rules: &[MergeRule],
    initial: CascadeState,
) -> Result<CascadeState> {
    rules.iter().try_fold(initial, |state, rule| {
        let bound = rule.bind(input.reference, input.supplemental)?;
        Ok(apply_rule(input, &bound, state))
    })
}

fn key_of<'t>(table: &'t Table, row: usize, columns: impl Iterator<Item = usize>) -> Option<Vec<&'t str>> {
    columns.map(|c| table.get(row, c)).collect()
}

fn apply_rule(input: &CascadeInput<'_>, bound: &BoundRule<'_>, mut state: CascadeState) -> CascadeState {
    let rule = bound.rule;
    let accepts = |r: usize, s: usize| {
        rule.accepts(
            RowRef::new(input.reference, r),
            RowRef::new(input.supplemental, s),
        )
    };

    let pool: Vec<usize> = state
        .reference_remaining
        .iter()
        .copied()
        .filter(|r| !(rule.exclude_merged && input.lineage_merged.contains(r)))
        .collect();

    // supplemental row -> candidate reference rows, unioned over combinations
    let mut candidates: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for combo in &bound.combinations {
        let mut index: HashMap<Vec<&str>, Vec<usize>> = HashMap::new();
        for &r in &pool {
            if let Some(key) = key_of(input.reference, r, combo.iter().map(|(rc, _)| *rc)) {
                index.entry(key).or_default().push(r);
            }
        }
        for &s in &state.supplemental_remaining {
            if let Some(key) = key_of(input.supplemental, s, combo.iter().map(|(_, sc)| *sc)) {
                if let Some(rows) = index.get(&key) {
                    candidates.entry(s).or_default().extend(rows.iter().copied());
                }
            }
        }
    }

    if !rule.reject_duplicates {
        for (s, refs) in candidates.iter_mut() {
            refs.retain(|r| accepts(*r, *s));
        }
        candidates.retain(|_, refs| !refs.is_empty());
    }

    let mut reference_degree: HashMap<usize, usize> = HashMap::new();
    for refs in candidates.values() {
        for r in refs {
            *reference_degree.entry(*r).or_default() += 1;
        }
    }

    let mut unique = Vec::new();
    let mut contested: Vec<(usize, usize)> = Vec::new();
    for (s, refs) in &candidates {
        if let (1, Some(&r)) = (refs.len(), refs.first()) {
            if reference_degree.get(&r) == Some(&1) {
                unique.push((r, *s));
                continue;
            }
        }
        contested.extend(refs.iter().map(|r| (*s, *r)));
    }

    let mut accepted = 0usize;
    for (r, s) in unique {
        if rule.reject_duplicates && !accepts(r, s) {
            continue;
        }
        state.accept(r, s, &rule.name);
        accepted += 1;
    }

    let groups = ambiguous_groups(input, &rule.name, &contested);
    debug!(
        rule = %rule.name,
        candidates = candidates.len(),
        accepted,
        ambiguous = groups.len(),
        "applied merge rule"
    );
    state.ambiguous.extend(groups);
    state
}

/// Connected components of the contested (supplemental, reference) edges
fn ambiguous_groups(input: &CascadeInput<'_>, rule: &str, edges: &[(usize, usize)]) -> Vec<AmbiguousMatch> {
    let mut by_sup: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut by_ref: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(s, r) in edges {
        by_sup.entry(s).or_default().push(r);
        by_ref.entry(r).or_default().push(s);
    }

    let mut seen_sup: HashSet<usize> = HashSet::new();
    let mut groups = Vec::new();
    let mut starts: Vec<usize> = by_sup.keys().copied().collect();
    starts.sort_unstable();

    for start in starts {
        if !seen_sup.insert(start) {
            continue;
        }
        let mut sups = BTreeSet::from([start]);
        let mut refs = BTreeSet::new();
        let mut queue = VecDeque::from([start]);

        while let Some(s) = queue.pop_front() {
            for r in by_sup.get(&s).into_iter().flatten() {
                if !refs.insert(*r) {
                    continue;
                }
                for next in by_ref.get(r).into_iter().flatten() {
                    if seen_sup.insert(*next) {
                        sups.insert(*next);
                        queue.push_back(*next);
                    }
                }
            }
        }

        let mut local_ids: Vec<String> = sups
            .iter()
            .filter_map(|s| input.supplemental.get(*s, input.local_id_column))
            .map(str::to_string)
            .collect();
        local_ids.sort();
        let mut uids: Vec<u64> = refs.iter().map(|r| input.reference_uids[*r]).collect();
        uids.sort_unstable();

        groups.push(AmbiguousMatch {
            rule: rule.to_string(),
            local_ids,
            uids,
        });
    }
    groups
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::rule::PairFilter;

    fn create_test_reference() -> Table {
        Table::from_literals(
            "reference",
            &["uid", "first_name", "last_name", "birth_year", "roster_id"],
            &[
                &["1", "JOHN", "SMITH", "1950", "1"],
                &["2", "JOHN", "SMITH", "1960", "2"],
                &["3", "JANE", "DOE", "1970", ""],
            ],
        )
        .unwrap()
    }

    fn create_test_profiles() -> Table {
        Table::from_literals(
            "profiles",
            &["local_id", "first_name", "last_name", "birth_year"],
            &[
                &["1", "JOHN", "SMITH", "1960"],
                &["2", "JANE", "DOE", "1970"],
                &["3", "", "DOE", "1970"],
            ],
        )
        .unwrap()
    }

    fn run(rules: &[MergeRule], lineage: &HashSet<usize>) -> CascadeState {
        let reference = create_test_reference();
        let profiles = create_test_profiles();
        let input = CascadeInput {
            reference: &reference,
            reference_uids: &[1, 2, 3],
            supplemental: &profiles,
            local_id_column: 0,
            lineage_merged: lineage,
        };
        run_cascade(&input, rules, CascadeState::new(0..3, 0..3)).unwrap()
    }

    #[test]
    fn test_duplicate_key_is_not_merged() {
        let state = run(&[MergeRule::on("names", &["first_name", "last_name"])], &HashSet::new());

        assert_eq!(state.matches.len(), 1);
        assert_eq!(state.matches[0].reference_row, 2);
        assert_eq!(state.matches[0].supplemental_row, 1);
        assert_eq!(
            state.ambiguous,
            vec![AmbiguousMatch {
                rule: "names".to_string(),
                local_ids: vec!["1".to_string()],
                uids: vec![1, 2],
            }]
        );
    }

    #[test]
    fn test_null_key_never_matches() {
        let state = run(&[MergeRule::on("names", &["first_name", "last_name"])], &HashSet::new());
        assert!(state.supplemental_remaining.contains(&2));
    }

    #[test]
    fn test_later_rule_sees_only_leftovers() {
        let rules = vec![
            MergeRule::on("full", &["first_name", "last_name", "birth_year"]),
            MergeRule::on("names", &["first_name", "last_name"]),
        ];
        let state = run(&rules, &HashSet::new());

        let labels: Vec<(usize, usize, &str)> = state
            .matches
            .iter()
            .map(|m| (m.reference_row, m.supplemental_row, m.matched_on.as_str()))
            .collect();
        assert_eq!(labels, vec![(1, 0, "full"), (2, 1, "full")]);
        // The second rule sees reference row 0 only and no JOHN SMITH profile
        assert!(state.ambiguous.is_empty());
        assert_eq!(state.reference_remaining, BTreeSet::from([0]));
    }

    #[test]
    fn test_filter_after_ambiguity_check_when_duplicates_allowed() {
        let filter = PairFilter::YearWithin {
            reference: "birth_year".to_string(),
            supplemental: "birth_year".to_string(),
            years: 0,
        };

        let strict = MergeRule::on("names", &["first_name", "last_name"]).with_filter(filter.clone());
        let state = run(&[strict], &HashSet::new());
        assert!(!state.matches.iter().any(|m| m.supplemental_row == 0));

        let relaxed = MergeRule::on("names", &["first_name", "last_name"])
            .with_filter(filter)
            .allow_duplicates();
        let state = run(&[relaxed], &HashSet::new());
        assert!(state
            .matches
            .iter()
            .any(|m| m.supplemental_row == 0 && m.reference_row == 1));
        assert!(state.ambiguous.is_empty());
    }

    #[test]
    fn test_exclude_merged_skips_lineage_rows() {
        let lineage = HashSet::from([0usize]);
        let rule = MergeRule::on("names", &["first_name", "last_name"]).excluding_merged();
        let state = run(&[rule], &lineage);
        assert!(state
            .matches
            .iter()
            .any(|m| m.supplemental_row == 0 && m.reference_row == 1));
    }

    #[test]
    fn test_alternative_columns_union_candidates() {
        let reference = Table::from_literals(
            "reference",
            &["uid", "star"],
            &[&["1", "100"], &["2", "200"]],
        )
        .unwrap();
        let profiles = Table::from_literals(
            "profiles",
            &["local_id", "star1", "star2"],
            &[&["1", "", "200"], &["2", "100", "200"]],
        )
        .unwrap();
        let input = CascadeInput {
            reference: &reference,
            reference_uids: &[1, 2],
            supplemental: &profiles,
            local_id_column: 0,
            lineage_merged: &HashSet::new(),
        };
        let rule = MergeRule::new(
            "star",
            vec![crate::merge::rule::KeyPair::alternatives("star", &["star1", "star2"])],
        );
        let state = run_cascade(&input, &[rule], CascadeState::new(0..2, 0..2)).unwrap();

        // Profile 2 hits both stars; reference 2 is claimed by both profiles
        assert!(state.matches.is_empty());
        assert_eq!(state.ambiguous.len(), 1);
        assert_eq!(state.ambiguous[0].local_ids, vec!["1", "2"]);
        assert_eq!(state.ambiguous[0].uids, vec![1, 2]);
    }
}
