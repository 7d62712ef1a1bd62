// 🔗 Merge Engine - Link one source's profiles into the reference table
//
// Flow: rule columns -> cutoff -> comparison keys -> whitelist -> rule
// cascade -> commit.
// Everything before commit works on copies; commit builds a new
// ReferenceTable and verifies it extends the old one before returning it.

pub mod cascade;
pub mod rule;
pub mod whitelist;

pub use cascade::{AmbiguousMatch, CascadeInput, CascadeState, MatchRecord};
pub use rule::{KeyPair, MatchPredicate, MergeRule, PairFilter};
pub use whitelist::{Whitelist, WhitelistEntry, WHITELIST_LABEL};

use crate::error::{LinkageError, Result};
use crate::keys::{derive_keys, KeySpec, NicknameDictionary};
use crate::reference::{ReferenceTable, UID_COLUMN};
use crate::table::{parse_year, Cell, Table};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

/// `matched_on` label for profiles that received a new UID
pub const NEW_IDENTITY_LABEL: &str = "new";

// ============================================================================
// SOURCE PLAN
// ============================================================================

/// Profiles whose `column` year is below `year` are set aside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cutoff {
    pub column: String,
    pub year: i32,
}

/// Everything the engine needs to know about one supplemental source
#[derive(Debug, Clone)]
pub struct SourcePlan {
    pub name: String,

    /// Reference column that will hold this source's local ids
    pub provenance_column: String,

    /// Local-id column of the profile table
    pub id_column: String,

    /// Profile columns copied into the reference table
    pub attributes: Vec<String>,

    pub cutoff: Option<Cutoff>,

    /// Provenance columns of earlier releases of the same source
    pub lineage_columns: Vec<String>,

    pub keys: Vec<KeySpec>,

    pub rules: Vec<MergeRule>,
}

impl SourcePlan {
    pub fn new(name: &str) -> Self {
        SourcePlan {
            name: name.to_string(),
            provenance_column: format!("{}_id", name),
            id_column: "local_id".to_string(),
            attributes: Vec::new(),
            cutoff: None,
            lineage_columns: Vec::new(),
            keys: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn attributes(mut self, columns: &[&str]) -> Self {
        self.attributes = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn cutoff(mut self, column: &str, year: i32) -> Self {
        self.cutoff = Some(Cutoff {
            column: column.to_string(),
            year,
        });
        self
    }

    pub fn lineage(mut self, columns: &[&str]) -> Self {
        self.lineage_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn key(mut self, key: KeySpec) -> Self {
        self.keys.push(key);
        self
    }

    pub fn rule(mut self, rule: MergeRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LinkageError::config("source: name is required"));
        }
        if self.provenance_column.trim().is_empty() || self.provenance_column == UID_COLUMN {
            return Err(LinkageError::config(format!(
                "source '{}': invalid provenance column '{}'",
                self.name, self.provenance_column
            )));
        }
        if self.attributes.iter().any(|a| a.as_str() == UID_COLUMN || *a == self.provenance_column) {
            return Err(LinkageError::config(format!(
                "source '{}': attributes may not include the UID or provenance column",
                self.name
            )));
        }
        if self.lineage_columns.contains(&self.provenance_column) {
            return Err(LinkageError::config(format!(
                "source '{}': lineage columns include its own provenance column",
                self.name
            )));
        }
        for key in &self.keys {
            key.validate()?;
        }
        let mut names = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(LinkageError::config(format!(
                    "source '{}': rule name '{}' is used twice",
                    self.name, rule.name
                )));
            }
            if rule.name == WHITELIST_LABEL || rule.name == NEW_IDENTITY_LABEL {
                return Err(LinkageError::config(format!(
                    "source '{}': rule name '{}' is reserved",
                    self.name, rule.name
                )));
            }
        }
        Ok(())
    }

    /// Every rule column must exist in `supplemental` (and in `reference`
    /// when given), directly or as a key derived from an existing column
    pub fn check_rule_columns(&self, reference: Option<&[String]>, supplemental: &[String]) -> Result<()> {
        let available = |columns: &[String]| -> HashSet<String> {
            let mut names: HashSet<String> = columns.iter().cloned().collect();
            names.extend(
                self.keys
                    .iter()
                    .filter(|k| columns.contains(&k.column))
                    .map(|k| k.name.clone()),
            );
            names
        };
        let missing = |table: &str, names: &HashSet<String>, wanted: &[&str]| -> Result<()> {
            match wanted.iter().find(|c| !names.contains(**c)) {
                Some(column) => Err(LinkageError::MissingColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                }),
                None => Ok(()),
            }
        };

        let profile_columns = available(supplemental);
        let reference_columns = reference.map(|columns| available(columns));
        for rule in &self.rules {
            let (reference_wanted, supplemental_wanted) = rule.column_names();
            missing(&format!("{}_profiles", self.name), &profile_columns, &supplemental_wanted)?;
            if let Some(names) = &reference_columns {
                missing("reference", names, &reference_wanted)?;
            }
        }
        Ok(())
    }

    /// Split profile rows into (participants, excluded by cutoff)
    pub fn partition_cutoff(&self, profiles: &Table) -> Result<(Vec<usize>, Vec<usize>)> {
        let Some(cutoff) = &self.cutoff else {
            return Ok(((0..profiles.len()).collect(), Vec::new()));
        };
        let col = profiles.require_column(&cutoff.column)?;
        Ok((0..profiles.len()).partition(|&row| {
            profiles
                .get(row, col)
                .and_then(parse_year)
                .map_or(true, |year| year >= cutoff.year)
        }))
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedIdentity {
    pub local_id: String,
    pub uid: u64,
    pub matched_on: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub source: String,
    pub provenance_column: String,

    /// Profiles offered to the merge
    pub profiles: usize,

    /// Profiles set aside by the cutoff, and their local ids
    pub excluded_by_cutoff: usize,
    pub excluded_local_ids: Vec<String>,

    /// Matched profiles per rule ("whitelist" included)
    pub matched_on: BTreeMap<String, usize>,

    pub minted: usize,
    pub first_new_uid: Option<u64>,

    /// Ambiguities whose local ids were not all resolved by later rules
    pub ambiguous: Vec<AmbiguousMatch>,

    /// One entry per participating profile, new identities included
    pub matches: Vec<MatchedIdentity>,
}

impl MergeReport {
    pub fn matched(&self) -> usize {
        self.matched_on.values().sum()
    }

    pub fn summary(&self) -> String {
        let rules: Vec<String> = self
            .matched_on
            .iter()
            .map(|(rule, count)| format!("{}={}", rule, count))
            .collect();
        format!(
            "{}: {} profiles, {} matched [{}], {} new, {} excluded, {} ambiguous",
            self.source,
            self.profiles,
            self.matched(),
            rules.join(", "),
            self.minted,
            self.excluded_by_cutoff,
            self.ambiguous.len()
        )
    }
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub reference: ReferenceTable,
    pub report: MergeReport,
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    whitelist: Whitelist,
    nicknames: NicknameDictionary,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_nicknames(mut self, nicknames: NicknameDictionary) -> Self {
        self.nicknames = nicknames;
        self
    }

    /// Merge one source's profiles; returns the grown reference and a report
    pub fn merge(
        &self,
        reference: &ReferenceTable,
        profiles: &Table,
        plan: &SourcePlan,
    ) -> Result<MergeOutcome> {
        plan.validate()?;
        if reference.has_source(&plan.provenance_column) {
            return Err(LinkageError::SourceAlreadyMerged(plan.provenance_column.clone()));
        }

        let id_col = profiles.require_column(&plan.id_column)?;
        for attribute in &plan.attributes {
            profiles.require_column(attribute)?;
        }
        let reference_columns = (!reference.is_empty()).then(|| reference.table().columns());
        plan.check_rule_columns(reference_columns, profiles.columns())?;
        let local_ids = local_ids(profiles, id_col)?;

        let (participants, excluded) = plan.partition_cutoff(profiles)?;
        let lineage_merged = lineage_rows(reference, &plan.lineage_columns)?;

        let by_local_id: HashMap<&str, usize> = participants
            .iter()
            .map(|&row| (local_ids[row], row))
            .collect();

        let mut state = CascadeState::new(0..reference.len(), participants.iter().copied());
        for (reference_row, profile_row) in self.whitelist.resolve(&plan.name, reference, &by_local_id)? {
            state.accept(reference_row, profile_row, WHITELIST_LABEL);
        }

        if !reference.is_empty() && !plan.rules.is_empty() {
            let mut reference_work = reference.table().clone();
            let mut profile_work = profiles.clone();
            self.derive_available(&mut reference_work, &plan.keys)?;
            self.derive_available(&mut profile_work, &plan.keys)?;

            let input = CascadeInput {
                reference: &reference_work,
                reference_uids: reference.uids(),
                supplemental: &profile_work,
                local_id_column: id_col,
                lineage_merged: &lineage_merged,
            };
            state = cascade::run_cascade(&input, &plan.rules, state)?;
        }

        let reference_after = commit(reference, profiles, plan, &participants, &state)?;
        let report = build_report(reference, &reference_after, profiles, plan, &local_ids, &excluded, state)?;

        info!(
            source = %plan.name,
            matched = report.matched(),
            minted = report.minted,
            excluded = report.excluded_by_cutoff,
            ambiguous = report.ambiguous.len(),
            "merged source"
        );
        for ambiguity in &report.ambiguous {
            warn!(
                source = %plan.name,
                rule = %ambiguity.rule,
                local_ids = ?ambiguity.local_ids,
                uids = ?ambiguity.uids,
                "ambiguous match left for review"
            );
        }

        Ok(MergeOutcome {
            reference: reference_after,
            report,
        })
    }

    /// Derive the keys whose source column exists in `table`
    fn derive_available(&self, table: &mut Table, keys: &[KeySpec]) -> Result<()> {
        let available: Vec<KeySpec> = keys
            .iter()
            .filter(|k| table.has_column(&k.column))
            .cloned()
            .collect();
        derive_keys(table, &available, &self.nicknames)
    }
}

fn local_ids(profiles: &Table, id_col: usize) -> Result<Vec<&str>> {
    let mut seen = HashSet::new();
    (0..profiles.len())
        .map(|row| {
            let id = profiles.get(row, id_col).ok_or_else(|| {
                LinkageError::invariant(format!("{} row {} has no local id", profiles.name(), row))
            })?;
            if !seen.insert(id) {
                return Err(LinkageError::invariant(format!(
                    "{}: local id '{}' appears in more than one profile",
                    profiles.name(),
                    id
                )));
            }
            Ok(id)
        })
        .collect()
}

fn lineage_rows(reference: &ReferenceTable, columns: &[String]) -> Result<HashSet<usize>> {
    let mut rows = HashSet::new();
    for column in columns {
        if !reference.has_source(column) {
            return Err(LinkageError::config(format!(
                "lineage column '{}' is not a merged source",
                column
            )));
        }
        let col = reference.table().require_column(column)?;
        rows.extend((0..reference.len()).filter(|&r| reference.table().get(r, col).is_some()));
    }
    Ok(rows)
}

// ============================================================================
// COMMIT
// ============================================================================

fn commit(
    reference: &ReferenceTable,
    profiles: &Table,
    plan: &SourcePlan,
    participants: &[usize],
    state: &CascadeState,
) -> Result<ReferenceTable> {
    let mut next = reference.clone();
    let provenance_col = next.add_provenance_column(&plan.provenance_column)?;
    let id_col = profiles.require_column(&plan.id_column)?;

    let attributes: Vec<(usize, usize)> = plan
        .attributes
        .iter()
        .map(|a| Ok((profiles.require_column(a)?, next.ensure_attribute(a)?)))
        .collect::<Result<Vec<_>>>()?;

    for m in &state.matches {
        next.set(m.reference_row, provenance_col, to_owned(profiles.get(m.supplemental_row, id_col)));
        for &(from, to) in &attributes {
            if next.get(m.reference_row, to).is_none() {
                next.set(m.reference_row, to, to_owned(profiles.get(m.supplemental_row, from)));
            }
        }
    }

    let mut minted = 0usize;
    for &row in participants.iter().filter(|r| state.supplemental_remaining.contains(r)) {
        let mut values: Vec<(usize, Cell)> = attributes
            .iter()
            .map(|&(from, to)| (to, to_owned(profiles.get(row, from))))
            .collect();
        values.push((provenance_col, to_owned(profiles.get(row, id_col))));
        next.mint(&values)?;
        minted += 1;
    }

    next.check_extends(reference)?;

    let linked = (0..next.len())
        .filter(|&r| next.get(r, provenance_col).is_some())
        .count();
    if linked != participants.len() {
        return Err(LinkageError::invariant(format!(
            "source '{}': {} of {} participating profiles linked to a UID",
            plan.name,
            linked,
            participants.len()
        )));
    }
    if next.len() != reference.len() + minted {
        return Err(LinkageError::invariant(format!(
            "source '{}': reference grew from {} to {} rows with {} new UIDs",
            plan.name,
            reference.len(),
            next.len(),
            minted
        )));
    }
    Ok(next)
}

fn to_owned(value: Option<&str>) -> Cell {
    value.map(str::to_string)
}

fn build_report(
    before: &ReferenceTable,
    after: &ReferenceTable,
    profiles: &Table,
    plan: &SourcePlan,
    local_ids: &[&str],
    excluded: &[usize],
    state: CascadeState,
) -> Result<MergeReport> {
    let mut matched_on = BTreeMap::new();
    let mut matches = Vec::new();
    for m in &state.matches {
        *matched_on.entry(m.matched_on.clone()).or_insert(0) += 1;
        matches.push(MatchedIdentity {
            local_id: local_ids[m.supplemental_row].to_string(),
            uid: before.uids()[m.reference_row],
            matched_on: m.matched_on.clone(),
        });
    }

    let new_uids = &after.uids()[before.len()..];
    let provenance_col = after.table().require_column(&plan.provenance_column)?;
    for (offset, uid) in new_uids.iter().enumerate() {
        let local_id = after
            .get(before.len() + offset, provenance_col)
            .unwrap_or_default()
            .to_string();
        matches.push(MatchedIdentity {
            local_id,
            uid: *uid,
            matched_on: NEW_IDENTITY_LABEL.to_string(),
        });
    }

    let unresolved: HashSet<&str> = state
        .supplemental_remaining
        .iter()
        .map(|&row| local_ids[row])
        .collect();
    let ambiguous = state
        .ambiguous
        .into_iter()
        .filter(|a| a.local_ids.iter().any(|id| unresolved.contains(id.as_str())))
        .collect();

    Ok(MergeReport {
        source: plan.name.clone(),
        provenance_column: plan.provenance_column.clone(),
        profiles: profiles.len(),
        excluded_by_cutoff: excluded.len(),
        excluded_local_ids: excluded.iter().map(|&row| local_ids[row].to_string()).collect(),
        matched_on,
        minted: new_uids.len(),
        first_new_uid: new_uids.first().copied(),
        ambiguous,
        matches,
    })
}

// ============================================================================
// REMERGE
// ============================================================================

/// Annotate every detail row with its UID through the source's provenance column
///
/// Rows of cutoff-excluded identities get a null UID; any other row without
/// a UID is an invariant violation.
pub fn remerge(
    detail: &Table,
    id_column: &str,
    reference: &ReferenceTable,
    provenance_column: &str,
    excluded: &HashSet<String>,
) -> Result<Table> {
    let id_col = detail.require_column(id_column)?;
    let uid_by_local = reference.local_to_uid(provenance_column)?;

    let uids = (0..detail.len())
        .map(|row| {
            let local_id = detail.get(row, id_col);
            match local_id.and_then(|id| uid_by_local.get(id)) {
                Some(uid) => Ok(Some(uid.to_string())),
                None if local_id.is_some_and(|id| excluded.contains(id)) => Ok(None),
                None => Err(LinkageError::invariant(format!(
                    "{} row {}: local id {:?} has no UID in '{}'",
                    detail.name(),
                    row,
                    local_id,
                    provenance_column
                ))),
            }
        })
        .collect::<Result<Vec<Cell>>>()?;

    let mut annotated = detail.clone();
    annotated.add_column(UID_COLUMN, uids)?;
    if annotated.len() != detail.len() {
        return Err(LinkageError::invariant("remerge changed the row count"));
    }
    Ok(annotated)
}

// ============================================================================
// TESTS
// ============================================================================
