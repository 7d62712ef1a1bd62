// 🏛️ Reference Table - The append-only master table of officer identities
//
// Identity: UID (never changes, never reused)
// Values: canonical attributes (earlier sources are more authoritative)
// Provenance: one column per merged source holding that source's local id
//
// A merge may only append a provenance column or brand-new rows. It never
// alters the UID or provenance of an existing row.

use crate::error::{LinkageError, Result};
use crate::table::{Cell, Table};
use std::collections::{HashMap, HashSet};

/// Column holding the universal identifier
pub const UID_COLUMN: &str = "uid";

// ============================================================================
// REFERENCE TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTable {
    table: Table,

    /// Provenance columns, in merge order
    provenance: Vec<String>,

    /// Parsed UID of every row (parallel to `table`)
    uids: Vec<u64>,
}

impl ReferenceTable {
    /// Reference table before the first source is merged
    pub fn empty() -> Self {
        ReferenceTable {
            table: Table::new("reference", [UID_COLUMN]),
            provenance: Vec::new(),
            uids: Vec::new(),
        }
    }

    /// Rebuild from a persisted table and its provenance column list
    pub fn from_parts(table: Table, provenance: Vec<String>) -> Result<Self> {
        let uid_col = table.require_column(UID_COLUMN)?;
        let uids = (0..table.len())
            .map(|r| parse_uid(table.get(r, uid_col), r))
            .collect::<Result<Vec<_>>>()?;

        let reference = ReferenceTable {
            table: table.with_name("reference"),
            provenance,
            uids,
        };
        reference.check_invariants()?;
        Ok(reference)
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn provenance(&self) -> &[String] {
        &self.provenance
    }

    pub fn uids(&self) -> &[u64] {
        &self.uids
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn max_uid(&self) -> Option<u64> {
        self.uids.iter().copied().max()
    }

    /// Next UID to allocate: max(existing UID) + 1
    pub fn next_uid(&self) -> u64 {
        self.max_uid().map_or(1, |m| m + 1)
    }

    pub fn has_source(&self, provenance_column: &str) -> bool {
        self.provenance.iter().any(|p| p == provenance_column)
    }

    /// Canonical attribute columns (everything but UID and provenance)
    pub fn attribute_columns(&self) -> Vec<&str> {
        self.table
            .columns()
            .iter()
            .map(String::as_str)
            .filter(|c| *c != UID_COLUMN && !self.has_source(c))
            .collect()
    }

    /// Local id -> UID mapping for one merged source
    pub fn local_to_uid(&self, provenance_column: &str) -> Result<HashMap<String, u64>> {
        if !self.has_source(provenance_column) {
            return Err(LinkageError::config(format!(
                "reference table has no provenance column '{}'",
                provenance_column
            )));
        }
        let col = self.table.require_column(provenance_column)?;
        Ok((0..self.len())
            .filter_map(|r| self.table.get(r, col).map(|id| (id.to_string(), self.uids[r])))
            .collect())
    }

    /// UID -> value of one attribute column (rows with a null value are skipped)
    pub fn attribute_by_uid(&self, column: &str) -> Result<HashMap<u64, String>> {
        let col = self.table.require_column(column)?;
        Ok((0..self.len())
            .filter_map(|r| self.table.get(r, col).map(|v| (self.uids[r], v.to_string())))
            .collect())
    }

    // ========================================================================
    // MUTATION (used by the merge engine on its own working copy)
    // ========================================================================

    pub(crate) fn add_provenance_column(&mut self, column: &str) -> Result<usize> {
        if self.has_source(column) || self.table.has_column(column) {
            return Err(LinkageError::SourceAlreadyMerged(column.to_string()));
        }
        let idx = self.table.ensure_column(column);
        self.provenance.push(column.to_string());
        Ok(idx)
    }

    pub(crate) fn ensure_attribute(&mut self, column: &str) -> Result<usize> {
        if column == UID_COLUMN || self.has_source(column) {
            return Err(LinkageError::config(format!(
                "'{}' cannot be used as a canonical attribute column",
                column
            )));
        }
        Ok(self.table.ensure_column(column))
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, value: Cell) {
        self.table.set(row, col, value);
    }

    pub(crate) fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.table.get(row, col)
    }

    /// Append a new identity with a freshly minted UID
    pub(crate) fn mint(&mut self, values: &[(usize, Cell)]) -> Result<u64> {
        let uid = self.next_uid();
        let uid_col = self.table.require_column(UID_COLUMN)?;

        let mut row: Vec<Cell> = vec![None; self.table.columns().len()];
        row[uid_col] = Some(uid.to_string());
        for (col, value) in values {
            row[*col] = value.clone();
        }
        self.table.push_row(row)?;
        self.uids.push(uid);
        Ok(uid)
    }

    // ========================================================================
    // INVARIANTS
    // ========================================================================

    /// UIDs unique; provenance columns present; each local id maps to one UID
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for uid in &self.uids {
            if !seen.insert(*uid) {
                return Err(LinkageError::invariant(format!("duplicate UID {}", uid)));
            }
        }

        for column in &self.provenance {
            let col = self.table.column_index(column).ok_or_else(|| {
                LinkageError::invariant(format!(
                    "provenance column '{}' is missing from the reference table",
                    column
                ))
            })?;
            let mut local_ids = HashSet::new();
            for row in 0..self.len() {
                if let Some(id) = self.table.get(row, col) {
                    if !local_ids.insert(id) {
                        return Err(LinkageError::invariant(format!(
                            "local id '{}' of '{}' is attached to more than one UID",
                            id, column
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// `self` must be `previous` plus appended columns and rows: same UIDs in
    /// the same positions, unchanged provenance, new UIDs above the old maximum
    pub fn check_extends(&self, previous: &ReferenceTable) -> Result<()> {
        if self.len() < previous.len() {
            return Err(LinkageError::invariant(format!(
                "reference table shrank from {} to {} identities",
                previous.len(),
                self.len()
            )));
        }

        if self.uids[..previous.len()] != previous.uids[..] {
            return Err(LinkageError::invariant(
                "an existing UID changed position or value",
            ));
        }

        if !self.provenance.starts_with(&previous.provenance) {
            return Err(LinkageError::invariant(
                "previously merged provenance columns were dropped or reordered",
            ));
        }

        for column in &previous.provenance {
            let old_col = previous.table.require_column(column)?;
            let new_col = self.table.require_column(column)?;
            for row in 0..previous.len() {
                if previous.table.get(row, old_col) != self.table.get(row, new_col) {
                    return Err(LinkageError::invariant(format!(
                        "UID {}: provenance '{}' changed",
                        previous.uids[row], column
                    )));
                }
            }
        }

        let old_max = previous.max_uid().unwrap_or(0);
        if let Some(uid) = self.uids[previous.len()..].iter().find(|u| **u <= old_max) {
            return Err(LinkageError::invariant(format!(
                "new UID {} does not exceed previous maximum {}",
                uid, old_max
            )));
        }

        self.check_invariants()
    }
}

impl Default for ReferenceTable {
    fn default() -> Self {
        Self::empty()
    }
}

fn parse_uid(value: Option<&str>, row: usize) -> Result<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            LinkageError::invariant(format!(
                "reference row {} has a missing or non-integer UID ({:?})",
                row, value
            ))
        })
}

// ============================================================================
// TESTS
// ============================================================================
