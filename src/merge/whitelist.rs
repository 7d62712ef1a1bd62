// ✅ Whitelist - Manually confirmed (source, local id) -> UID links
//
// Entries are applied before the rule cascade and recorded with
// matched_on = "whitelist". A bad entry stops the merge.

use crate::error::{LinkageError, Result};
use crate::reference::ReferenceTable;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// `matched_on` label for whitelisted pairs
pub const WHITELIST_LABEL: &str = "whitelist";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub source: String,
    pub local_id: String,
    pub uid: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a table with `source`, `local_id` and `uid` columns
    pub fn from_table(table: &Table) -> Result<Self> {
        let source_col = table.require_column("source")?;
        let local_col = table.require_column("local_id")?;
        let uid_col = table.require_column("uid")?;

        let mut whitelist = Whitelist::new();
        for row in 0..table.len() {
            let field = |col: usize, name: &str| {
                table.get(row, col).ok_or_else(|| {
                    LinkageError::config(format!("whitelist row {}: '{}' is empty", row + 1, name))
                })
            };
            let source = field(source_col, "source")?;
            let local_id = field(local_col, "local_id")?;
            let uid = field(uid_col, "uid")?;
            let uid = uid.trim().parse::<u64>().map_err(|_| {
                LinkageError::config(format!(
                    "whitelist row {}: uid '{}' is not an integer",
                    row + 1,
                    uid
                ))
            })?;
            whitelist.insert(source, local_id, uid);
        }
        Ok(whitelist)
    }

    pub fn insert(&mut self, source: &str, local_id: &str, uid: u64) {
        self.entries.push(WhitelistEntry {
            source: source.to_string(),
            local_id: local_id.to_string(),
            uid,
        });
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (reference row, supplemental row) pairs for one source
    ///
    /// `participants` maps local id -> profile row for every profile that
    /// takes part in this merge. Each UID and each local id may appear once.
    pub fn resolve(
        &self,
        source: &str,
        reference: &ReferenceTable,
        participants: &HashMap<&str, usize>,
    ) -> Result<Vec<(usize, usize)>> {
        let uid_rows: HashMap<u64, usize> = reference
            .uids()
            .iter()
            .enumerate()
            .map(|(row, uid)| (*uid, row))
            .collect();

        let mut used_uids = HashSet::new();
        let mut used_ids = HashSet::new();
        let mut pairs = Vec::new();

        for entry in self.entries.iter().filter(|e| e.source == source) {
            let reference_row = *uid_rows.get(&entry.uid).ok_or_else(|| {
                LinkageError::config(format!(
                    "whitelist: source '{}' local id '{}' points to unknown UID {}",
                    source, entry.local_id, entry.uid
                ))
            })?;
            let profile_row = *participants.get(entry.local_id.as_str()).ok_or_else(|| {
                LinkageError::config(format!(
                    "whitelist: source '{}' has no participating local id '{}'",
                    source, entry.local_id
                ))
            })?;
            if !used_uids.insert(entry.uid) || !used_ids.insert(entry.local_id.as_str()) {
                return Err(LinkageError::config(format!(
                    "whitelist: source '{}' lists local id '{}' or UID {} more than once",
                    source, entry.local_id, entry.uid
                )));
            }
            pairs.push((reference_row, profile_row));
        }
        Ok(pairs)
    }
}
