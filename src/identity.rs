// 🪪 Intra-file Identity Assigner - Local identities within one source table
//
// Rows sharing the exact identifying-column tuple are one local identity.
// Nulls compare equal to nulls, so rows missing all identifying data
// collapse into one shared, low-confidence identity unless conflict
// columns force a split.

use crate::error::{LinkageError, Result};
use crate::table::{Cell, Table};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Conflict columns are ignored; the identifying tuple alone decides
    #[default]
    Keep,

    /// Rows that disagree on a non-null conflict value become distinct identities
    Split,
}

fn default_local_id_column() -> String {
    "local_id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Columns whose exact tuple defines a local identity
    pub id_columns: Vec<String>,

    /// Columns used to split identities whose members disagree
    #[serde(default)]
    pub conflict_columns: Vec<String>,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Name of the column added to the output table
    #[serde(default = "default_local_id_column")]
    pub output_column: String,
}

impl IdentityConfig {
    pub fn new(id_columns: &[&str]) -> Self {
        IdentityConfig {
            id_columns: id_columns.iter().map(|c| c.to_string()).collect(),
            conflict_columns: Vec::new(),
            conflict_policy: ConflictPolicy::Keep,
            output_column: default_local_id_column(),
        }
    }

    pub fn with_conflicts(mut self, columns: &[&str], policy: ConflictPolicy) -> Self {
        self.conflict_columns = columns.iter().map(|c| c.to_string()).collect();
        self.conflict_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id_columns.is_empty() {
            return Err(LinkageError::config(
                "identity: at least one identifying column is required",
            ));
        }
        if has_duplicates(&self.id_columns) {
            return Err(LinkageError::config(
                "identity: identifying columns contain duplicates",
            ));
        }
        if self.output_column.trim().is_empty() {
            return Err(LinkageError::config("identity: output column name is empty"));
        }
        if self.id_columns.contains(&self.output_column) {
            return Err(LinkageError::config(format!(
                "identity: output column '{}' is also an identifying column",
                self.output_column
            )));
        }
        if self.conflict_policy == ConflictPolicy::Split && self.conflict_columns.is_empty() {
            return Err(LinkageError::config(
                "identity: conflict_policy = \"split\" requires conflict_columns",
            ));
        }
        if let Some(col) = self
            .conflict_columns
            .iter()
            .find(|c| self.id_columns.contains(c))
        {
            return Err(LinkageError::config(format!(
                "identity: '{}' is both an identifying and a conflict column",
                col
            )));
        }
        Ok(())
    }
}

fn has_duplicates(values: &[String]) -> bool {
    let mut seen = std::collections::HashSet::new();
    values.iter().any(|v| !seen.insert(v))
}

// ============================================================================
// ASSIGNMENT RESULT
// ============================================================================

#[derive(Debug, Clone)]
pub struct IdentityAssignment {
    /// Input rows, in input order, with the local-id column appended
    pub table: Table,

    /// Local id (1-based) of every input row
    pub labels: Vec<usize>,

    /// Number of distinct local identities
    pub identities: usize,
}

impl IdentityAssignment {
    /// Row indices grouped by identity, identities in label order
    pub fn partition(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.identities];
        for (row, label) in self.labels.iter().enumerate() {
            groups[label - 1].push(row);
        }
        groups
    }
}

/// A sub-identity inside one identifying-key group, with the conflict
/// values it has absorbed so far
struct SubIdentity {
    label: usize,
    known: Vec<Cell>,
}

impl SubIdentity {
    fn accepts(&self, values: &[Cell]) -> bool {
        self.known.iter().zip(values).all(|(known, value)| match (known, value) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        })
    }

    fn absorb(&mut self, values: &[Cell]) {
        for (known, value) in self.known.iter_mut().zip(values) {
            if known.is_none() {
                *known = value.clone();
            }
        }
    }
}

// ============================================================================
// ASSIGNER
// ============================================================================

pub struct IdentityAssigner {
    config: IdentityConfig,
}

impl IdentityAssigner {
    pub fn new(config: IdentityConfig) -> Result<Self> {
        config.validate()?;
        Ok(IdentityAssigner { config })
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Partition rows into local identities, labelled 1..=n by first appearance
    pub fn assign(&self, table: &Table) -> Result<IdentityAssignment> {
        let id_idx = self
            .config
            .id_columns
            .iter()
            .map(|c| table.require_column(c))
            .collect::<Result<Vec<_>>>()?;

        let conflict_idx = match self.config.conflict_policy {
            ConflictPolicy::Split => self
                .config
                .conflict_columns
                .iter()
                .map(|c| table.require_column(c))
                .collect::<Result<Vec<_>>>()?,
            ConflictPolicy::Keep => Vec::new(),
        };

        let mut groups: HashMap<Vec<Cell>, Vec<SubIdentity>> = HashMap::new();
        let mut labels = Vec::with_capacity(table.len());
        let mut next_label = 1usize;

        for row in table.rows() {
            let key: Vec<Cell> = id_idx.iter().map(|&i| row[i].clone()).collect();
            let conflicts: Vec<Cell> = conflict_idx.iter().map(|&i| row[i].clone()).collect();

            let subs = groups.entry(key).or_default();
            let label = match subs.iter_mut().find(|s| s.accepts(&conflicts)) {
                Some(sub) => {
                    sub.absorb(&conflicts);
                    sub.label
                }
                None => {
                    let label = next_label;
                    next_label += 1;
                    subs.push(SubIdentity {
                        label,
                        known: conflicts,
                    });
                    label
                }
            };
            labels.push(label);
        }

        let identities = next_label - 1;
        if labels.len() != table.len() {
            return Err(LinkageError::invariant(format!(
                "identity assignment for '{}' labelled {} of {} rows",
                table.name(),
                labels.len(),
                table.len()
            )));
        }

        let mut annotated = table.clone();
        annotated.add_column(
            &self.config.output_column,
            labels.iter().map(|l| Some(l.to_string())).collect(),
        )?;

        debug!(
            table = table.name(),
            rows = table.len(),
            identities,
            "assigned local identities"
        );

        Ok(IdentityAssignment {
            table: annotated,
            labels,
            identities,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
