// 🧮 Profile Aggregator - One profile row per local identity
//
// Column-group policies:
//   carry   - first non-null value (identifying columns are uniform anyway)
//   max     - conservative "ever true" maximum; logical OR for boolean flags
//   current - value from the row with the latest non-null time value
//   list    - distinct non-null values in first-seen order
//   lookup  - join a descriptive table on an already-aggregated column

use crate::error::{LinkageError, Result};
use crate::table::{compare_values, Cell, Table, LIST_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

// ============================================================================
// AGGREGATION SPEC
// ============================================================================

fn default_id_column() -> String {
    "local_id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentSpec {
    /// Column whose latest non-null value selects the row
    pub time_column: String,

    /// Columns taken from the selected row
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupSpec {
    /// Name under which the lookup table is registered
    pub table: String,

    /// Aggregated column holding the key
    pub key_column: String,

    /// Key column in the lookup table (defaults to `key_column`)
    #[serde(default)]
    pub table_key: Option<String>,

    /// Lookup-table columns appended to the profile
    pub columns: Vec<String>,
}

impl LookupSpec {
    pub fn table_key(&self) -> &str {
        self.table_key.as_deref().unwrap_or(&self.key_column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default)]
    pub carry: Vec<String>,

    #[serde(default)]
    pub max: Vec<String>,

    #[serde(default)]
    pub current: Vec<CurrentSpec>,

    #[serde(default)]
    pub list: Vec<String>,

    #[serde(default)]
    pub lookup: Vec<LookupSpec>,
}

impl AggregationSpec {
    pub fn new(id_column: &str) -> Self {
        AggregationSpec {
            id_column: id_column.to_string(),
            carry: Vec::new(),
            max: Vec::new(),
            current: Vec::new(),
            list: Vec::new(),
            lookup: Vec::new(),
        }
    }

    pub fn carry(mut self, columns: &[&str]) -> Self {
        self.carry.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn max(mut self, columns: &[&str]) -> Self {
        self.max.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn current(mut self, time_column: &str, columns: &[&str]) -> Self {
        self.current.push(CurrentSpec {
            time_column: time_column.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn list(mut self, columns: &[&str]) -> Self {
        self.list.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn lookup(mut self, table: &str, key_column: &str, columns: &[&str]) -> Self {
        self.lookup.push(LookupSpec {
            table: table.to_string(),
            key_column: key_column.to_string(),
            table_key: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    /// Aggregated columns, before lookups are appended
    fn aggregated_columns(&self) -> Vec<&String> {
        self.carry
            .iter()
            .chain(self.max.iter())
            .chain(self.current.iter().flat_map(|c| c.columns.iter()))
            .chain(self.list.iter())
            .collect()
    }

    /// Full output header in order
    pub fn output_columns(&self) -> Vec<String> {
        let mut columns = vec![self.id_column.clone()];
        columns.extend(self.aggregated_columns().into_iter().cloned());
        columns.extend(self.lookup.iter().flat_map(|l| l.columns.iter().cloned()));
        columns
    }

    pub fn validate(&self) -> Result<()> {
        if self.id_column.trim().is_empty() {
            return Err(LinkageError::config("aggregation: id_column is empty"));
        }

        let mut seen = HashSet::new();
        for column in self.output_columns() {
            if !seen.insert(column.clone()) {
                return Err(LinkageError::config(format!(
                    "aggregation: column '{}' is produced more than once",
                    column
                )));
            }
        }

        for current in &self.current {
            if current.time_column.trim().is_empty() || current.columns.is_empty() {
                return Err(LinkageError::config(
                    "aggregation: current needs a time_column and at least one column",
                ));
            }
        }

        let aggregated = self.aggregated_columns();
        for lookup in &self.lookup {
            if lookup.columns.is_empty() {
                return Err(LinkageError::config(format!(
                    "aggregation: lookup '{}' adds no columns",
                    lookup.table
                )));
            }
            if !aggregated.contains(&&lookup.key_column) {
                return Err(LinkageError::config(format!(
                    "aggregation: lookup '{}' is keyed on '{}', which is not an aggregated column",
                    lookup.table, lookup.key_column
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

#[derive(Debug)]
pub struct ProfileAggregator {
    spec: AggregationSpec,
    lookups: HashMap<String, Table>,
}

impl ProfileAggregator {
    pub fn new(spec: AggregationSpec) -> Result<Self> {
        spec.validate()?;
        Ok(ProfileAggregator {
            spec,
            lookups: HashMap::new(),
        })
    }

    /// Register a descriptive table used by `lookup` policies
    pub fn with_lookup(mut self, name: &str, table: Table) -> Self {
        self.lookups.insert(name.to_string(), table);
        self
    }

    pub fn spec(&self) -> &AggregationSpec {
        &self.spec
    }

    /// Collapse every local identity of `table` into exactly one profile row
    pub fn aggregate(&self, table: &Table) -> Result<Table> {
        let id_idx = table.require_column(&self.spec.id_column)?;
        let resolve = |cols: &[String]| -> Result<Vec<usize>> {
            cols.iter().map(|c| table.require_column(c)).collect()
        };
        let carry_idx = resolve(&self.spec.carry)?;
        let max_idx = resolve(&self.spec.max)?;
        let list_idx = resolve(&self.spec.list)?;
        let current_idx = self
            .spec
            .current
            .iter()
            .map(|c| -> Result<(usize, Vec<usize>)> {
                Ok((table.require_column(&c.time_column)?, resolve(&c.columns)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let lookups = self.prepare_lookups()?;
        let header = self.spec.output_columns();
        let lookup_keys = self
            .spec
            .lookup
            .iter()
            .map(|l| {
                header.iter().position(|c| *c == l.key_column).ok_or_else(|| {
                    LinkageError::config(format!(
                        "aggregation: lookup key '{}' is not an output column",
                        l.key_column
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Group rows by local id, remembering first appearance
        let mut members: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut ids: Vec<&str> = Vec::new();
        for row in 0..table.len() {
            let id = table.get(row, id_idx).ok_or_else(|| {
                LinkageError::invariant(format!(
                    "table '{}': row {} has no local identity",
                    table.name(),
                    row
                ))
            })?;
            members
                .entry(id)
                .or_insert_with(|| {
                    ids.push(id);
                    Vec::new()
                })
                .push(row);
        }
        ids.sort_by(|a, b| compare_ids(a, b));

        let mut profiles = Table::new(&format!("{}_profiles", table.name()), header.clone());

        for id in &ids {
            let rows = &members[id];
            let mut out: Vec<Cell> = vec![Some(id.to_string())];

            for &col in &carry_idx {
                out.push(first_non_null(table, rows, col));
            }
            for &col in &max_idx {
                out.push(max_value(table, rows, col));
            }
            for (time_col, cols) in &current_idx {
                let chosen = latest_row(table, rows, *time_col);
                for &col in cols {
                    out.push(chosen.and_then(|r| table.rows()[r][col].clone()));
                }
            }
            for &col in &list_idx {
                out.push(distinct_values(table, rows, col));
            }

            for (&key_pos, (lookup_table, key_index, value_idx)) in lookup_keys.iter().zip(&lookups) {
                let found = out[key_pos]
                    .as_deref()
                    .and_then(|key| key_index.get(key).copied());
                for &col in value_idx {
                    out.push(found.and_then(|r| lookup_table.rows()[r][col].clone()));
                }
            }

            profiles.push_row(out)?;
        }

        if profiles.len() != ids.len() {
            return Err(LinkageError::invariant(format!(
                "aggregation of '{}' produced {} profiles for {} local identities",
                table.name(),
                profiles.len(),
                ids.len()
            )));
        }

        debug!(
            table = table.name(),
            rows = table.len(),
            profiles = profiles.len(),
            "aggregated profiles"
        );

        Ok(profiles)
    }

    /// Resolve each lookup table: (table, key -> row, value column indices)
    fn prepare_lookups(&self) -> Result<Vec<(&Table, HashMap<String, usize>, Vec<usize>)>> {
        self.spec
            .lookup
            .iter()
            .map(|lookup| -> Result<(&Table, HashMap<String, usize>, Vec<usize>)> {
                let table = self.lookups.get(&lookup.table).ok_or_else(|| {
                    LinkageError::config(format!(
                        "aggregation: lookup table '{}' is not registered",
                        lookup.table
                    ))
                })?;
                let key_col = table.require_column(lookup.table_key())?;
                let value_idx = lookup
                    .columns
                    .iter()
                    .map(|c| table.require_column(c))
                    .collect::<Result<Vec<_>>>()?;

                let mut index = HashMap::new();
                for row in 0..table.len() {
                    if let Some(key) = table.get(row, key_col) {
                        index.entry(key.to_string()).or_insert(row);
                    }
                }
                Ok((table, index, value_idx))
            })
            .collect()
    }
}

/// Local ids are usually dense integers; order numerically when possible
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn first_non_null(table: &Table, rows: &[usize], col: usize) -> Cell {
    rows.iter().find_map(|&r| table.rows()[r][col].clone())
}

fn max_value(table: &Table, rows: &[usize], col: usize) -> Cell {
    let mut best: Option<&str> = None;
    for &r in rows {
        if let Some(value) = table.get(r, col) {
            best = match best {
                Some(current) if compare_values(value, current) != Ordering::Greater => Some(current),
                _ => Some(value),
            };
        }
    }
    best.map(str::to_string)
}

/// Row with the latest non-null time value; ties keep the first-encountered row
fn latest_row(table: &Table, rows: &[usize], time_col: usize) -> Option<usize> {
    let mut best: Option<(usize, &str)> = None;
    for &r in rows {
        if let Some(time) = table.get(r, time_col) {
            match best {
                Some((_, current)) if compare_values(time, current) != Ordering::Greater => {}
                _ => best = Some((r, time)),
            }
        }
    }
    best.map(|(r, _)| r)
}

fn distinct_values(table: &Table, rows: &[usize], col: usize) -> Cell {
    let mut seen = HashSet::new();
    let values: Vec<&str> = rows
        .iter()
        .filter_map(|&r| table.get(r, col))
        .filter(|v| seen.insert(*v))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(LIST_SEPARATOR))
    }
}

// ============================================================================
// TESTS
// ============================================================================
