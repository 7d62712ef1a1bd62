// ⚙️ Pipeline Configuration - One TOML file describes a whole linkage run
//
// Relative paths are resolved against the directory holding the config
// file. Everything is validated up front so a bad rule or a misspelled
// policy fails before any table is read.

use crate::error::{LinkageError, Result};
use crate::identity::IdentityConfig;
use crate::intervals::IntervalColumns;
use crate::keys::KeySpec;
use crate::merge::{Cutoff, MergeRule, SourcePlan};
use crate::profile::AggregationSpec;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Whitelist table (`source,local_id,uid`)
    #[serde(default)]
    pub whitelist: Option<PathBuf>,

    /// Nickname table (`name,nickname`)
    #[serde(default)]
    pub nicknames: Option<PathBuf>,

    pub reference: ReferenceConfig,

    #[serde(default)]
    pub ledger: Option<LedgerConfig>,

    /// Sources in merge order, earliest (most authoritative) first
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub units: Option<UnitsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Cleaned source table
    pub input: PathBuf,

    /// Source table annotated with local id and UID
    pub output: PathBuf,

    pub identity: IdentityConfig,
    pub aggregation: AggregationSpec,

    /// Descriptive tables joined during aggregation, by name
    #[serde(default)]
    pub lookups: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub provenance_column: Option<String>,

    #[serde(default)]
    pub attributes: Vec<String>,

    #[serde(default)]
    pub cutoff: Option<Cutoff>,

    #[serde(default)]
    pub lineage_columns: Vec<String>,

    #[serde(default)]
    pub keys: Vec<KeySpec>,

    #[serde(default)]
    pub rules: Vec<MergeRule>,
}

impl SourceConfig {
    pub fn provenance_column(&self) -> String {
        self.provenance_column
            .clone()
            .unwrap_or_else(|| format!("{}_id", self.name))
    }

    pub fn plan(&self) -> SourcePlan {
        SourcePlan {
            name: self.name.clone(),
            provenance_column: self.provenance_column(),
            id_column: self.aggregation.id_column.clone(),
            attributes: self.attributes.clone(),
            cutoff: self.cutoff.clone(),
            lineage_columns: self.lineage_columns.clone(),
            keys: self.keys.clone(),
            rules: self.rules.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UnitsConfig {
    pub inputs: Vec<UnitInput>,

    #[serde(default)]
    pub columns: IntervalColumns,

    pub output: PathBuf,

    /// Reference column holding resignation dates
    #[serde(default)]
    pub resignation_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitInput {
    pub file: PathBuf,

    /// Date of the roster the file was taken from
    #[serde(default)]
    pub snapshot: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl PipelineConfig {
    /// Parse and validate; relative paths are resolved against `base_dir`
    pub fn from_toml(input: &str, base_dir: &Path) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(input)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let input = fs::read_to_string(path).map_err(|e| {
            LinkageError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml(&input, base_dir)
    }

    fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.reference.dir);
        if let Some(ledger) = &mut self.ledger {
            resolve(base, &mut ledger.path);
        }
        if let Some(path) = &mut self.whitelist {
            resolve(base, path);
        }
        if let Some(path) = &mut self.nicknames {
            resolve(base, path);
        }
        for source in &mut self.sources {
            resolve(base, &mut source.input);
            resolve(base, &mut source.output);
            for path in source.lookups.values_mut() {
                resolve(base, path);
            }
        }
        if let Some(units) = &mut self.units {
            resolve(base, &mut units.output);
            for input in &mut units.inputs {
                resolve(base, &mut input.file);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut provenance: Vec<String> = Vec::new();

        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(LinkageError::config(format!(
                    "source '{}' is listed twice",
                    source.name
                )));
            }

            source.identity.validate()?;
            source.aggregation.validate()?;
            if source.aggregation.id_column != source.identity.output_column {
                return Err(LinkageError::config(format!(
                    "source '{}': aggregation id_column '{}' must be the identity output column '{}'",
                    source.name, source.aggregation.id_column, source.identity.output_column
                )));
            }
            if let Some(lookup) = source
                .aggregation
                .lookup
                .iter()
                .find(|l| !source.lookups.contains_key(&l.table))
            {
                return Err(LinkageError::config(format!(
                    "source '{}': lookup table '{}' has no file in [sources.lookups]",
                    source.name, lookup.table
                )));
            }

            let plan = source.plan();
            plan.validate()?;
            plan.check_rule_columns(None, &source.aggregation.output_columns())?;
            if provenance.contains(&plan.provenance_column) {
                return Err(LinkageError::config(format!(
                    "source '{}': provenance column '{}' is already used by another source",
                    source.name, plan.provenance_column
                )));
            }
            let later: Vec<String> = self
                .sources
                .iter()
                .skip_while(|s| s.name != source.name)
                .skip(1)
                .map(SourceConfig::provenance_column)
                .collect();
            if let Some(column) = plan.lineage_columns.iter().find(|c| later.contains(c)) {
                return Err(LinkageError::config(format!(
                    "source '{}': lineage column '{}' belongs to a later source",
                    source.name, column
                )));
            }
            provenance.push(plan.provenance_column);
        }

        if let Some(units) = &self.units {
            if units.inputs.is_empty() {
                return Err(LinkageError::config("units: at least one input is required"));
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
