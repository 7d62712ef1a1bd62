// 🚚 Pipeline - Configured runs over all sources, in merge order
//
// merge:   assign -> aggregate -> merge -> remerge -> ledger -> save -> write
// remerge: re-annotate every committed source against the stored reference
// units:   resolve unit timelines from annotated unit tables
// review:  list ambiguous matches recorded in the ledger
//
// A source whose provenance column is already committed is skipped, so an
// interrupted run can simply be started again.

use crate::config::{PipelineConfig, SourceConfig};
use crate::error::{LinkageError, Result};
use crate::identity::IdentityAssigner;
use crate::intervals::{IntervalBatch, IntervalResolver, ResolutionReport};
use crate::keys::NicknameDictionary;
use crate::ledger::{AmbiguityRecord, Ledger};
use crate::merge::{remerge, MergeEngine, MergeReport, Whitelist};
use crate::profile::ProfileAggregator;
use crate::reference::ReferenceTable;
use crate::store::ReferenceStore;
use crate::table::Table;
use std::collections::HashSet;
use tracing::{info, warn};

/// One source read, identified and aggregated
pub struct PreparedSource {
    /// Source rows with the local-id column appended
    pub detail: Table,
    pub profiles: Table,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: ReferenceStore,
    engine: MergeEngine,
    ledger: Option<Ledger>,
    run_id: String,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let store = ReferenceStore::open(&config.reference.dir)?;

        let mut engine = MergeEngine::new();
        if let Some(path) = &config.whitelist {
            let whitelist = Whitelist::from_table(&Table::read_path(path)?)?;
            info!(entries = whitelist.len(), "loaded whitelist");
            engine = engine.with_whitelist(whitelist);
        }
        if let Some(path) = &config.nicknames {
            let nicknames = NicknameDictionary::from_table(&Table::read_path(path)?)?;
            info!(entries = nicknames.len(), "loaded nickname dictionary");
            engine = engine.with_nicknames(nicknames);
        }

        let ledger = match &config.ledger {
            Some(ledger) => Some(Ledger::open(&ledger.path)?),
            None => None,
        };

        Ok(Pipeline {
            config,
            store,
            engine,
            ledger,
            run_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ReferenceStore {
        &self.store
    }

    /// Read a source, assign local identities, and aggregate profiles
    pub fn prepare(source: &SourceConfig) -> Result<PreparedSource> {
        let input = Table::read_path(&source.input)?.with_name(&source.name);
        let assignment = IdentityAssigner::new(source.identity.clone())?.assign(&input)?;

        let mut aggregator = ProfileAggregator::new(source.aggregation.clone())?;
        for (name, path) in &source.lookups {
            aggregator = aggregator.with_lookup(name, Table::read_path(path)?);
        }
        let profiles = aggregator.aggregate(&assignment.table)?;

        info!(
            source = %source.name,
            rows = input.len(),
            identities = assignment.identities,
            "prepared source"
        );
        Ok(PreparedSource {
            detail: assignment.table,
            profiles,
        })
    }

    /// Merge every configured source (or only `only`) not yet committed
    pub fn merge(&mut self, only: Option<&str>) -> Result<Vec<MergeReport>> {
        if let Some(name) = only {
            if self.config.source(name).is_none() {
                return Err(LinkageError::config(format!("no source named '{}'", name)));
            }
        }

        let mut reference = self.store.load()?;
        let sources: Vec<SourceConfig> = self
            .config
            .sources
            .iter()
            .filter(|s| only.map_or(true, |name| s.name == name))
            .cloned()
            .collect();

        let mut reports = Vec::new();
        for source in &sources {
            let provenance = source.provenance_column();
            if reference.has_source(&provenance) {
                info!(source = %source.name, "already merged, skipping");
                continue;
            }
            let (next, report) = self.merge_source(source, &reference)?;
            reference = next;
            reports.push(report);
        }
        Ok(reports)
    }

    fn merge_source(
        &mut self,
        source: &SourceConfig,
        reference: &ReferenceTable,
    ) -> Result<(ReferenceTable, MergeReport)> {
        if let Some(ledger) = &self.ledger {
            ledger.merge_started(&self.run_id, &source.name)?;
        }

        let plan = source.plan();
        let prepared = Self::prepare(source)?;
        let outcome = self.engine.merge(reference, &prepared.profiles, &plan)?;

        let excluded: HashSet<String> = outcome.report.excluded_local_ids.iter().cloned().collect();
        let annotated = remerge(
            &prepared.detail,
            &plan.id_column,
            &outcome.reference,
            &plan.provenance_column,
            &excluded,
        )?;

        // Ledger first: a committed source must never lack its review records
        if let Some(ledger) = &mut self.ledger {
            ledger.record_merge(&self.run_id, &outcome.report)?;
        }
        let manifest = self.store.save(&outcome.reference, &self.run_id)?;
        annotated.write_path(&source.output)?;
        if let Some(ledger) = &self.ledger {
            ledger.merge_committed(&self.run_id, &source.name, manifest.version)?;
        }

        info!("{}", outcome.report.summary());
        Ok((outcome.reference, outcome.report))
    }

    /// Re-annotate committed sources against the stored reference
    pub fn remerge(&self) -> Result<Vec<(String, usize)>> {
        let reference = self.store.load()?;
        let mut written = Vec::new();

        for source in &self.config.sources {
            let plan = source.plan();
            if !reference.has_source(&plan.provenance_column) {
                warn!(source = %source.name, "not merged yet, skipping remerge");
                continue;
            }
            let prepared = Self::prepare(source)?;
            let (_, excluded_rows) = plan.partition_cutoff(&prepared.profiles)?;
            let id_col = prepared.profiles.require_column(&plan.id_column)?;
            let excluded: HashSet<String> = excluded_rows
                .iter()
                .filter_map(|&row| prepared.profiles.get(row, id_col))
                .map(str::to_string)
                .collect();

            let annotated = remerge(
                &prepared.detail,
                &plan.id_column,
                &reference,
                &plan.provenance_column,
                &excluded,
            )?;
            annotated.write_path(&source.output)?;
            info!(source = %source.name, rows = annotated.len(), "remerged source");
            written.push((source.name.clone(), annotated.len()));
        }
        Ok(written)
    }

    /// Resolve unit timelines and write them to the configured output
    pub fn resolve_units(&self) -> Result<ResolutionReport> {
        let units = self
            .config
            .units
            .as_ref()
            .ok_or_else(|| LinkageError::config("no [units] section configured"))?;

        let mut batch = IntervalBatch::new();
        for input in &units.inputs {
            let table = Table::read_path(&input.file)?;
            batch.extend_from_table(&table, &units.columns, input.snapshot)?;
        }

        let mut resolver = IntervalResolver::new();
        if let Some(column) = &units.resignation_column {
            let reference = self.store.load()?;
            resolver = resolver.with_resignations(IntervalResolver::resignations_from(&reference, column)?);
        }

        let report = resolver.resolve(&batch);
        report.to_table()?.write_path(&units.output)?;
        if report.malformed > 0 {
            warn!(malformed = report.malformed, "skipped malformed unit rows");
        }
        info!(
            officers = report.officers,
            input = report.input,
            erroneous = report.erroneous,
            spans = report.spans.len(),
            "resolved unit history"
        );
        Ok(report)
    }

    /// Ambiguous matches recorded in the ledger, optionally for one source
    ///
    /// Only records of the run that committed each source are listed; a run
    /// interrupted before its save leaves records that no longer apply.
    pub fn review(&self, source: Option<&str>) -> Result<Vec<AmbiguityRecord>> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| LinkageError::config("no [ledger] section configured"))?;
        let records = match source {
            Some(name) => ledger.ambiguous_matches_for(name)?,
            None => ledger.all_ambiguous_matches()?,
        };

        let committed_by = self
            .store
            .manifest()?
            .map(|m| m.committed_by)
            .unwrap_or_default();
        Ok(records
            .into_iter()
            .filter(|record| {
                self.config.source(&record.source).is_some_and(|s| {
                    committed_by.get(&s.provenance_column()) == Some(&record.run_id)
                })
            })
            .collect())
    }
}
