//! End-to-end tests for cross-source linkage.
//!
//! - Existing UIDs never change when a later source is merged
//! - A profile matching two UIDs under one rule is never force-merged
//! - Merging through the on-disk store equals merging in memory
//! - A configured pipeline annotates every source row and is restartable
//! - Every committed source keeps its ambiguities reviewable across runs

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use officer_linkage::{
    AmbiguousMatch, IdentityAssigner, IdentityConfig, KeySpec, KeyTransform, Ledger, LinkageError,
    MergeEngine, MergeReport, MergeRule, Pipeline, PipelineConfig, ReferenceStore, ReferenceTable,
    SourcePlan, Table,
};
use tempfile::TempDir;

// ────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────

fn reference_with_john() -> ReferenceTable {
    let table = Table::from_literals(
        "reference",
        &["uid", "first_name", "last_name", "appointed_date", "star", "roster_id"],
        &[&["1", "JOHN", "SMITH", "1980-01-01", "100", "1"]],
    )
    .unwrap();
    ReferenceTable::from_parts(table, vec!["roster_id".to_string()]).unwrap()
}

fn salary_plan() -> SourcePlan {
    SourcePlan::new("salary")
        .attributes(&["first_name", "last_name", "appointed_date", "salary"])
        .rule(MergeRule::on("base", &["first_name", "last_name", "appointed_date"]))
}

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

// ────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────

#[test]
fn matching_profile_keeps_existing_uid() {
    let profiles = Table::from_literals(
        "salary_profiles",
        &["local_id", "first_name", "last_name", "appointed_date", "salary"],
        &[&["1", "JOHN", "SMITH", "1980-01-01", "50000"]],
    )
    .unwrap();

    let outcome = MergeEngine::new()
        .merge(&reference_with_john(), &profiles, &salary_plan())
        .unwrap();

    assert_eq!(outcome.reference.uids(), &[1]);
    assert_eq!(outcome.reference.next_uid(), 2);
    assert!(outcome.reference.has_source("salary_id"));
    assert_eq!(outcome.reference.table().value(0, "salary_id"), Some("1"));
    assert_eq!(outcome.report.minted, 0);
    assert_eq!(outcome.report.first_new_uid, None);
}

#[test]
fn ambiguous_profile_falls_through_to_looser_rule() {
    let table = Table::from_literals(
        "reference",
        &["uid", "first_name", "last_name", "appointed_date", "star", "roster_id"],
        &[
            &["1", "JOHN", "SMITH", "1980-01-01", "100", "1"],
            &["2", "JOHN", "SMITH", "1990-01-01", "200", "2"],
        ],
    )
    .unwrap();
    let reference = ReferenceTable::from_parts(table, vec!["roster_id".to_string()]).unwrap();
    let profiles = Table::from_literals(
        "award_profiles",
        &["local_id", "first_name", "last_name", "star"],
        &[&["1", "JOHN", "SMITH", "200"]],
    )
    .unwrap();
    let plan = SourcePlan::new("award")
        .attributes(&["first_name", "last_name", "star"])
        .rule(MergeRule::on("names", &["first_name", "last_name"]))
        .rule(MergeRule::on("names_star", &["first_name", "last_name", "star"]));

    let outcome = MergeEngine::new().merge(&reference, &profiles, &plan).unwrap();

    assert_eq!(outcome.report.matched_on.get("names"), None);
    assert_eq!(outcome.report.matched_on.get("names_star"), Some(&1));
    assert_eq!(outcome.reference.table().value(0, "award_id"), None);
    assert_eq!(outcome.reference.table().value(1, "award_id"), Some("1"));
    assert_eq!(outcome.report.minted, 0);
}

#[test]
fn ambiguous_profile_without_fallback_becomes_new_identity() {
    let table = Table::from_literals(
        "reference",
        &["uid", "first_name", "last_name", "roster_id"],
        &[&["1", "JOHN", "SMITH", "1"], &["2", "JOHN", "SMITH", "2"]],
    )
    .unwrap();
    let reference = ReferenceTable::from_parts(table, vec!["roster_id".to_string()]).unwrap();
    let profiles = Table::from_literals(
        "award_profiles",
        &["local_id", "first_name", "last_name"],
        &[&["1", "JOHN", "SMITH"]],
    )
    .unwrap();
    let plan = SourcePlan::new("award")
        .attributes(&["first_name", "last_name"])
        .rule(MergeRule::on("names", &["first_name", "last_name"]));

    let outcome = MergeEngine::new().merge(&reference, &profiles, &plan).unwrap();

    assert_eq!(outcome.report.matched(), 0);
    assert_eq!(outcome.report.minted, 1);
    assert_eq!(outcome.reference.uids(), &[1, 2, 3]);
    assert_eq!(outcome.report.ambiguous.len(), 1);
    assert_eq!(outcome.report.ambiguous[0].local_ids, vec!["1"]);
}

#[test]
fn derived_keys_match_spelling_variants() {
    let profiles = Table::from_literals(
        "salary_profiles",
        &["local_id", "first_name", "last_name", "appointed_date", "salary"],
        &[&["1", "JOHNATHAN", "SMITH-", "1980-01-01", "50000"]],
    )
    .unwrap();
    let plan = SourcePlan::new("salary")
        .attributes(&["first_name", "last_name", "appointed_date"])
        .key(KeySpec::new("F4FN", "first_name", KeyTransform::Prefix(4)))
        .key(KeySpec::new("last_name_NS", "last_name", KeyTransform::Strip))
        .rule(MergeRule::on("base", &["first_name", "last_name", "appointed_date"]))
        .rule(MergeRule::on("short", &["F4FN", "last_name_NS", "appointed_date"]));

    let outcome = MergeEngine::new()
        .merge(&reference_with_john(), &profiles, &plan)
        .unwrap();

    assert_eq!(outcome.report.matched_on.get("short"), Some(&1));
    assert_eq!(outcome.reference.len(), 1);
    // Derived key columns never reach the reference table
    assert!(!outcome.reference.table().has_column("F4FN"));
}

#[test]
fn source_cannot_be_merged_twice() {
    let profiles = Table::from_literals(
        "salary_profiles",
        &["local_id", "first_name", "last_name", "appointed_date", "salary"],
        &[&["1", "JOHN", "SMITH", "1980-01-01", "50000"]],
    )
    .unwrap();
    let engine = MergeEngine::new();
    let once = engine
        .merge(&reference_with_john(), &profiles, &salary_plan())
        .unwrap();

    let err = engine
        .merge(&once.reference, &profiles, &salary_plan())
        .unwrap_err();
    assert!(matches!(err, LinkageError::SourceAlreadyMerged(ref column) if column == "salary_id"));
}

#[test]
fn identity_assignment_is_stable_across_runs() {
    let table = Table::from_literals(
        "roster",
        &["first_name", "last_name", "star"],
        &[
            &["JOHN", "SMITH", "100"],
            &["JOHN", "SMITH", "100"],
            &["JANE", "DOE", "200"],
        ],
    )
    .unwrap();
    let assigner =
        IdentityAssigner::new(IdentityConfig::new(&["first_name", "last_name", "star"])).unwrap();

    let first = assigner.assign(&table).unwrap();
    let second = assigner.assign(&table).unwrap();

    assert_eq!(first.labels, vec![1, 1, 2]);
    assert_eq!(first.labels, second.labels);
    assert_eq!(first.identities, 2);
}

// ────────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────────

#[test]
fn merging_through_store_matches_in_memory() {
    let dir = TempDir::new().unwrap();
    let store = ReferenceStore::open(dir.path()).unwrap();
    let engine = MergeEngine::new();

    let roster = Table::from_literals(
        "roster_profiles",
        &["local_id", "first_name", "last_name", "appointed_date"],
        &[
            &["1", "JOHN", "SMITH", "1980-01-01"],
            &["2", "JANE", "DOE", ""],
        ],
    )
    .unwrap();
    let roster_plan = SourcePlan::new("roster").attributes(&["first_name", "last_name", "appointed_date"]);
    let salary = Table::from_literals(
        "salary_profiles",
        &["local_id", "first_name", "last_name", "appointed_date", "salary"],
        &[
            &["1", "BOB", "KING", "2001-04-04", "30000"],
            &["2", "JOHN", "SMITH", "1980-01-01", "50000"],
        ],
    )
    .unwrap();

    // In memory
    let a = engine.merge(&ReferenceTable::empty(), &roster, &roster_plan).unwrap();
    let b = engine.merge(&a.reference, &salary, &salary_plan()).unwrap();

    // Through the store, one load/save per source
    let loaded = store.load().unwrap();
    assert!(loaded.is_empty());
    let first = engine.merge(&loaded, &roster, &roster_plan).unwrap();
    store.save(&first.reference, "run-1").unwrap();
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.uids(), first.reference.uids());
    let second = engine.merge(&reloaded, &salary, &salary_plan()).unwrap();
    let manifest = store.save(&second.reference, "run-2").unwrap();

    assert_eq!(manifest.version, 2);
    assert_eq!(manifest.next_uid, 4);
    let stored = store.load().unwrap();
    assert_eq!(stored.uids(), b.reference.uids());
    assert_eq!(stored.provenance(), b.reference.provenance());
    assert_eq!(stored.table().columns(), b.reference.table().columns());
    assert_eq!(stored.table().rows(), b.reference.table().rows());

    // UIDs committed by the first source are untouched
    assert_eq!(&stored.uids()[..2], a.reference.uids());
    assert_eq!(stored.table().value(0, "salary_id"), Some("2"));
    assert_eq!(stored.table().value(2, "first_name"), Some("BOB"));
}

#[test]
fn store_refuses_table_that_drops_rows() {
    let dir = TempDir::new().unwrap();
    let store = ReferenceStore::open(dir.path()).unwrap();
    let roster = Table::from_literals(
        "roster_profiles",
        &["local_id", "first_name"],
        &[&["1", "JOHN"], &["2", "JANE"]],
    )
    .unwrap();
    let plan = SourcePlan::new("roster").attributes(&["first_name"]);
    let outcome = MergeEngine::new()
        .merge(&ReferenceTable::empty(), &roster, &plan)
        .unwrap();
    store.save(&outcome.reference, "run-1").unwrap();

    let err = store.save(&ReferenceTable::empty(), "run-2").unwrap_err();
    assert!(err.is_invariant_violation());
    assert_eq!(store.load().unwrap().len(), 2);
}

// ────────────────────────────────────────────────────────────────────
// Pipeline
// ────────────────────────────────────────────────────────────────────

const CONFIG: &str = r#"
[reference]
dir = "reference"

[ledger]
path = "ledger.db"

[[sources]]
name = "roster"
input = "roster.csv"
output = "roster_out.csv"
attributes = ["first_name", "last_name", "appointed_date", "star"]

[sources.identity]
id_columns = ["first_name", "last_name", "appointed_date"]

[sources.aggregation]
carry = ["first_name", "last_name", "appointed_date"]
max = ["star"]

[[sources]]
name = "salary"
input = "salary.csv"
output = "salary_out.csv"
attributes = ["first_name", "last_name", "appointed_date", "salary"]
cutoff = { column = "appointed_date", year = 1960 }

[sources.identity]
id_columns = ["first_name", "last_name", "appointed_date"]

[sources.aggregation]
carry = ["first_name", "last_name", "appointed_date"]
current = [{ time_column = "year", columns = ["salary"] }]

[[sources.rules]]
name = "base"
keys = [
    { reference = "first_name", supplemental = ["first_name"] },
    { reference = "last_name", supplemental = ["last_name"] },
    { reference = "appointed_date", supplemental = ["appointed_date"] },
]

[[sources.rules]]
name = "names"
keys = [
    { reference = "first_name", supplemental = ["first_name"] },
    { reference = "last_name", supplemental = ["last_name"] },
]

[units]
output = "unit_history.csv"
inputs = [{ file = "units.csv", snapshot = "2018-01-01" }]
"#;

const ROSTER: &str = "first_name,last_name,appointed_date,star
JOHN,SMITH,1980-01-01,100
JOHN,SMITH,1980-01-01,100
JANE,DOE,1990-02-02,200
ANN,LEE,1985-03-03,300
ANN,LEE,1985-03-03,
ANN,LEE,1995-03-03,400
";

const SALARY: &str = "first_name,last_name,appointed_date,salary,year
JOHN,SMITH,1980-01-01,50000,2016
JOHN,SMITH,1980-01-01,52000,2017
JANE,DOE,,41000,2017
BOB,KING,2001-04-04,30000,2017
OLD,TIMER,1950-01-01,10000,2017
ANN,LEE,2000-01-01,45000,2017
";

const UNITS: &str = "uid,unit,start_date,end_date
1,A,2001-01-01,2001-06-01
1,A,2001-06-01,
1,B,2001-05-01,2001-12-01
2,C,,
";

fn configured_workspace() -> (TempDir, PipelineConfig) {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "roster.csv", ROSTER);
    write(dir.path(), "salary.csv", SALARY);
    write(dir.path(), "units.csv", UNITS);
    let config = PipelineConfig::from_toml(CONFIG, dir.path()).unwrap();
    (dir, config)
}

#[test]
fn pipeline_links_sources_and_is_restartable() {
    let (dir, config) = configured_workspace();
    let mut pipeline = Pipeline::new(config.clone()).unwrap();

    let reports = pipeline.merge(None).unwrap();
    assert_eq!(reports.len(), 2);

    // roster: JOHN=1, JANE=2, ANN(1985)=3, ANN(1995)=4
    assert_eq!(reports[0].minted, 4);
    assert_eq!(reports[0].first_new_uid, Some(1));

    // salary: JOHN on base, JANE on names, BOB new, OLD set aside,
    // ANN ambiguous between 3 and 4 so minted
    let salary = &reports[1];
    assert_eq!(salary.matched_on.get("base"), Some(&1));
    assert_eq!(salary.matched_on.get("names"), Some(&1));
    assert_eq!(salary.excluded_by_cutoff, 1);
    assert_eq!(salary.minted, 2);
    assert_eq!(salary.ambiguous.len(), 1);
    assert_eq!(salary.ambiguous[0].uids, vec![3, 4]);

    let reference = pipeline.store().load().unwrap();
    assert_eq!(reference.len(), 6);
    assert_eq!(reference.provenance(), &["roster_id".to_string(), "salary_id".to_string()]);

    let annotated = Table::read_path(&dir.path().join("salary_out.csv")).unwrap();
    assert_eq!(annotated.len(), 6);
    assert_eq!(annotated.value(0, "uid"), Some("1"));
    assert_eq!(annotated.value(1, "uid"), Some("1"));
    assert_eq!(annotated.value(2, "uid"), Some("2"));
    assert_eq!(annotated.value(4, "uid"), None);
    let uids: HashSet<&str> = (0..annotated.len()).filter_map(|r| annotated.value(r, "uid")).collect();
    assert_eq!(uids.len(), 4);

    // Profiles carry the most recent salary onto the reference
    let john_salary = reference.attribute_by_uid("salary").unwrap();
    assert_eq!(john_salary.get(&1).map(String::as_str), Some("52000"));

    let review = pipeline.review(Some("salary")).unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].ambiguity.rule, "names");
    assert_eq!(review[0].run_id, pipeline.run_id());

    // A second run finds nothing left to merge
    let mut rerun = Pipeline::new(config).unwrap();
    assert!(rerun.merge(None).unwrap().is_empty());
    assert_eq!(rerun.store().load().unwrap().uids(), reference.uids());
}

#[test]
fn pipeline_remerge_and_units() {
    let (dir, config) = configured_workspace();
    let mut pipeline = Pipeline::new(config).unwrap();
    pipeline.merge(Some("roster")).unwrap();

    // Only roster is committed so far
    let written = pipeline.remerge().unwrap();
    assert_eq!(written, vec![("roster".to_string(), 6)]);
    let roster = Table::read_path(&dir.path().join("roster_out.csv")).unwrap();
    assert_eq!(roster.value(4, "uid"), Some("3"));
    assert_eq!(roster.value(5, "uid"), Some("4"));

    let report = pipeline.resolve_units().unwrap();
    assert_eq!(report.input, 3);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.spans.len(), 3);

    let history = Table::read_path(&dir.path().join("unit_history.csv")).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.value(0, "unit"), Some("A"));
    assert_eq!(history.value(1, "unit"), Some("B"));
    assert_eq!(history.value(2, "end_date"), None);
}

#[test]
fn review_survives_interrupted_and_repeated_runs() {
    let (dir, config) = configured_workspace();

    // A run that recorded its merge but stopped before saving the reference
    {
        let mut ledger = Ledger::open(&dir.path().join("ledger.db")).unwrap();
        let stale = MergeReport {
            source: "salary".to_string(),
            provenance_column: "salary_id".to_string(),
            ambiguous: vec![AmbiguousMatch {
                rule: "names".to_string(),
                local_ids: vec!["9".to_string()],
                uids: vec![1, 2],
            }],
            ..Default::default()
        };
        ledger.record_merge("interrupted", &stale).unwrap();
    }
    assert!(ReferenceStore::open(&dir.path().join("reference")).unwrap().manifest().unwrap().is_none());

    let mut pipeline = Pipeline::new(config.clone()).unwrap();
    pipeline.merge(None).unwrap();
    let review = pipeline.review(Some("salary")).unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].run_id, pipeline.run_id());
    assert_eq!(review[0].ambiguity.uids, vec![3, 4]);

    // The next run skips the committed source and still lists its ambiguity
    let mut rerun = Pipeline::new(config).unwrap();
    assert!(rerun.merge(None).unwrap().is_empty());
    let review = rerun.review(None).unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].source, "salary");
    assert_eq!(review[0].run_id, pipeline.run_id());

    let manifest = rerun.store().manifest().unwrap().unwrap();
    assert_eq!(
        manifest.committed_by.get("salary_id").map(String::as_str),
        Some(pipeline.run_id())
    );
}

#[test]
fn pipeline_rejects_unknown_source() {
    let (_dir, config) = configured_workspace();
    let mut pipeline = Pipeline::new(config).unwrap();
    let err = pipeline.merge(Some("payroll")).unwrap_err();
    assert!(err.is_configuration());
}
