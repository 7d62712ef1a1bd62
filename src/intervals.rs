// 🕰️ Interval Resolver - One clean unit timeline per officer
//
// Raw unit assignments arrive from many roster snapshots: overlapping,
// sometimes reversed, often open-ended. Intervals are half-open
// [start, end). Resolution per officer:
//   1. discard erroneous intervals (end <= start)
//   2. close open intervals at the next later start, or at the resignation
//      date when that comes first
//   3. give every day to the covering interval with the highest priority
//   4. coalesce adjacent pieces of the same unit
//
// Priority, highest first: reported end over open/inferred end, newer
// snapshot over older or unknown, later start over earlier, the
// lexicographically smaller unit, then the longer interval.

use crate::error::{LinkageError, Result};
use crate::reference::ReferenceTable;
use crate::table::{parse_date, Table};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInterval {
    pub uid: u64,
    pub unit: String,
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,

    /// Date of the roster snapshot the interval was reported in
    pub snapshot: Option<NaiveDate>,
}

impl RawInterval {
    pub fn is_erroneous(&self) -> bool {
        self.end.is_some_and(|end| end <= self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpan {
    pub uid: u64,
    pub unit: String,
    pub start: NaiveDate,

    /// `None` while the assignment is ongoing
    pub end: Option<NaiveDate>,

    /// End was not reported by any source (closed by a later assignment,
    /// a resignation, or a higher-priority overlap)
    pub end_inferred: bool,
}

impl ResolvedSpan {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && self.end.map_or(true, |end| day < end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub officers: usize,

    /// Parsed input intervals (erroneous included)
    pub input: usize,
    pub erroneous: usize,

    /// Rows skipped for a missing or unreadable uid, unit, or start date
    pub malformed: usize,

    /// Ordered by uid, then start
    pub spans: Vec<ResolvedSpan>,
}

impl ResolutionReport {
    /// Timeline as a table: uid, unit, start_date, end_date, end_inferred
    pub fn to_table(&self) -> Result<Table> {
        let mut table = Table::new(
            "unit_history",
            ["uid", "unit", "start_date", "end_date", "end_inferred"],
        );
        for span in &self.spans {
            table.push_row(vec![
                Some(span.uid.to_string()),
                Some(span.unit.clone()),
                Some(span.start.to_string()),
                span.end.map(|d| d.to_string()),
                Some(span.end_inferred.to_string()),
            ])?;
        }
        Ok(table)
    }
}

// ============================================================================
// INPUT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalColumns {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_start")]
    pub start: String,
    #[serde(default = "default_end")]
    pub end: String,
}

fn default_uid() -> String {
    "uid".to_string()
}

fn default_unit() -> String {
    "unit".to_string()
}

fn default_start() -> String {
    "start_date".to_string()
}

fn default_end() -> String {
    "end_date".to_string()
}

impl Default for IntervalColumns {
    fn default() -> Self {
        IntervalColumns {
            uid: default_uid(),
            unit: default_unit(),
            start: default_start(),
            end: default_end(),
        }
    }
}

/// Raw intervals unioned from any number of tables
#[derive(Debug, Clone, Default)]
pub struct IntervalBatch {
    pub intervals: Vec<RawInterval>,
    pub malformed: usize,
}

impl IntervalBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interval: RawInterval) {
        self.intervals.push(interval);
    }

    /// Read one table of assignments reported in the `snapshot` roster
    pub fn extend_from_table(
        &mut self,
        table: &Table,
        columns: &IntervalColumns,
        snapshot: Option<NaiveDate>,
    ) -> Result<()> {
        let uid_col = table.require_column(&columns.uid)?;
        let unit_col = table.require_column(&columns.unit)?;
        let start_col = table.require_column(&columns.start)?;
        let end_col = table.require_column(&columns.end)?;

        for row in 0..table.len() {
            let uid = table.get(row, uid_col).and_then(|v| v.trim().parse::<u64>().ok());
            let unit = table.get(row, unit_col).map(|v| v.trim().to_string());
            let start = table.get(row, start_col).and_then(parse_date);

            match (uid, unit, start) {
                (Some(uid), Some(unit), Some(start)) => self.intervals.push(RawInterval {
                    uid,
                    unit,
                    start,
                    end: table.get(row, end_col).and_then(parse_date),
                    snapshot,
                }),
                _ => self.malformed += 1,
            }
        }
        Ok(())
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

/// An interval with its effective end after open-interval closing
struct Effective<'a> {
    raw: &'a RawInterval,
    end: Option<NaiveDate>,
}

impl Effective<'_> {
    fn covers(&self, day: NaiveDate) -> bool {
        self.raw.start <= day && self.end.map_or(true, |end| day < end)
    }

    fn priority(&self) -> (bool, Option<NaiveDate>, NaiveDate, Reverse<&str>, NaiveDate) {
        (
            self.raw.end.is_some(),
            self.raw.snapshot,
            self.raw.start,
            Reverse(self.raw.unit.as_str()),
            self.end.unwrap_or(NaiveDate::MAX),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntervalResolver {
    resignations: HashMap<u64, NaiveDate>,
}

impl IntervalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resignations(mut self, resignations: HashMap<u64, NaiveDate>) -> Self {
        self.resignations = resignations;
        self
    }

    /// Resignation dates keyed by UID from one reference attribute column
    pub fn resignations_from(reference: &ReferenceTable, column: &str) -> Result<HashMap<u64, NaiveDate>> {
        if !reference.table().has_column(column) {
            return Err(LinkageError::config(format!(
                "reference table has no resignation column '{}'",
                column
            )));
        }
        Ok(reference
            .attribute_by_uid(column)?
            .into_iter()
            .filter_map(|(uid, value)| parse_date(&value).map(|date| (uid, date)))
            .collect())
    }

    pub fn resolve(&self, batch: &IntervalBatch) -> ResolutionReport {
        let mut by_officer: BTreeMap<u64, Vec<&RawInterval>> = BTreeMap::new();
        let mut erroneous = 0usize;
        for interval in &batch.intervals {
            if interval.is_erroneous() {
                erroneous += 1;
                continue;
            }
            by_officer.entry(interval.uid).or_default().push(interval);
        }

        let mut spans = Vec::new();
        for (uid, intervals) in &by_officer {
            spans.extend(self.resolve_officer(*uid, intervals));
        }

        let officers = batch
            .intervals
            .iter()
            .map(|i| i.uid)
            .collect::<BTreeSet<_>>()
            .len();
        debug!(
            officers,
            input = batch.intervals.len(),
            erroneous,
            malformed = batch.malformed,
            spans = spans.len(),
            "resolved unit intervals"
        );

        ResolutionReport {
            officers,
            input: batch.intervals.len(),
            erroneous,
            malformed: batch.malformed,
            spans,
        }
    }

    fn resolve_officer(&self, uid: u64, intervals: &[&RawInterval]) -> Vec<ResolvedSpan> {
        let resignation = self.resignations.get(&uid).copied();
        let effective: Vec<Effective<'_>> = intervals
            .iter()
            .map(|&raw| Effective {
                raw,
                end: raw.end.or_else(|| close_open(raw.start, intervals, resignation)),
            })
            .collect();

        let mut boundaries = BTreeSet::new();
        for e in &effective {
            boundaries.insert(e.raw.start);
            if let Some(end) = e.end {
                boundaries.insert(end);
            }
        }
        let boundaries: Vec<NaiveDate> = boundaries.into_iter().collect();

        let mut spans: Vec<ResolvedSpan> = Vec::new();
        for (i, &piece_start) in boundaries.iter().enumerate() {
            let piece_end = boundaries.get(i + 1).copied();
            let Some(winner) = effective
                .iter()
                .filter(|e| e.covers(piece_start))
                .max_by_key(|e| e.priority())
            else {
                continue;
            };
            // The last boundary only opens a piece if something is still open
            if piece_end.is_none() && winner.end.is_some() {
                continue;
            }
            let end_inferred = piece_end.is_some() && winner.raw.end != piece_end;

            match spans.last_mut() {
                Some(last) if last.unit == winner.raw.unit && last.end == Some(piece_start) => {
                    last.end = piece_end;
                    last.end_inferred = end_inferred;
                }
                _ => spans.push(ResolvedSpan {
                    uid,
                    unit: winner.raw.unit.clone(),
                    start: piece_start,
                    end: piece_end,
                    end_inferred,
                }),
            }
        }
        spans
    }
}

/// Effective end of an open interval starting at `start`
fn close_open(start: NaiveDate, intervals: &[&RawInterval], resignation: Option<NaiveDate>) -> Option<NaiveDate> {
    let next_start = intervals.iter().map(|i| i.start).filter(|s| *s > start).min();
    match (resignation.filter(|r| *r > start), next_start) {
        (Some(resigned), Some(next)) if resigned < next => Some(resigned),
        (Some(resigned), None) => Some(resigned),
        (_, next) => next,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn interval(uid: u64, unit: &str, start: &str, end: Option<&str>) -> RawInterval {
        RawInterval {
            uid,
            unit: unit.to_string(),
            start: date(start),
            end: end.map(date),
            snapshot: None,
        }
    }

    fn span(unit: &str, start: &str, end: Option<&str>, end_inferred: bool) -> ResolvedSpan {
        ResolvedSpan {
            uid: 1,
            unit: unit.to_string(),
            start: date(start),
            end: end.map(date),
            end_inferred,
        }
    }

    fn resolve(intervals: Vec<RawInterval>) -> ResolutionReport {
        let batch = IntervalBatch {
            intervals,
            malformed: 0,
        };
        IntervalResolver::new().resolve(&batch)
    }

    #[test]
    fn test_overlap_prefers_later_start_among_definite_ends() {
        let report = resolve(vec![
            interval(1, "A", "2001-01-01", Some("2001-06-01")),
            interval(1, "A", "2001-06-01", None),
            interval(1, "B", "2001-05-01", Some("2001-12-01")),
        ]);
        assert_eq!(
            report.spans,
            vec![
                span("A", "2001-01-01", Some("2001-05-01"), true),
                span("B", "2001-05-01", Some("2001-12-01"), false),
                span("A", "2001-12-01", None, false),
            ]
        );
        assert_eq!(report.officers, 1);
        // Two closed intervals and one open one: three spans, one per
        // non-erroneous input, so more than the closed inputs alone
        assert_eq!(report.spans.len(), report.input - report.erroneous);
    }

    #[test]
    fn test_erroneous_intervals_are_discarded() {
        let report = resolve(vec![
            interval(1, "A", "2001-01-01", Some("2000-01-01")),
            interval(1, "B", "2001-01-01", Some("2001-01-01")),
            interval(1, "C", "2002-01-01", Some("2003-01-01")),
        ]);
        assert_eq!(report.erroneous, 2);
        assert_eq!(report.input, 3);
        assert_eq!(report.spans, vec![span("C", "2002-01-01", Some("2003-01-01"), false)]);
    }

    #[test]
    fn test_open_interval_closed_by_next_start() {
        let report = resolve(vec![
            interval(1, "A", "2001-01-01", None),
            interval(1, "B", "2003-01-01", Some("2004-01-01")),
        ]);
        assert_eq!(
            report.spans,
            vec![
                span("A", "2001-01-01", Some("2003-01-01"), true),
                span("B", "2003-01-01", Some("2004-01-01"), false),
            ]
        );
    }

    #[test]
    fn test_open_interval_closed_by_resignation() {
        let batch = IntervalBatch {
            intervals: vec![
                interval(1, "A", "2001-01-01", None),
                interval(1, "B", "2005-01-01", None),
            ],
            malformed: 0,
        };
        let resolver = IntervalResolver::new()
            .with_resignations(HashMap::from([(1, date("2003-06-30"))]));
        let report = resolver.resolve(&batch);

        // B starts after the resignation, so it is left open
        assert_eq!(
            report.spans,
            vec![
                span("A", "2001-01-01", Some("2003-06-30"), true),
                span("B", "2005-01-01", None, false),
            ]
        );
    }

    #[test]
    fn test_open_interval_without_successor_stays_open() {
        let report = resolve(vec![interval(1, "A", "2001-01-01", None)]);
        assert_eq!(report.spans, vec![span("A", "2001-01-01", None, false)]);
    }

    #[test]
    fn test_contiguous_same_unit_coalesces() {
        let report = resolve(vec![
            interval(1, "A", "2001-01-01", Some("2002-01-01")),
            interval(1, "A", "2001-06-01", Some("2003-01-01")),
        ]);
        assert_eq!(report.spans, vec![span("A", "2001-01-01", Some("2003-01-01"), false)]);
    }

    #[test]
    fn test_newer_snapshot_wins() {
        let mut older = interval(1, "A", "2001-01-01", Some("2002-01-01"));
        older.snapshot = Some(date("2010-01-01"));
        let mut newer = interval(1, "B", "2001-01-01", Some("2002-01-01"));
        newer.snapshot = Some(date("2016-01-01"));

        let report = resolve(vec![older, newer]);
        assert_eq!(report.spans, vec![span("B", "2001-01-01", Some("2002-01-01"), false)]);
    }

    #[test]
    fn test_identical_ranges_fall_back_to_unit_order() {
        let report = resolve(vec![
            interval(1, "Z", "2001-01-01", Some("2002-01-01")),
            interval(1, "M", "2001-01-01", Some("2002-01-01")),
        ]);
        assert_eq!(report.spans, vec![span("M", "2001-01-01", Some("2002-01-01"), false)]);
    }

    #[test]
    fn test_nested_interval_splits_host() {
        let report = resolve(vec![
            interval(1, "A", "2001-01-01", Some("2005-01-01")),
            interval(1, "B", "2002-01-01", Some("2003-01-01")),
        ]);
        assert_eq!(
            report.spans,
            vec![
                span("A", "2001-01-01", Some("2002-01-01"), true),
                span("B", "2002-01-01", Some("2003-01-01"), false),
                span("A", "2003-01-01", Some("2005-01-01"), false),
            ]
        );
        // A strictly nested interval of another unit is the one case with
        // more spans than inputs
        assert_eq!(report.spans.len(), report.input + 1);
    }

    #[test]
    fn test_batch_from_tables() {
        let table = Table::from_literals(
            "units_2016",
            &["uid", "unit", "start_date", "end_date"],
            &[
                &["1", "007", "2001-01-01", ""],
                &["", "008", "2001-01-01", ""],
                &["2", "009", "not a date", ""],
                &["2", "010", "2004-04-04", "2005-05-05"],
            ],
        )
        .unwrap();
        let mut batch = IntervalBatch::new();
        batch
            .extend_from_table(&table, &IntervalColumns::default(), Some(date("2016-01-01")))
            .unwrap();
        assert_eq!(batch.intervals.len(), 2);
        assert_eq!(batch.malformed, 2);
        assert_eq!(batch.intervals[0].snapshot, Some(date("2016-01-01")));

        let report = IntervalResolver::new().resolve(&batch);
        assert_eq!(report.officers, 2);
        let out = report.to_table().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.value(0, "end_date"), None);
        assert_eq!(out.value(1, "end_inferred"), Some("false"));
    }

    #[test]
    fn test_resignations_from_reference() {
        let table = Table::from_literals(
            "reference",
            &["uid", "resignation_date"],
            &[&["1", "2003-06-30"], &["2", ""], &["3", "unknown"]],
        )
        .unwrap();
        let reference = ReferenceTable::from_parts(table, Vec::new()).unwrap();
        let dates = IntervalResolver::resignations_from(&reference, "resignation_date").unwrap();
        assert_eq!(dates, HashMap::from([(1, date("2003-06-30"))]));
        assert!(IntervalResolver::resignations_from(&reference, "missing").is_err());
    }
}
