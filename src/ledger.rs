// 📒 Audit Ledger - SQLite record of every merge run
//
// events:  run lifecycle (merge_started, merge_recorded, ambiguous_match,
//          merge_committed)
// matches: how every local id of every source got its UID
//
// A merge is recorded before its reference snapshot is saved, so a committed
// source always has its matches and ambiguities here. Records of a run whose
// save never happened stay behind; the store manifest names the run that
// actually committed each source.

use crate::error::Result;
use crate::merge::{AmbiguousMatch, MergeReport};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const EVENT_MERGE_STARTED: &str = "merge_started";
pub const EVENT_MERGE_RECORDED: &str = "merge_recorded";
pub const EVENT_MERGE_COMMITTED: &str = "merge_committed";
pub const EVENT_AMBIGUOUS_MATCH: &str = "ambiguous_match";

const ACTOR: &str = "officer-linkage";

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,

    /// "source" or "run"
    pub entity_type: String,
    pub entity_id: String,
    pub run_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        run_id: &str,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            run_id: run_id.to_string(),
            data,
            actor: ACTOR.to_string(),
        }
    }
}

/// One unresolved ambiguity as read back for review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub ambiguity: AmbiguousMatch,
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Ledger { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Ledger { conn })
    }

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;
        self.conn.execute(
            "INSERT INTO events (
                event_id, timestamp, event_type, entity_type, entity_id, run_id, data, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.entity_type,
                event.entity_id,
                event.run_id,
                data_json,
                event.actor,
            ],
        )?;
        Ok(())
    }

    pub fn merge_started(&self, run_id: &str, source: &str) -> Result<()> {
        self.insert_event(&Event::new(
            EVENT_MERGE_STARTED,
            "source",
            source,
            run_id,
            serde_json::Value::Null,
        ))
    }

    /// Record a merge about to be committed: summary event, ambiguities, and every match
    pub fn record_merge(&mut self, run_id: &str, report: &MergeReport) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut insert_match = tx.prepare(
                "INSERT INTO matches (run_id, source, local_id, uid, matched_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for m in &report.matches {
                insert_match.execute(params![run_id, report.source, m.local_id, m.uid as i64, m.matched_on])?;
            }
        }

        let summary = serde_json::json!({
            "provenance_column": report.provenance_column,
            "profiles": report.profiles,
            "matched_on": report.matched_on,
            "minted": report.minted,
            "first_new_uid": report.first_new_uid,
            "excluded_by_cutoff": report.excluded_by_cutoff,
            "ambiguous": report.ambiguous.len(),
        });
        let mut events = vec![Event::new(EVENT_MERGE_RECORDED, "source", &report.source, run_id, summary)];
        for ambiguity in &report.ambiguous {
            events.push(Event::new(
                EVENT_AMBIGUOUS_MATCH,
                "source",
                &report.source,
                run_id,
                serde_json::to_value(ambiguity)?,
            ));
        }
        for event in &events {
            tx.execute(
                "INSERT INTO events (
                    event_id, timestamp, event_type, entity_type, entity_id, run_id, data, actor
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id,
                    event.timestamp.to_rfc3339(),
                    event.event_type,
                    event.entity_type,
                    event.entity_id,
                    event.run_id,
                    serde_json::to_string(&event.data)?,
                    event.actor,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn merge_committed(&self, run_id: &str, source: &str, version: u64) -> Result<()> {
        self.insert_event(&Event::new(
            EVENT_MERGE_COMMITTED,
            "source",
            source,
            run_id,
            serde_json::json!({ "version": version }),
        ))
    }

    /// Events for a specific entity, newest first
    pub fn get_events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, run_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY timestamp DESC, rowid DESC",
        )?;

        let events = stmt
            .query_map(params![entity_type, entity_id], |row| {
                let timestamp: String = row.get(1)?;
                let data_json: String = row.get(6)?;
                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(&timestamp)?,
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    run_id: row.get(5)?,
                    data: serde_json::from_str(&data_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
                    actor: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Ambiguities recorded for one source, oldest first
    pub fn ambiguous_matches_for(&self, source: &str) -> Result<Vec<AmbiguityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, timestamp, entity_id, data
             FROM events
             WHERE event_type = ?1 AND entity_type = 'source' AND entity_id = ?2
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let records = stmt
            .query_map(params![EVENT_AMBIGUOUS_MATCH, source], read_ambiguity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every recorded ambiguity, grouped by source
    pub fn all_ambiguous_matches(&self) -> Result<Vec<AmbiguityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, timestamp, entity_id, data
             FROM events
             WHERE event_type = ?1
             ORDER BY entity_id ASC, timestamp ASC, rowid ASC",
        )?;
        let records = stmt
            .query_map(params![EVENT_AMBIGUOUS_MATCH], read_ambiguity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// (source, matched_on, count) for one run
    pub fn matched_on_counts(&self, run_id: &str) -> Result<Vec<(String, String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, matched_on, COUNT(*)
             FROM matches
             WHERE run_id = ?1
             GROUP BY source, matched_on
             ORDER BY source, matched_on",
        )?;
        let counts = stmt
            .query_map(params![run_id], |row| {
                let count: i64 = row.get(2)?;
                Ok((row.get(0)?, row.get(1)?, count as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn read_ambiguity(row: &rusqlite::Row<'_>) -> rusqlite::Result<AmbiguityRecord> {
    let timestamp: String = row.get(1)?;
    let data_json: String = row.get(3)?;
    Ok(AmbiguityRecord {
        run_id: row.get(0)?,
        timestamp: parse_timestamp(&timestamp)?,
        source: row.get(2)?,
        ambiguity: serde_json::from_str(&data_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            data TEXT,
            actor TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            source TEXT NOT NULL,
            local_id TEXT NOT NULL,
            uid INTEGER NOT NULL,
            matched_on TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_matches_source ON matches(source, local_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
