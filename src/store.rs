// 💾 Reference Store - Durable, versioned home of the reference table
//
// Layout of the store directory:
//   manifest.json               -> which snapshot is current, and its digest
//   reference.v000001.csv.zst   -> immutable snapshots, one per commit
//
// Saving is write-verify-swap. The snapshot is written to a temp file,
// synced, read back and verified, then renamed into place. The manifest is
// replaced last; its rename is the commit point.

use crate::error::{LinkageError, Result};
use crate::reference::ReferenceTable;
use crate::table::{FileFormat, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Monotonic commit counter
    pub version: u64,

    /// Snapshot file name, relative to the store directory
    pub snapshot: String,

    /// SHA-256 of the snapshot file bytes
    pub sha256: String,

    pub rows: usize,
    pub next_uid: u64,

    /// Provenance columns in merge order
    pub provenance: Vec<String>,

    /// Run that committed each provenance column
    #[serde(default)]
    pub committed_by: BTreeMap<String, String>,

    pub updated_at: DateTime<Utc>,
    pub run_id: String,
}

pub struct ReferenceStore {
    dir: PathBuf,
}

impl ReferenceStore {
    /// Open (and create if needed) a store directory
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(ReferenceStore {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn snapshot_name(version: u64) -> String {
        format!("reference.v{:06}.csv.zst", version)
    }

    /// Current manifest; `None` before the first commit
    pub fn manifest(&self) -> Result<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Load and verify the committed reference table
    pub fn load(&self) -> Result<ReferenceTable> {
        match self.manifest()? {
            Some(manifest) => self.load_snapshot(&manifest),
            None => Ok(ReferenceTable::empty()),
        }
    }

    fn load_snapshot(&self, manifest: &Manifest) -> Result<ReferenceTable> {
        let bytes = fs::read(self.dir.join(&manifest.snapshot))?;
        let digest = sha256_hex(&bytes);
        if digest != manifest.sha256 {
            return Err(LinkageError::invariant(format!(
                "snapshot {} is corrupted: digest {} does not match manifest {}",
                manifest.snapshot, digest, manifest.sha256
            )));
        }

        let table = Table::from_bytes("reference", &bytes, FileFormat::CSV_ZSTD)?;
        let reference = ReferenceTable::from_parts(table, manifest.provenance.clone())?;

        if reference.len() != manifest.rows || reference.next_uid() != manifest.next_uid {
            return Err(LinkageError::invariant(format!(
                "snapshot {} holds {} rows (next UID {}), manifest says {} rows (next UID {})",
                manifest.snapshot,
                reference.len(),
                reference.next_uid(),
                manifest.rows,
                manifest.next_uid
            )));
        }
        debug!(snapshot = %manifest.snapshot, rows = reference.len(), "loaded reference");
        Ok(reference)
    }

    /// Commit `reference` as the new current snapshot
    ///
    /// Refuses a table that does not extend the committed one.
    pub fn save(&self, reference: &ReferenceTable, run_id: &str) -> Result<Manifest> {
        let previous = self.manifest()?;
        let committed = match &previous {
            Some(manifest) => self.load_snapshot(manifest)?,
            None => ReferenceTable::empty(),
        };
        reference.check_extends(&committed)?;

        let version = previous.as_ref().map_or(1, |m| m.version + 1);
        let snapshot = Self::snapshot_name(version);
        let bytes = reference.table().to_bytes(FileFormat::CSV_ZSTD)?;
        let sha256 = sha256_hex(&bytes);

        // Write and verify the snapshot before anything points at it
        let temp = self.dir.join(format!("{}.tmp", snapshot));
        write_synced(&temp, &bytes)?;
        let written = fs::read(&temp)?;
        if sha256_hex(&written) != sha256 {
            return Err(LinkageError::invariant(format!(
                "snapshot {} changed on disk while being written",
                snapshot
            )));
        }
        let reread = Table::from_bytes("reference", &written, FileFormat::CSV_ZSTD)?;
        let reread = ReferenceTable::from_parts(reread, reference.provenance().to_vec())?;
        if reread.uids() != reference.uids() {
            return Err(LinkageError::invariant(format!(
                "snapshot {} does not read back with the same UIDs",
                snapshot
            )));
        }
        fs::rename(&temp, self.dir.join(&snapshot))?;

        let mut committed_by = previous
            .as_ref()
            .map(|m| m.committed_by.clone())
            .unwrap_or_default();
        for column in reference.provenance().iter().filter(|c| !committed.has_source(c)) {
            committed_by.insert(column.clone(), run_id.to_string());
        }

        let manifest = Manifest {
            version,
            snapshot,
            sha256,
            rows: reference.len(),
            next_uid: reference.next_uid(),
            provenance: reference.provenance().to_vec(),
            committed_by,
            updated_at: Utc::now(),
            run_id: run_id.to_string(),
        };
        let manifest_temp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        write_synced(&manifest_temp, serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        fs::rename(&manifest_temp, self.manifest_path())?;
        sync_dir(&self.dir);

        info!(
            version = manifest.version,
            rows = manifest.rows,
            next_uid = manifest.next_uid,
            "committed reference snapshot"
        );
        Ok(manifest)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Persist the renames; not every platform can open a directory
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

// ============================================================================
// TESTS
// ============================================================================
