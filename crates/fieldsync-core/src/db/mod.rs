// ============================================================================
// LocalStore - Embedded Database (redb)
// ============================================================================
// Persistent local storage for the visit cache, the completed-visit ledger,
// the pending sync queues (reports, photos, NAP boxes, requests) and cached
// assets (PDFs, map tiles).
// Default path: ~/.fieldsync/fieldsync.redb (override via FIELDSYNC_DB_PATH env var)
// ============================================================================

mod assets;
mod queue;
pub mod slot;
pub mod types;
mod visits;

pub use slot::StoreSlot;
pub use types::{
    CachedPdf, CompletedVisit, CompletionOutcome, MapTile, NewNap, NewReport, PendingNap,
    PendingPhoto, PendingReport, PendingRequest, PhotoUpload, ReportRef, RequestMethod,
    StoreStats,
};

use anyhow::{anyhow, Result};
use redb::{
    Database, MultimapTableDefinition, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::Session;

// Table definitions
const VISITS: TableDefinition<i64, &[u8]> = TableDefinition::new("visits");
const COMPLETED: TableDefinition<i64, &[u8]> = TableDefinition::new("completed_visits");
const REPORTS: TableDefinition<u64, &[u8]> = TableDefinition::new("pending_reports");
const PHOTOS: TableDefinition<u64, &[u8]> = TableDefinition::new("pending_photos");
const NAPS: TableDefinition<u64, &[u8]> = TableDefinition::new("pending_naps");
const REQUESTS: TableDefinition<i64, &[u8]> = TableDefinition::new("pending_requests");
const PDFS: TableDefinition<&str, &[u8]> = TableDefinition::new("pdfs");
const PDFS_BY_VISIT: MultimapTableDefinition<i64, &str> =
    MultimapTableDefinition::new("pdfs_by_visit");
const TILES: TableDefinition<&str, &[u8]> = TableDefinition::new("tiles");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

// Meta keys
const META_SESSION: &str = "session";
const META_SERVER_FINGERPRINT: &str = "fingerprint:server";
const META_CONTENT_FINGERPRINT: &str = "fingerprint:content";

/// Embedded database backing the offline cache and sync queues
pub struct LocalStore {
    db: Database,
    path: PathBuf,
}

impl LocalStore {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses FIELDSYNC_DB_PATH env var or ~/.fieldsync/fieldsync.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("FIELDSYNC_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            default_db_path()?
        };

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
            }
        }

        info!("Opening local store at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            for (name, def) in [("visits", VISITS), ("completed", COMPLETED), ("requests", REQUESTS)] {
                write_txn
                    .open_table(def)
                    .map_err(|e| anyhow!("Failed to create {} table: {}", name, e))?;
            }
            for (name, def) in [("reports", REPORTS), ("photos", PHOTOS), ("naps", NAPS)] {
                write_txn
                    .open_table(def)
                    .map_err(|e| anyhow!("Failed to create {} table: {}", name, e))?;
            }
            for (name, def) in [("pdfs", PDFS), ("tiles", TILES), ("meta", META)] {
                write_txn
                    .open_table(def)
                    .map_err(|e| anyhow!("Failed to create {} table: {}", name, e))?;
            }
            write_txn
                .open_multimap_table(PDFS_BY_VISIT)
                .map_err(|e| anyhow!("Failed to create pdf index: {}", e))?;
            write_txn
                .open_table(SEQUENCES)
                .map_err(|e| anyhow!("Failed to create sequences table: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Local store ready");

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Meta Operations
    // ========================================================================

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(META)
            .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;

        let value = table
            .get(key)
            .map_err(|e| anyhow!("Failed to get meta {}: {}", key, e))?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    fn set_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(META)
                .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
            table
                .insert(key, value)
                .map_err(|e| anyhow!("Failed to insert meta {}: {}", key, e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(META)
                .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
            removed = table
                .remove(key)
                .map_err(|e| anyhow!("Failed to remove meta {}: {}", key, e))?
                .is_some();
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(removed)
    }

    fn get_meta_string(&self, key: &str) -> Result<Option<String>> {
        match self.get_meta(key)? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|e| anyhow!("Corrupt meta {}: {}", key, e))?,
            )),
            None => Ok(None),
        }
    }

    /// Fingerprint last reported by `mis-visitas/check-updates`
    pub fn server_fingerprint(&self) -> Result<Option<String>> {
        self.get_meta_string(META_SERVER_FINGERPRINT)
    }

    pub fn set_server_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.set_meta(META_SERVER_FINGERPRINT, fingerprint.as_bytes())?;
        debug!("Stored server fingerprint {}", short(fingerprint));
        Ok(())
    }

    /// Content hash of the last visit list handed to the UI
    pub fn content_fingerprint(&self) -> Result<Option<String>> {
        self.get_meta_string(META_CONTENT_FINGERPRINT)
    }

    pub fn set_content_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.set_meta(META_CONTENT_FINGERPRINT, fingerprint.as_bytes())
    }

    /// Forget both fingerprints so the next refresh does a full download
    pub fn clear_fingerprints(&self) -> Result<()> {
        self.remove_meta(META_SERVER_FINGERPRINT)?;
        self.remove_meta(META_CONTENT_FINGERPRINT)?;
        Ok(())
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    pub fn session(&self) -> Result<Option<Session>> {
        match self.get_meta(META_SESSION)? {
            Some(bytes) => Ok(Some(decode_json(&bytes, "session")?)),
            None => Ok(None),
        }
    }

    /// Bearer token of the current session, if logged in
    pub fn token(&self) -> Result<Option<String>> {
        Ok(self
            .session()?
            .map(|s| s.token)
            .filter(|t| !t.trim().is_empty()))
    }

    pub fn set_session(&self, session: &Session) -> Result<()> {
        let value = encode_json(session, "session")?;
        self.set_meta(META_SESSION, &value)?;
        info!(
            "Session stored for technician {}",
            session.technician_id.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    /// Drop the session and the fingerprints tied to it.
    /// Cached visits and pending queues are kept for the next login.
    pub fn clear_session(&self) -> Result<bool> {
        let removed = self.remove_meta(META_SESSION)?;
        self.clear_fingerprints()?;
        if removed {
            info!("Session cleared");
        }
        Ok(removed)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let visits = self.list_visits(None)?;
        let mut visit_counts = std::collections::HashMap::new();
        for visit in &visits {
            *visit_counts.entry(visit.status.to_string()).or_insert(0usize) += 1;
        }

        let reports = self.list_reports()?;
        let pending_reports = reports.iter().filter(|r| !r.synced).count();

        Ok(StoreStats {
            visits: visits.len(),
            visit_counts,
            completed: self.list_completed()?.len(),
            pending_reports,
            synced_reports: reports.len() - pending_reports,
            pending_photos: self.pending_photos()?.len(),
            pending_naps: self.pending_naps()?.len(),
            pending_requests: self.list_requests()?.len(),
            pdfs: self.pdf_count()?,
            tiles: self.tile_count()?,
        })
    }
}

fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".fieldsync").join("fieldsync.redb"))
}

/// Allocate the next id of an auto-increment sequence inside `txn`
fn next_sequence(txn: &WriteTransaction, name: &str) -> Result<u64> {
    let mut table = txn
        .open_table(SEQUENCES)
        .map_err(|e| anyhow!("Failed to open sequences table: {}", e))?;
    let current = table
        .get(name)
        .map_err(|e| anyhow!("Failed to read sequence {}: {}", name, e))?
        .map(|v| v.value())
        .unwrap_or(0);
    let next = current + 1;
    table
        .insert(name, next)
        .map_err(|e| anyhow!("Failed to advance sequence {}: {}", name, e))?;
    Ok(next)
}

fn encode_json<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

fn encode_bin<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode_bin<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

/// First 8 chars of a fingerprint, for log lines
pub(crate) fn short(fingerprint: &str) -> &str {
    let end = fingerprint
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(fingerprint.len());
    &fingerprint[..end]
}

#[cfg(test)]
pub(crate) fn temp_store() -> (tempfile::TempDir, LocalStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldsync.redb");
    let store = LocalStore::open(Some(path.to_str().unwrap())).unwrap();
    (dir, store)
}
