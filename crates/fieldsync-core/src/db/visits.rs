// ============================================================================
// Visit cache and completed-visit ledger
// ============================================================================

use anyhow::{anyhow, Result};
use redb::{ReadableTable, WriteTransaction};
use std::collections::HashSet;
use tracing::{debug, info};

use super::assets::remove_pdfs_in;
use super::{decode_bin, decode_json, encode_bin, encode_json, LocalStore, COMPLETED, VISITS};
use super::types::{CompletedVisit, CompletionOutcome};
use crate::types::{now_millis, VisitId, VisitRecord};

impl LocalStore {
    // ========================================================================
    // Visit Operations
    // ========================================================================

    pub fn put_visit(&self, visit: &VisitRecord) -> Result<()> {
        let value = encode_json(visit, "visit")?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(VISITS)
                .map_err(|e| anyhow!("Failed to open visits table: {}", e))?;
            table
                .insert(visit.id, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert visit: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored visit: {}", visit.id);
        Ok(())
    }

    pub fn get_visit(&self, visit_id: VisitId) -> Result<Option<VisitRecord>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(VISITS)
            .map_err(|e| anyhow!("Failed to open visits table: {}", e))?;

        match table
            .get(visit_id)
            .map_err(|e| anyhow!("Failed to get visit: {}", e))?
        {
            Some(value) => Ok(Some(decode_json(value.value(), "visit")?)),
            None => Ok(None),
        }
    }

    /// List cached visits, optionally only those of one technician
    pub fn list_visits(&self, technician_id: Option<&str>) -> Result<Vec<VisitRecord>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(VISITS)
            .map_err(|e| anyhow!("Failed to open visits table: {}", e))?;

        let mut results = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate visits: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let visit: VisitRecord = decode_json(value.value(), "visit")?;

            match technician_id {
                Some(filter) if visit.technician_id.as_deref() != Some(filter) => {}
                _ => results.push(visit),
            }
        }
        Ok(results)
    }

    pub fn delete_visit(&self, visit_id: VisitId) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed = remove_visit_in(&write_txn, visit_id)?;
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted visit: {}", visit_id);
        }
        Ok(removed)
    }

    /// Replace the whole visit cache with `fresh` in one transaction.
    /// Rows whose id is in `retain` survive even when absent from `fresh`.
    pub fn replace_visits(&self, fresh: &[VisitRecord], retain: &HashSet<VisitId>) -> Result<()> {
        let encoded = fresh
            .iter()
            .map(|v| Ok((v.id, encode_json(v, "visit")?)))
            .collect::<Result<Vec<_>>>()?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let dropped;
        {
            let mut table = write_txn
                .open_table(VISITS)
                .map_err(|e| anyhow!("Failed to open visits table: {}", e))?;

            let fresh_ids: HashSet<VisitId> = fresh.iter().map(|v| v.id).collect();
            let mut stale = Vec::new();
            for entry in table
                .iter()
                .map_err(|e| anyhow!("Failed to iterate visits: {}", e))?
            {
                let (key, _value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
                let id = key.value();
                if !fresh_ids.contains(&id) && !retain.contains(&id) {
                    stale.push(id);
                }
            }

            for id in &stale {
                table
                    .remove(*id)
                    .map_err(|e| anyhow!("Failed to remove visit {}: {}", id, e))?;
            }
            for (id, value) in &encoded {
                table
                    .insert(*id, value.as_slice())
                    .map_err(|e| anyhow!("Failed to insert visit {}: {}", id, e))?;
            }
            dropped = stale.len();
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit visit replace: {}", e))?;

        debug!(
            "Replaced visit cache: {} stored, {} dropped, {} retained",
            fresh.len(),
            dropped,
            retain.len()
        );
        Ok(())
    }

    // ========================================================================
    // Completed Ledger Operations
    // ========================================================================

    /// Write a ledger entry. Re-recording an id keeps the first entry.
    pub fn record_completed(&self, entry: &CompletedVisit) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        record_completed_in(&write_txn, entry)?;
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    pub fn list_completed(&self) -> Result<Vec<CompletedVisit>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(COMPLETED)
            .map_err(|e| anyhow!("Failed to open ledger table: {}", e))?;

        let mut results = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate ledger: {}", e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode_bin::<CompletedVisit>(value.value(), "ledger entry")?);
        }
        Ok(results)
    }

    /// Ids of every visit completed on this device
    pub fn completed_ids(&self) -> Result<HashSet<VisitId>> {
        Ok(self
            .list_completed()?
            .into_iter()
            .map(|c| c.visit_id)
            .collect())
    }

    pub fn is_completed(&self, visit_id: VisitId) -> Result<bool> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(COMPLETED)
            .map_err(|e| anyhow!("Failed to open ledger table: {}", e))?;
        Ok(table
            .get(visit_id)
            .map_err(|e| anyhow!("Failed to get ledger entry: {}", e))?
            .is_some())
    }

    /// Mark a visit as permanently completed and reclaim its cache space.
    /// Ledger write, visit removal and PDF removal commit together; the
    /// ledger entry is written first.
    pub fn complete_visit(
        &self,
        visit_id: VisitId,
        technician_id: Option<&str>,
    ) -> Result<CompletionOutcome> {
        let entry = CompletedVisit {
            visit_id,
            completed_at: now_millis(),
            technician_id: technician_id.map(str::to_string),
        };

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        record_completed_in(&write_txn, &entry)?;
        let visit_removed = remove_visit_in(&write_txn, visit_id)?;
        let pdfs_removed = remove_pdfs_in(&write_txn, visit_id)?;
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit completion: {}", e))?;

        info!(
            "Visit {} completed (cache entry removed: {}, PDFs removed: {})",
            visit_id, visit_removed, pdfs_removed
        );
        Ok(CompletionOutcome {
            visit_removed,
            pdfs_removed,
            ..CompletionOutcome::default()
        })
    }
}

pub(super) fn record_completed_in(txn: &WriteTransaction, entry: &CompletedVisit) -> Result<()> {
    let mut table = txn
        .open_table(COMPLETED)
        .map_err(|e| anyhow!("Failed to open ledger table: {}", e))?;
    let exists = table
        .get(entry.visit_id)
        .map_err(|e| anyhow!("Failed to read ledger entry: {}", e))?
        .is_some();
    if exists {
        debug!("Visit {} already in ledger", entry.visit_id);
        return Ok(());
    }
    let value = encode_bin(entry, "ledger entry")?;
    table
        .insert(entry.visit_id, value.as_slice())
        .map_err(|e| anyhow!("Failed to insert ledger entry: {}", e))?;
    debug!("Ledger entry written for visit {}", entry.visit_id);
    Ok(())
}

pub(super) fn remove_visit_in(txn: &WriteTransaction, visit_id: VisitId) -> Result<bool> {
    let mut table = txn
        .open_table(VISITS)
        .map_err(|e| anyhow!("Failed to open visits table: {}", e))?;
    let removed = table
        .remove(visit_id)
        .map_err(|e| anyhow!("Failed to remove visit: {}", e))?
        .is_some();
    Ok(removed)
}
