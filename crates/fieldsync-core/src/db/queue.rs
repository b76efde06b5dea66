// ============================================================================
// Pending sync queues: reports, photos, NAP boxes, replayable requests
// ============================================================================

use anyhow::{anyhow, Result};
use redb::{ReadableTable, WriteTransaction};
use tracing::{debug, info, warn};

use super::assets::remove_pdfs_in;
use super::types::{
    CompletedVisit, CompletionOutcome, NewNap, NewReport, PendingNap, PendingPhoto,
    PendingReport, PendingRequest, PhotoUpload, ReportRef,
};
use super::visits::{record_completed_in, remove_visit_in};
use super::{
    decode_bin, decode_json, encode_bin, encode_json, next_sequence, LocalStore, NAPS, PHOTOS,
    REPORTS, REQUESTS,
};
use crate::types::now_millis;

impl LocalStore {
    // ========================================================================
    // Report Operations
    // ========================================================================

    /// Queue a report; returns its local id
    pub fn add_report(&self, report: NewReport) -> Result<u64> {
        self.add_report_with_photos(report, Vec::new())
    }

    /// Queue a report and its photos in one transaction; returns the report's local id
    pub fn add_report_with_photos(
        &self,
        report: NewReport,
        photos: Vec<PhotoUpload>,
    ) -> Result<u64> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let record = insert_report_in(&write_txn, report)?;
        let photo_count = photos.len();
        for photo in photos {
            insert_photo_in(&write_txn, record.local_id, photo)?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!(
            "Queued report {} for visit {} with {} photos",
            record.local_id, record.visit_id, photo_count
        );
        Ok(record.local_id)
    }

    pub fn get_report(&self, local_id: u64) -> Result<Option<PendingReport>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(REPORTS)
            .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;

        match table
            .get(local_id)
            .map_err(|e| anyhow!("Failed to get report: {}", e))?
        {
            Some(value) => Ok(Some(decode_json(value.value(), "report")?)),
            None => Ok(None),
        }
    }

    pub fn list_reports(&self) -> Result<Vec<PendingReport>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(REPORTS)
            .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;

        let mut results = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate reports: {}", e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode_json::<PendingReport>(value.value(), "report")?);
        }
        Ok(results)
    }

    /// Reports not yet accepted by the server, oldest first
    pub fn pending_reports(&self) -> Result<Vec<PendingReport>> {
        Ok(self
            .list_reports()?
            .into_iter()
            .filter(|r| !r.synced)
            .collect())
    }

    /// Persist a corrected technician id on a pending report
    pub fn update_report(&self, report: &PendingReport) -> Result<()> {
        let value = encode_json(report, "report")?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(REPORTS)
                .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;
            table
                .insert(report.local_id, value.as_slice())
                .map_err(|e| anyhow!("Failed to update report: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    /// Record server acceptance of a report in one transaction:
    /// ledger entry, photo remap to the server id, report marked synced,
    /// visit evicted from the cache, its PDFs deleted.
    /// Returns `None` if the report is unknown or was already settled.
    pub fn settle_report(
        &self,
        local_id: u64,
        server_id: i64,
    ) -> Result<Option<CompletionOutcome>> {
        self.settle(local_id, Some(server_id))
    }

    /// Settle a report the server accepted without returning its id.
    /// Same as [`settle_report`](Self::settle_report) except its queued photos
    /// have nothing to attach to and are dropped.
    pub fn settle_report_unassigned(&self, local_id: u64) -> Result<Option<CompletionOutcome>> {
        self.settle(local_id, None)
    }

    fn settle(&self, local_id: u64, server_id: Option<i64>) -> Result<Option<CompletionOutcome>> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;

        let mut report: PendingReport = {
            let table = write_txn
                .open_table(REPORTS)
                .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;
            let found = table
                .get(local_id)
                .map_err(|e| anyhow!("Failed to get report: {}", e))?
                .map(|v| v.value().to_vec());
            match found {
                Some(bytes) => decode_json(&bytes, "report")?,
                None => return Ok(None),
            }
        };
        if report.synced {
            debug!("Report {} already settled", local_id);
            return Ok(None);
        }

        record_completed_in(
            &write_txn,
            &CompletedVisit {
                visit_id: report.visit_id,
                completed_at: now_millis(),
                technician_id: report.technician_id.clone(),
            },
        )?;

        let (photos_remapped, photos_dropped) = match server_id {
            Some(id) => (remap_photos_in(&write_txn, local_id, id)?, 0),
            None => (0, drop_photos_in(&write_txn, local_id)?),
        };

        report.synced = true;
        report.server_id = server_id;
        {
            let value = encode_json(&report, "report")?;
            let mut table = write_txn
                .open_table(REPORTS)
                .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;
            table
                .insert(local_id, value.as_slice())
                .map_err(|e| anyhow!("Failed to update report: {}", e))?;
        }

        let visit_removed = remove_visit_in(&write_txn, report.visit_id)?;
        let pdfs_removed = remove_pdfs_in(&write_txn, report.visit_id)?;

        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit report settlement: {}", e))?;

        match server_id {
            Some(id) => info!(
                "Report {} settled as server report {} (visit {}, {} photos remapped)",
                local_id, id, report.visit_id, photos_remapped
            ),
            None => warn!(
                "Report {} settled without a server id (visit {}, {} photos dropped)",
                local_id, report.visit_id, photos_dropped
            ),
        }
        Ok(Some(CompletionOutcome {
            visit_removed,
            pdfs_removed,
            photos_remapped,
            photos_dropped,
        }))
    }

    /// Point photos still filed under a local report at its server id
    pub fn remap_photos(&self, local_id: u64, server_id: i64) -> Result<usize> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let remapped = remap_photos_in(&write_txn, local_id, server_id)?;
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit photo remap: {}", e))?;

        if remapped > 0 {
            debug!(
                "Remapped {} photos from report {} to server report {}",
                remapped, local_id, server_id
            );
        }
        Ok(remapped)
    }

    /// Delete synced reports created before `cutoff` (ms). Pending ones are never pruned.
    pub fn prune_synced_reports(&self, cutoff: i64) -> Result<usize> {
        let stale: Vec<u64> = self
            .list_reports()?
            .into_iter()
            .filter(|r| r.synced && r.created_at < cutoff)
            .map(|r| r.local_id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(REPORTS)
                .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;
            for id in &stale {
                table
                    .remove(*id)
                    .map_err(|e| anyhow!("Failed to remove report {}: {}", id, e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit prune: {}", e))?;

        info!("Pruned {} synced reports", stale.len());
        Ok(stale.len())
    }

    // ========================================================================
    // Photo Operations
    // ========================================================================

    /// Queue a photo for a report that is still local
    pub fn add_photo(&self, report_local_id: u64, photo: PhotoUpload) -> Result<u64> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let record = insert_photo_in(&write_txn, report_local_id, photo)?;
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!(
            "Queued photo {} ({} bytes) for report {}",
            record.local_id,
            record.data.len(),
            report_local_id
        );
        Ok(record.local_id)
    }

    pub fn list_photos(&self) -> Result<Vec<PendingPhoto>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(PHOTOS)
            .map_err(|e| anyhow!("Failed to open photos table: {}", e))?;

        let mut results = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate photos: {}", e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode_bin::<PendingPhoto>(value.value(), "photo")?);
        }
        Ok(results)
    }

    pub fn pending_photos(&self) -> Result<Vec<PendingPhoto>> {
        Ok(self
            .list_photos()?
            .into_iter()
            .filter(|p| !p.synced)
            .collect())
    }

    pub fn photos_for_report(&self, report: ReportRef) -> Result<Vec<PendingPhoto>> {
        Ok(self
            .list_photos()?
            .into_iter()
            .filter(|p| p.report == report)
            .collect())
    }

    /// Delete uploaded photos in one transaction; returns how many existed
    pub fn delete_photos(&self, ids: &[u64]) -> Result<usize> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let mut removed = 0;
        {
            let mut table = write_txn
                .open_table(PHOTOS)
                .map_err(|e| anyhow!("Failed to open photos table: {}", e))?;
            for id in ids {
                if table
                    .remove(*id)
                    .map_err(|e| anyhow!("Failed to remove photo {}: {}", id, e))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        debug!("Deleted {} uploaded photos", removed);
        Ok(removed)
    }

    // ========================================================================
    // NAP Box Operations
    // ========================================================================

    pub fn add_nap(&self, nap: NewNap) -> Result<u64> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let local_id = next_sequence(&write_txn, "naps")?;
        let record = PendingNap {
            local_id,
            zone: nap.zone,
            ports: nap.ports,
            location: nap.location,
            details: nap.details,
            latitude: nap.latitude,
            longitude: nap.longitude,
            precision: nap.precision,
            synced: false,
            created_at: now_millis(),
        };
        let value = encode_json(&record, "nap")?;
        {
            let mut table = write_txn
                .open_table(NAPS)
                .map_err(|e| anyhow!("Failed to open naps table: {}", e))?;
            table
                .insert(local_id, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert nap: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Queued NAP box {} in zone {}", local_id, record.zone);
        Ok(local_id)
    }

    pub fn list_naps(&self) -> Result<Vec<PendingNap>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(NAPS)
            .map_err(|e| anyhow!("Failed to open naps table: {}", e))?;

        let mut results = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate naps: {}", e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode_json::<PendingNap>(value.value(), "nap")?);
        }
        Ok(results)
    }

    pub fn pending_naps(&self) -> Result<Vec<PendingNap>> {
        Ok(self.list_naps()?.into_iter().filter(|n| !n.synced).collect())
    }

    pub fn mark_nap_synced(&self, local_id: u64) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let updated;
        {
            let mut table = write_txn
                .open_table(NAPS)
                .map_err(|e| anyhow!("Failed to open naps table: {}", e))?;
            let found = table
                .get(local_id)
                .map_err(|e| anyhow!("Failed to get nap: {}", e))?
                .map(|v| v.value().to_vec());
            updated = match found {
                Some(bytes) => {
                    let mut nap: PendingNap = decode_json(&bytes, "nap")?;
                    nap.synced = true;
                    let value = encode_json(&nap, "nap")?;
                    table
                        .insert(local_id, value.as_slice())
                        .map_err(|e| anyhow!("Failed to update nap: {}", e))?;
                    true
                }
                None => false,
            };
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(updated)
    }

    // ========================================================================
    // Pending Request Operations
    // ========================================================================

    /// Queue a replayable request. The key is its timestamp; on collision the
    /// key moves forward one millisecond until free. Returns the key used.
    pub fn add_request(&self, request: &PendingRequest) -> Result<i64> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let key;
        {
            let mut table = write_txn
                .open_table(REQUESTS)
                .map_err(|e| anyhow!("Failed to open requests table: {}", e))?;
            let mut candidate = request.timestamp;
            while table
                .get(candidate)
                .map_err(|e| anyhow!("Failed to probe request key: {}", e))?
                .is_some()
            {
                candidate += 1;
            }
            let mut stored = request.clone();
            stored.timestamp = candidate;
            let value = encode_json(&stored, "request")?;
            table
                .insert(candidate, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert request: {}", e))?;
            key = candidate;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Queued {:?} {} at {}", request.method, request.url, key);
        Ok(key)
    }

    /// Pending requests in enqueue order
    pub fn list_requests(&self) -> Result<Vec<PendingRequest>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(REQUESTS)
            .map_err(|e| anyhow!("Failed to open requests table: {}", e))?;

        let mut results = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate requests: {}", e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode_json::<PendingRequest>(value.value(), "request")?);
        }
        Ok(results)
    }

    pub fn delete_request(&self, timestamp: i64) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(REQUESTS)
                .map_err(|e| anyhow!("Failed to open requests table: {}", e))?;
            removed = table
                .remove(timestamp)
                .map_err(|e| anyhow!("Failed to remove request: {}", e))?
                .is_some();
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit delete: {}", e))?;
        Ok(removed)
    }
}

// ============================================================================
// In-transaction helpers
// ============================================================================

fn insert_report_in(txn: &WriteTransaction, report: NewReport) -> Result<PendingReport> {
    let local_id = next_sequence(txn, "reports")?;
    let record = PendingReport {
        local_id,
        visit_id: report.visit_id,
        technician_id: report.technician_id,
        payload: report.payload,
        equipment: report.equipment,
        synced: false,
        server_id: None,
        created_at: now_millis(),
    };
    let value = encode_json(&record, "report")?;
    let mut table = txn
        .open_table(REPORTS)
        .map_err(|e| anyhow!("Failed to open reports table: {}", e))?;
    table
        .insert(local_id, value.as_slice())
        .map_err(|e| anyhow!("Failed to insert report: {}", e))?;
    Ok(record)
}

fn insert_photo_in(
    txn: &WriteTransaction,
    report_local_id: u64,
    photo: PhotoUpload,
) -> Result<PendingPhoto> {
    let local_id = next_sequence(txn, "photos")?;
    let record = PendingPhoto {
        local_id,
        report: ReportRef::Local(report_local_id),
        file_name: photo.file_name,
        mime_type: photo.mime_type,
        data: photo.data,
        synced: false,
        created_at: now_millis(),
    };
    let value = encode_bin(&record, "photo")?;
    let mut table = txn
        .open_table(PHOTOS)
        .map_err(|e| anyhow!("Failed to open photos table: {}", e))?;
    table
        .insert(local_id, value.as_slice())
        .map_err(|e| anyhow!("Failed to insert photo: {}", e))?;
    Ok(record)
}

fn photos_of_local_report(txn: &WriteTransaction, local_id: u64) -> Result<Vec<PendingPhoto>> {
    let table = txn
        .open_table(PHOTOS)
        .map_err(|e| anyhow!("Failed to open photos table: {}", e))?;
    let mut found = Vec::new();
    for entry in table
        .iter()
        .map_err(|e| anyhow!("Failed to iterate photos: {}", e))?
    {
        let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        let photo: PendingPhoto = decode_bin(value.value(), "photo")?;
        if photo.report == ReportRef::Local(local_id) {
            found.push(photo);
        }
    }
    Ok(found)
}

fn remap_photos_in(txn: &WriteTransaction, local_id: u64, server_id: i64) -> Result<usize> {
    let photos = photos_of_local_report(txn, local_id)?;
    let mut table = txn
        .open_table(PHOTOS)
        .map_err(|e| anyhow!("Failed to open photos table: {}", e))?;
    for mut photo in photos.iter().cloned() {
        photo.report = ReportRef::Server(server_id);
        let value = encode_bin(&photo, "photo")?;
        table
            .insert(photo.local_id, value.as_slice())
            .map_err(|e| anyhow!("Failed to remap photo {}: {}", photo.local_id, e))?;
    }
    Ok(photos.len())
}

fn drop_photos_in(txn: &WriteTransaction, local_id: u64) -> Result<usize> {
    let photos = photos_of_local_report(txn, local_id)?;
    let mut table = txn
        .open_table(PHOTOS)
        .map_err(|e| anyhow!("Failed to open photos table: {}", e))?;
    for photo in &photos {
        table
            .remove(photo.local_id)
            .map_err(|e| anyhow!("Failed to remove photo {}: {}", photo.local_id, e))?;
    }
    Ok(photos.len())
}
