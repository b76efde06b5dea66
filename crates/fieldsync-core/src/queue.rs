//! ============================================================================
//! Offline Queue - Local intake of technician work waiting for the server
//! ============================================================================
//! Everything a technician does offline lands here first. The sync processor
//! drains it later; nothing in this module touches the network.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::db::slot::StoreSlot;
use crate::db::{LocalStore, NewNap, NewReport, PendingRequest, PhotoUpload};
use crate::types::{now_millis, VisitId};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Counts of queued work, as shown in the pending badge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    pub requests: usize,
    pub reports: usize,
    pub photos: usize,
    pub naps: usize,
}

impl PendingSummary {
    pub fn total(&self) -> usize {
        self.requests + self.reports + self.photos + self.naps
    }
}

pub struct OfflineQueue {
    slot: Arc<StoreSlot>,
}

impl OfflineQueue {
    pub fn new(slot: Arc<StoreSlot>) -> Self {
        Self { slot }
    }

    async fn store(&self) -> Result<Arc<LocalStore>> {
        self.slot
            .wait_ready()
            .await
            .ok_or_else(|| anyhow!("Local store unavailable"))
    }

    /// Queue a completed-visit report with its photos.
    /// A report without a technician takes the one of the current session.
    pub async fn save_report(
        &self,
        mut report: NewReport,
        photos: Vec<PhotoUpload>,
    ) -> Result<u64> {
        let store = self.store().await?;

        let lacks_technician = report
            .technician_id
            .as_deref()
            .map(|t| t.trim().is_empty() || t == "unknown")
            .unwrap_or(true);
        if lacks_technician {
            report.technician_id = store.session()?.and_then(|s| s.technician_id);
        }

        let visit_id = report.visit_id;
        let photo_count = photos.len();
        let report_id = store.add_report_with_photos(report, photos)?;

        info!(
            "Report {} for visit {} saved offline with {} photos",
            report_id, visit_id, photo_count
        );
        Ok(report_id)
    }

    /// Queue `PUT visitas-tecnicas/{id}/iniciar` for replay
    pub async fn save_visit_start(&self, visit_id: VisitId) -> Result<i64> {
        let key = self
            .store()
            .await?
            .add_request(&PendingRequest::start_visit(visit_id, now_millis()))?;
        info!("Start of visit {} queued", visit_id);
        Ok(key)
    }

    pub async fn save_nap(&self, nap: NewNap) -> Result<u64> {
        let id = self.store().await?.add_nap(nap)?;
        info!("NAP box {} saved offline", id);
        Ok(id)
    }

    pub async fn pending_summary(&self) -> Result<PendingSummary> {
        let store = self.store().await?;
        Ok(PendingSummary {
            requests: store.list_requests()?.len(),
            reports: store.pending_reports()?.len(),
            photos: store.pending_photos()?.len(),
            naps: store.pending_naps()?.len(),
        })
    }

    pub async fn has_pending(&self) -> bool {
        self.pending_summary()
            .await
            .map(|s| s.total() > 0)
            .unwrap_or(false)
    }

    /// Delete synced reports older than `retention_days`
    pub async fn prune_synced(&self, retention_days: u32) -> Result<usize> {
        let cutoff = now_millis() - i64::from(retention_days) * DAY_MS;
        self.store().await?.prune_synced_reports(cutoff)
    }
}
