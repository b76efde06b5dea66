//! ============================================================================
//! Sync Processor - Drain queued local work to the remote API
//! ============================================================================
//! One drain pass pushes, in order:
//! 1. replayable requests (visit starts made offline)
//! 2. visit reports
//! 3. report photos (only once their report has a server id)
//! 4. NAP box records
//! A failed item stays queued for the next trigger. Overlapping drains are
//! dropped, not queued.
//! ============================================================================

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, RemoteApi};
use crate::connectivity::ConnectivityMonitor;
use crate::db::slot::StoreSlot;
use crate::db::{LocalStore, PendingPhoto, PendingReport, ReportRef};

/// Per-entity result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTally {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Left for a later pass without an attempt (photos of unsynced reports, offline)
    pub deferred: usize,
    /// No session token, nothing of this kind was attempted
    pub skipped_no_token: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub requests: PhaseTally,
    pub reports: PhaseTally,
    pub photos: PhaseTally,
    pub naps: PhaseTally,
    /// Partial successes, e.g. report accepted but equipment not assigned
    pub warnings: Vec<String>,
    /// The server answered 401/403 and the session was cleared
    pub auth_rejected: bool,
}

impl DrainReport {
    pub fn succeeded(&self) -> usize {
        self.requests.succeeded + self.reports.succeeded + self.photos.succeeded + self.naps.succeeded
    }

    pub fn failed(&self) -> usize {
        self.requests.failed + self.reports.failed + self.photos.failed + self.naps.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain was still running; this call did nothing
    AlreadyRunning,
    Offline,
    StoreUnavailable,
}

/// Clears the in-progress flag however the drain ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncProcessor {
    slot: Arc<StoreSlot>,
    api: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
    in_progress: AtomicBool,
}

impl SyncProcessor {
    pub fn new(
        slot: Arc<StoreSlot>,
        api: Arc<dyn RemoteApi>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            slot,
            api,
            monitor,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one drain pass. Never fails; the outcome says what happened.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress, ignoring trigger");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = DrainGuard(&self.in_progress);

        if !self.monitor.is_online() {
            debug!("Offline, drain skipped");
            return DrainOutcome::Offline;
        }
        let Some(store) = self.slot.wait_ready().await else {
            warn!("Local store unavailable, drain skipped");
            return DrainOutcome::StoreUnavailable;
        };

        let mut report = DrainReport::default();

        if let Err(e) = self.sync_requests(&store, &mut report).await {
            error!("Request phase aborted: {}", e);
        }
        if let Err(e) = self.sync_reports(&store, &mut report).await {
            error!("Report phase aborted: {}", e);
        }
        if let Err(e) = self.sync_photos(&store, &mut report).await {
            error!("Photo phase aborted: {}", e);
        }
        if let Err(e) = self.sync_naps(&store, &mut report).await {
            error!("NAP phase aborted: {}", e);
        }

        if report.succeeded() > 0 || report.failed() > 0 {
            info!(
                "Drain finished: {} synced, {} failed, {} photos deferred",
                report.succeeded(),
                report.failed(),
                report.photos.deferred
            );
        }
        DrainOutcome::Completed(report)
    }

    /// Token for a phase, or `None` after marking the phase skipped
    fn phase_token(store: &LocalStore, tally: &mut PhaseTally, phase: &str) -> Result<Option<String>> {
        let token = store.token()?;
        if token.is_none() {
            warn!("No session token, skipping {} sync", phase);
            tally.skipped_no_token = true;
        }
        Ok(token)
    }

    fn reject_session(store: &LocalStore, report: &mut DrainReport, err: &ApiError) {
        warn!("Session rejected by server ({}), signing out", err);
        if !report.auth_rejected {
            if let Err(e) = store.clear_session() {
                error!("Failed to clear session: {}", e);
            }
            report.auth_rejected = true;
        }
    }

    async fn sync_requests(&self, store: &LocalStore, report: &mut DrainReport) -> Result<()> {
        let requests = store.list_requests()?;
        if requests.is_empty() {
            return Ok(());
        }
        let Some(token) = Self::phase_token(store, &mut report.requests, "request")? else {
            return Ok(());
        };

        for request in requests {
            if !self.monitor.is_online() {
                report.requests.deferred += 1;
                continue;
            }
            report.requests.attempted += 1;
            match self.api.replay(&token, &request).await {
                Ok(()) => {
                    store.delete_request(request.timestamp)?;
                    report.requests.succeeded += 1;
                    info!("Replayed {:?} {}", request.method, request.url);
                }
                Err(e) if e.is_auth() => {
                    report.requests.failed += 1;
                    Self::reject_session(store, report, &e);
                    break;
                }
                Err(e) => {
                    report.requests.failed += 1;
                    warn!("Replay of {} failed: {}", request.url, e);
                }
            }
        }
        Ok(())
    }

    async fn sync_reports(&self, store: &LocalStore, report: &mut DrainReport) -> Result<()> {
        let pending = store.pending_reports()?;
        if pending.is_empty() {
            return Ok(());
        }
        let Some(token) = Self::phase_token(store, &mut report.reports, "report")? else {
            return Ok(());
        };
        let session_technician = store.session()?.and_then(|s| s.technician_id);

        for mut item in pending {
            if !self.monitor.is_online() {
                report.reports.deferred += 1;
                continue;
            }
            if item.lacks_technician() {
                if let Some(tech) = &session_technician {
                    debug!("Report {} takes technician {} from session", item.local_id, tech);
                    item.technician_id = Some(tech.clone());
                    store.update_report(&item)?;
                }
            }

            report.reports.attempted += 1;
            let server_id = match self.api.submit_report(&token, &item.request_body()).await {
                Ok(id) => id,
                Err(e) if e.is_auth() => {
                    report.reports.failed += 1;
                    Self::reject_session(store, report, &e);
                    break;
                }
                Err(e) => {
                    report.reports.failed += 1;
                    warn!("Report {} (visit {}) not synced: {}", item.local_id, item.visit_id, e);
                    continue;
                }
            };

            match server_id {
                Some(server_id) => match store.settle_report(item.local_id, server_id)? {
                    Some(outcome) => info!(
                        "Report {} synced as {} (visit {} retired, {} photos ready)",
                        item.local_id, server_id, item.visit_id, outcome.photos_remapped
                    ),
                    None => debug!("Report {} was already settled", item.local_id),
                },
                None => {
                    // Accepted, so it must not be sent again even though photos cannot follow
                    if let Some(outcome) = store.settle_report_unassigned(item.local_id)? {
                        if outcome.photos_dropped > 0 {
                            report.warnings.push(format!(
                                "Report for visit {} synced without a server id, {} photos dropped",
                                item.visit_id, outcome.photos_dropped
                            ));
                        }
                    }
                }
            }
            report.reports.succeeded += 1;

            if let Some(equipment) = &item.equipment {
                if let Err(e) = self
                    .api
                    .assign_equipment(&token, item.visit_id, equipment)
                    .await
                {
                    warn!(
                        "Equipment {} not assigned to visit {}: {}",
                        equipment.serial, item.visit_id, e
                    );
                    report.warnings.push(format!(
                        "Report for visit {} synced, but equipment {} was not assigned: {}",
                        item.visit_id, equipment.serial, e
                    ));
                }
            }
        }
        Ok(())
    }

    async fn sync_photos(&self, store: &LocalStore, report: &mut DrainReport) -> Result<()> {
        let pending = store.pending_photos()?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<i64, Vec<PendingPhoto>> = BTreeMap::new();
        let mut stranded: BTreeMap<u64, Vec<PendingPhoto>> = BTreeMap::new();
        for photo in pending {
            match photo.report {
                ReportRef::Server(id) => groups.entry(id).or_default().push(photo),
                ReportRef::Local(local) => stranded.entry(local).or_default().push(photo),
            }
        }

        // Photos still filed under a local report id
        for (local, mut photos) in stranded {
            match store.get_report(local)? {
                Some(parent) if !parent.synced => {
                    debug!("{} photos wait for report {}", photos.len(), local);
                    report.photos.deferred += photos.len();
                }
                Some(PendingReport {
                    server_id: Some(server_id),
                    ..
                }) => {
                    store.remap_photos(local, server_id)?;
                    for photo in &mut photos {
                        photo.report = ReportRef::Server(server_id);
                    }
                    groups.entry(server_id).or_default().append(&mut photos);
                }
                _ => {
                    let ids: Vec<u64> = photos.iter().map(|p| p.local_id).collect();
                    store.delete_photos(&ids)?;
                    warn!("Dropped {} photos of report {} with no server id", ids.len(), local);
                    report.warnings.push(format!(
                        "{} photos of report {} dropped: the server report is unknown",
                        ids.len(),
                        local
                    ));
                }
            }
        }
        if groups.is_empty() {
            return Ok(());
        }
        let Some(token) = Self::phase_token(store, &mut report.photos, "photo")? else {
            return Ok(());
        };

        for (server_id, photos) in groups {
            if !self.monitor.is_online() {
                report.photos.deferred += photos.len();
                continue;
            }
            report.photos.attempted += photos.len();
            match self.api.upload_photos(&token, server_id, &photos).await {
                Ok(()) => {
                    let ids: Vec<u64> = photos.iter().map(|p| p.local_id).collect();
                    store.delete_photos(&ids)?;
                    report.photos.succeeded += photos.len();
                    info!("{} photos of report {} uploaded", photos.len(), server_id);
                }
                Err(e) if e.is_auth() => {
                    report.photos.failed += photos.len();
                    Self::reject_session(store, report, &e);
                    break;
                }
                Err(e) => {
                    report.photos.failed += photos.len();
                    warn!("Photos of report {} not uploaded: {}", server_id, e);
                }
            }
        }
        Ok(())
    }

    async fn sync_naps(&self, store: &LocalStore, report: &mut DrainReport) -> Result<()> {
        let pending = store.pending_naps()?;
        if pending.is_empty() {
            return Ok(());
        }
        let Some(token) = Self::phase_token(store, &mut report.naps, "NAP")? else {
            return Ok(());
        };

        for nap in pending {
            if !self.monitor.is_online() {
                report.naps.deferred += 1;
                continue;
            }
            report.naps.attempted += 1;
            match self.api.submit_nap(&token, &nap.request_body()).await {
                Ok(()) => {
                    store.mark_nap_synced(nap.local_id)?;
                    report.naps.succeeded += 1;
                    info!("NAP box {} ({}) synced", nap.local_id, nap.zone);
                }
                Err(e) if e.is_auth() => {
                    report.naps.failed += 1;
                    Self::reject_session(store, report, &e);
                    break;
                }
                Err(e) => {
                    report.naps.failed += 1;
                    warn!("NAP box {} not synced: {}", nap.local_id, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{ConnectivityEvent, NetworkStatus};
    use crate::db::{temp_store, NewNap, NewReport, PendingRequest, PhotoUpload};
    use crate::reconcile::Reconciler;
    use crate::testing::{Call, MockApi};
    use crate::types::{EquipmentAssignment, Session, VisitRecord, VisitStatus};
    use serde_json::Map;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<LocalStore>,
        slot: Arc<StoreSlot>,
        api: Arc<MockApi>,
        monitor: Arc<ConnectivityMonitor>,
        sync: Arc<SyncProcessor>,
    }

    async fn harness() -> Harness {
        let (dir, store) = temp_store();
        let slot = Arc::new(StoreSlot::ready(store));
        let store = slot.get().await.unwrap();
        let mut session = Session::new("tok");
        session.technician_id = Some("7".into());
        store.set_session(&session).unwrap();

        let api = Arc::new(MockApi::new());
        let monitor = Arc::new(ConnectivityMonitor::new(NetworkStatus::Online));
        let sync = Arc::new(SyncProcessor::new(slot.clone(), api.clone(), monitor.clone()));
        Harness {
            _dir: dir,
            store,
            slot,
            api,
            monitor,
            sync,
        }
    }

    fn report(visit_id: i64) -> NewReport {
        NewReport {
            visit_id,
            technician_id: Some("7".into()),
            payload: Map::new(),
            equipment: None,
        }
    }

    fn photo(name: &str) -> PhotoUpload {
        PhotoUpload {
            file_name: name.into(),
            mime_type: "image/jpeg".into(),
            data: vec![9],
        }
    }

    fn nap() -> NewNap {
        NewNap {
            zone: "Centro".into(),
            ports: 16,
            location: "Calle 5".into(),
            details: None,
            latitude: Some(4.1),
            longitude: Some(-73.6),
            precision: Some(12.0),
        }
    }

    fn completed(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            other => panic!("expected a completed drain, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_report_synced_exactly_once() {
        let h = harness().await;
        let id = h.store.add_report(report(5)).unwrap();

        let first = completed(h.sync.drain().await);
        assert_eq!(first.reports.succeeded, 1);
        let second = completed(h.sync.drain().await);
        assert_eq!(second.reports.attempted, 0);

        assert_eq!(h.api.report_calls(), 1);
        let stored = h.store.get_report(id).unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.server_id, Some(1000));
        assert!(h.store.is_completed(5).unwrap());
    }

    #[tokio::test]
    async fn test_photos_uploaded_with_server_report_id() {
        let h = harness().await;
        h.api.set_next_report_id(555);
        let id = h.store.add_report(report(6)).unwrap();
        h.store.add_photo(id, photo("a.jpg")).unwrap();
        h.store.add_photo(id, photo("b.jpg")).unwrap();

        let result = completed(h.sync.drain().await);
        assert_eq!(result.photos.succeeded, 2);

        let uploads: Vec<Call> = h
            .api
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::UploadPhotos { .. }))
            .collect();
        assert_eq!(
            uploads,
            vec![Call::UploadPhotos {
                report_id: 555,
                files: vec!["a.jpg".into(), "b.jpg".into()],
            }]
        );
        assert!(h.store.list_photos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_photos_wait_for_their_report() {
        let h = harness().await;
        h.api.fail_reports(ApiError::Transport("timeout".into()));
        let id = h.store.add_report(report(6)).unwrap();
        h.store.add_photo(id, photo("a.jpg")).unwrap();

        let result = completed(h.sync.drain().await);
        assert_eq!(result.reports.failed, 1);
        assert_eq!(result.photos.deferred, 1);
        assert_eq!(h.api.count(|c| matches!(c, Call::UploadPhotos { .. })), 0);
        assert_eq!(h.store.photos_for_report(ReportRef::Local(id)).unwrap().len(), 1);

        h.api.clear_failures();
        let result = completed(h.sync.drain().await);
        assert_eq!(result.reports.succeeded, 1);
        assert_eq!(result.photos.succeeded, 1);
    }

    #[tokio::test]
    async fn test_photo_added_after_settlement_still_uploads() {
        let h = harness().await;
        h.api.set_next_report_id(321);
        let id = h.store.add_report(report(12)).unwrap();
        completed(h.sync.drain().await);

        h.store.add_photo(id, photo("late.jpg")).unwrap();
        let result = completed(h.sync.drain().await);
        assert_eq!(result.photos.deferred, 0);
        assert_eq!(result.photos.succeeded, 1);
        assert_eq!(
            h.api.count(|c| matches!(c, Call::UploadPhotos { report_id: 321, .. })),
            1
        );
        assert!(h.store.list_photos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_photo_of_pruned_report_is_dropped() {
        let h = harness().await;
        h.store.add_photo(404, photo("orphan.jpg")).unwrap();

        let result = completed(h.sync.drain().await);
        assert_eq!(result.photos.deferred, 0);
        assert_eq!(result.photos.attempted, 0);
        assert_eq!(result.warnings.len(), 1);
        assert!(h.store.list_photos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_accepted_without_id_is_not_resent() {
        let h = harness().await;
        h.api.accept_reports_without_id();
        let id = h
            .store
            .add_report_with_photos(report(15), vec![photo("a.jpg")])
            .unwrap();

        let first = completed(h.sync.drain().await);
        assert_eq!(first.reports.succeeded, 1);
        assert_eq!(first.reports.failed, 0);
        assert_eq!(first.warnings.len(), 1);
        completed(h.sync.drain().await);
        completed(h.sync.drain().await);

        assert_eq!(h.api.report_calls(), 1);
        assert_eq!(h.api.count(|c| matches!(c, Call::UploadPhotos { .. })), 0);
        let stored = h.store.get_report(id).unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.server_id, None);
        assert!(h.store.is_completed(15).unwrap());
        assert!(h.store.list_photos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_phase_order() {
        let h = harness().await;
        h.store.add_nap(nap()).unwrap();
        let id = h.store.add_report(report(3)).unwrap();
        h.store.add_photo(id, photo("p.jpg")).unwrap();
        h.store.add_request(&PendingRequest::start_visit(3, 1)).unwrap();

        let result = completed(h.sync.drain().await);
        assert_eq!(result.succeeded(), 4);

        let kinds: Vec<&str> = h
            .api
            .calls()
            .iter()
            .map(|c| match c {
                Call::Replay { .. } => "replay",
                Call::SubmitReport { .. } => "report",
                Call::UploadPhotos { .. } => "photos",
                Call::SubmitNap { .. } => "nap",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["replay", "report", "photos", "nap"]);
        assert!(h.store.list_requests().unwrap().is_empty());
        assert!(h.store.pending_naps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_drain_is_ignored() {
        let h = harness().await;
        h.store.add_report(report(9)).unwrap();
        let hold = h.api.hold_reports();

        let first = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.drain().await })
        };
        hold.entered.notified().await;
        assert!(h.sync.is_running());

        assert_eq!(h.sync.drain().await, DrainOutcome::AlreadyRunning);
        assert_eq!(h.api.report_calls(), 1);

        hold.release.notify_one();
        let report = completed(first.await.unwrap());
        assert_eq!(report.reports.succeeded, 1);
        assert_eq!(h.api.report_calls(), 1);
        assert!(!h.sync.is_running());
    }

    #[tokio::test]
    async fn test_missing_token_skips_every_phase() {
        let h = harness().await;
        h.store.clear_session().unwrap();
        h.store.add_report(report(1)).unwrap();
        h.store.add_nap(nap()).unwrap();
        h.store.add_request(&PendingRequest::start_visit(1, 1)).unwrap();

        let result = completed(h.sync.drain().await);
        assert!(result.requests.skipped_no_token);
        assert!(result.reports.skipped_no_token);
        assert!(result.naps.skipped_no_token);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auth_rejection_clears_session() {
        let h = harness().await;
        h.store.add_request(&PendingRequest::start_visit(1, 1)).unwrap();
        h.store.add_report(report(1)).unwrap();
        h.store.add_report(report(2)).unwrap();
        h.store.add_nap(nap()).unwrap();
        h.api.fail_reports(ApiError::Unauthorized(401));

        let result = completed(h.sync.drain().await);
        assert_eq!(result.requests.succeeded, 1);
        assert_eq!(result.reports.attempted, 1);
        assert!(result.auth_rejected);
        assert!(result.naps.skipped_no_token);
        assert!(h.store.token().unwrap().is_none());
        assert_eq!(h.store.pending_reports().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_drain_does_nothing() {
        let h = harness().await;
        h.store.add_report(report(1)).unwrap();
        h.monitor.apply(ConnectivityEvent::Offline);

        assert_eq!(h.sync.drain().await, DrainOutcome::Offline);
        assert!(h.api.calls().is_empty());
        assert!(!h.sync.is_running());
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let api = Arc::new(MockApi::new());
        let monitor = Arc::new(ConnectivityMonitor::new(NetworkStatus::Online));
        let slot = Arc::new(StoreSlot::with_policy(2, Duration::from_millis(1)));
        let sync = SyncProcessor::new(slot, api, monitor);
        assert_eq!(sync.drain().await, DrainOutcome::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_equipment_failure_is_a_warning() {
        let h = harness().await;
        let mut new_report = report(4);
        new_report.equipment = Some(EquipmentAssignment::new("ZTEG1234"));
        h.store.add_report(new_report).unwrap();
        h.api.fail_equipment(ApiError::Rejected("serial unknown".into()));

        let result = completed(h.sync.drain().await);
        assert_eq!(result.reports.succeeded, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("ZTEG1234"));
        assert!(h.store.pending_reports().unwrap().is_empty());
        assert_eq!(
            h.api.count(|c| matches!(c, Call::AssignEquipment { visit_id: 4, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_technician_filled_from_session() {
        let h = harness().await;
        let mut new_report = report(2);
        new_report.technician_id = Some(String::new());
        h.store.add_report(new_report).unwrap();

        completed(h.sync.drain().await);
        let bodies: Vec<serde_json::Value> = h
            .api
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SubmitReport { body, .. } => Some(body),
                _ => None,
            })
            .collect();
        assert_eq!(bodies[0]["tecnico_id"], "7");
        assert_eq!(bodies[0]["visita_id"], 2);
    }

    #[tokio::test]
    async fn test_pending_visit_retired_after_drain() {
        let h = harness().await;
        let reconciler = Reconciler::new(h.slot.clone());
        let remote = vec![VisitRecord::new(20, VisitStatus::Assigned, "C", "M")];
        h.store.put_visit(&remote[0]).unwrap();
        h.store.add_report(report(20)).unwrap();

        assert!(reconciler.reconcile(remote.clone(), None).await.unwrap().is_empty());
        assert!(h.store.get_visit(20).unwrap().is_some());

        completed(h.sync.drain().await);
        assert!(h.store.is_completed(20).unwrap());
        assert!(h.store.get_visit(20).unwrap().is_none());
        assert!(reconciler.reconcile(remote, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_nap_stays_pending() {
        let h = harness().await;
        h.store.add_nap(nap()).unwrap();
        h.api.fail_naps(ApiError::Server {
            status: 500,
            message: "db down".into(),
        });

        let result = completed(h.sync.drain().await);
        assert_eq!(result.naps.failed, 1);
        assert_eq!(h.store.pending_naps().unwrap().len(), 1);

        h.api.clear_failures();
        let result = completed(h.sync.drain().await);
        assert_eq!(result.naps.succeeded, 1);
    }
}
