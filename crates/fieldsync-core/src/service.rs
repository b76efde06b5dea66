//! ============================================================================
//! FieldSync Service - Composition root of the offline sync layer
//! ============================================================================
//! Built once and shared by reference. Owns the change gate, reconciler,
//! offline queue, sync processor, asset cache and connectivity monitor, and
//! wires them into the refresh and drain flows:
//!
//!   Online event -> drain queues -> refresh visit list (gate first)
//! ============================================================================

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, HttpApi, RemoteApi};
use crate::assets::AssetCache;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, MonitorAction, NetworkStatus};
use crate::db::slot::StoreSlot;
use crate::db::{CompletionOutcome, LocalStore, NewNap, NewReport, PhotoUpload};
use crate::gate::{content_fingerprint, ChangeGate, Freshness};
use crate::queue::{OfflineQueue, PendingSummary};
use crate::reconcile::Reconciler;
use crate::sync::{DrainOutcome, SyncProcessor};
use crate::types::{Session, VisitId, VisitRecord, VisitStatus};

/// Result of a visit-list refresh
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New visible list; re-render and download its assets
    Updated(Vec<VisitRecord>),
    /// Nothing changed since the last rendered list
    Unchanged,
    /// Remote list unavailable; showing the local cache
    Cached {
        visits: Vec<VisitRecord>,
        reason: String,
    },
    /// No valid session; the user must log in
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Sent,
    /// Stored for replay on the next drain
    Queued,
}

/// Local id of queued work plus the drain it triggered, if online
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub local_id: u64,
    pub drain: Option<DrainOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub action: MonitorAction,
    pub drain: Option<DrainOutcome>,
    pub refresh: Option<RefreshOutcome>,
}

pub struct FieldSync {
    config: SyncConfig,
    slot: Arc<StoreSlot>,
    api: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
    gate: ChangeGate,
    reconciler: Reconciler,
    queue: OfflineQueue,
    sync: SyncProcessor,
    assets: AssetCache,
}

impl FieldSync {
    pub fn new(
        config: SyncConfig,
        slot: Arc<StoreSlot>,
        api: Arc<dyn RemoteApi>,
        initial: NetworkStatus,
    ) -> Result<Self> {
        let monitor = Arc::new(ConnectivityMonitor::new(initial));
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            gate: ChangeGate::new(slot.clone()),
            reconciler: Reconciler::new(slot.clone()),
            queue: OfflineQueue::new(slot.clone()),
            sync: SyncProcessor::new(slot.clone(), api.clone(), monitor.clone()),
            assets: AssetCache::new(slot.clone(), client, &config.tile_url, config.tile_zooms.clone())
                .with_max_tiles(config.max_tiles),
            config,
            slot,
            api,
            monitor,
        })
    }

    /// Open the local store and the HTTP API described by `config`
    pub fn open(config: SyncConfig) -> Result<Self> {
        let store = LocalStore::open(config.db_path.as_deref())?;
        let slot = StoreSlot::ready_with_policy(
            store,
            config.store_wait_attempts,
            config.store_wait_interval,
        );
        let api = HttpApi::new(&config.api_url, config.http_timeout)?;
        Self::new(config, Arc::new(slot), Arc::new(api), NetworkStatus::Unknown)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    pub async fn store(&self) -> Option<Arc<LocalStore>> {
        self.slot.wait_ready().await
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub async fn sign_in(&self, session: &Session) -> Result<()> {
        let store = self.require_store().await?;
        store.set_session(session)?;
        // A different technician must not inherit the previous fingerprints.
        store.clear_fingerprints()
    }

    pub async fn sign_out(&self) -> Result<bool> {
        self.require_store().await?.clear_session()
    }

    async fn require_store(&self) -> Result<Arc<LocalStore>> {
        self.slot
            .wait_ready()
            .await
            .ok_or_else(|| anyhow!("Local store unavailable"))
    }

    // ========================================================================
    // Visit list
    // ========================================================================

    /// Refresh the visit list. `background` refreshes (poll, reconnect) stay
    /// on the cache when the fingerprint check fails; a foreground refresh
    /// then goes straight to the full download.
    pub async fn refresh_visits(&self, background: bool) -> RefreshOutcome {
        let Some(store) = self.slot.wait_ready().await else {
            return RefreshOutcome::Cached {
                visits: Vec::new(),
                reason: "Local store unavailable".to_string(),
            };
        };
        let session = match store.session() {
            Ok(Some(session)) if !session.token.trim().is_empty() => session,
            Ok(_) => return RefreshOutcome::SignedOut,
            Err(e) => {
                warn!("Failed to read session: {}", e);
                return RefreshOutcome::SignedOut;
            }
        };
        let technician = session.technician_id.clone();

        if !self.monitor.is_online() {
            return self.cached(technician.as_deref(), "offline").await;
        }

        let freshness = self.gate.check(self.api.as_ref(), &session.token).await;
        let rendered = store.content_fingerprint().ok().flatten();
        let server_fingerprint = match freshness {
            Freshness::Unchanged if rendered.is_some() => {
                debug!("Visit list unchanged, skipping download");
                return RefreshOutcome::Unchanged;
            }
            Freshness::Unknown if background => {
                return self
                    .cached(technician.as_deref(), "fingerprint check failed")
                    .await;
            }
            Freshness::Changed { fingerprint } => Some(fingerprint),
            Freshness::Unchanged | Freshness::Unknown => None,
        };

        let list = match self.api.fetch_visits(&session.token).await {
            Ok(list) => list,
            Err(e) => return self.fetch_failed(&store, technician.as_deref(), e).await,
        };

        let technician = match list.technician.as_ref().and_then(|t| t.id.clone()) {
            Some(id) => {
                if session.technician_id.as_deref() != Some(id.as_str()) {
                    let mut updated = session.clone();
                    updated.technician_id = Some(id.clone());
                    updated.technician_name = list.technician.as_ref().map(|t| t.name.clone());
                    if let Err(e) = store.set_session(&updated) {
                        warn!("Failed to update session technician: {}", e);
                    }
                }
                Some(id)
            }
            None => technician,
        };

        let visible = match self
            .reconciler
            .reconcile(list.visits, technician.as_deref())
            .await
        {
            Ok(visible) => visible,
            Err(e) => {
                warn!("Reconciliation failed: {}", e);
                return self.cached(technician.as_deref(), &e.to_string()).await;
            }
        };

        if let Some(fp) = &server_fingerprint {
            if let Err(e) = self.gate.commit(fp).await {
                warn!("Failed to store fingerprint: {}", e);
            }
        }
        let content = content_fingerprint(&visible);
        if let Err(e) = store.set_content_fingerprint(&content) {
            warn!("Failed to store content fingerprint: {}", e);
        }

        if rendered.as_deref() == Some(content.as_str()) {
            debug!("Downloaded list matches the rendered one");
            RefreshOutcome::Unchanged
        } else {
            info!("{} visits ready", visible.len());
            RefreshOutcome::Updated(visible)
        }
    }

    async fn cached(&self, technician: Option<&str>, reason: &str) -> RefreshOutcome {
        RefreshOutcome::Cached {
            visits: self.reconciler.load_cached(technician).await,
            reason: reason.to_string(),
        }
    }

    async fn fetch_failed(
        &self,
        store: &LocalStore,
        technician: Option<&str>,
        err: ApiError,
    ) -> RefreshOutcome {
        if err.is_auth() {
            warn!("Visit list refused ({}), signing out", err);
            if let Err(e) = store.clear_session() {
                warn!("Failed to clear session: {}", e);
            }
            return RefreshOutcome::SignedOut;
        }
        warn!("Visit list unavailable: {}", err);
        self.cached(technician, &err.to_string()).await
    }

    /// Visible visits from the local cache
    pub async fn cached_visits(&self) -> Vec<VisitRecord> {
        let technician = match self.slot.wait_ready().await {
            Some(store) => store.session().ok().flatten().and_then(|s| s.technician_id),
            None => None,
        };
        self.reconciler.load_cached(technician.as_deref()).await
    }

    // ========================================================================
    // Technician actions
    // ========================================================================

    /// Tell the server a visit started, or queue the call when that fails
    pub async fn start_visit(&self, visit_id: VisitId) -> Result<StartOutcome> {
        let store = self.require_store().await?;
        mark_in_progress(&store, visit_id);

        let token = store.token()?;
        if let (true, Some(token)) = (self.monitor.is_online(), token) {
            match self.api.start_visit(&token, visit_id).await {
                Ok(()) => {
                    info!("Visit {} started", visit_id);
                    return Ok(StartOutcome::Sent);
                }
                Err(e) if e.is_auth() => {
                    store.clear_session()?;
                    return Err(anyhow!("Session expired: {}", e));
                }
                Err(e) if !e.is_transient() => {
                    return Err(anyhow!("Visit {} could not be started: {}", visit_id, e));
                }
                Err(e) => warn!("Start of visit {} failed, queueing: {}", visit_id, e),
            }
        }

        self.queue.save_visit_start(visit_id).await?;
        Ok(StartOutcome::Queued)
    }

    /// Queue a completed visit's report and photos, then drain when online
    pub async fn complete_visit(
        &self,
        report: NewReport,
        photos: Vec<PhotoUpload>,
    ) -> Result<Submission> {
        let local_id = self.queue.save_report(report, photos).await?;
        Ok(Submission {
            local_id,
            drain: self.drain_if_online().await,
        })
    }

    pub async fn save_nap(&self, nap: NewNap) -> Result<Submission> {
        let local_id = self.queue.save_nap(nap).await?;
        Ok(Submission {
            local_id,
            drain: self.drain_if_online().await,
        })
    }

    /// Retire a visit finished outside the report queue
    pub async fn finalize_visit(&self, visit_id: VisitId) -> Result<CompletionOutcome> {
        let technician = self
            .require_store()
            .await?
            .session()?
            .and_then(|s| s.technician_id);
        self.reconciler
            .finalize_visit(visit_id, technician.as_deref())
            .await
    }

    async fn drain_if_online(&self) -> Option<DrainOutcome> {
        if self.monitor.is_online() {
            Some(self.sync.drain().await)
        } else {
            None
        }
    }

    pub async fn drain(&self) -> DrainOutcome {
        self.sync.drain().await
    }

    pub async fn pending_summary(&self) -> Result<PendingSummary> {
        self.queue.pending_summary().await
    }

    /// Delete synced reports past the retention window
    pub async fn prune(&self) -> Result<usize> {
        self.queue.prune_synced(self.config.retention_days).await
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    /// Apply a connectivity event and carry out the resulting action
    pub async fn handle_event(&self, event: ConnectivityEvent) -> EventOutcome {
        let action = self.monitor.apply(event);
        match action {
            MonitorAction::SyncAndRefresh => {
                let drain = self.sync.drain().await;
                let refresh = self.refresh_visits(true).await;
                EventOutcome {
                    action,
                    drain: Some(drain),
                    refresh: Some(refresh),
                }
            }
            MonitorAction::Suspend => {
                self.assets.cancel_download();
                EventOutcome {
                    action,
                    drain: None,
                    refresh: None,
                }
            }
            MonitorAction::None => EventOutcome {
                action,
                drain: None,
                refresh: None,
            },
        }
    }

    /// Drive the monitor from platform events plus the periodic poll until
    /// `shutdown` resolves or the event channel closes
    pub async fn run<F>(&self, mut events: mpsc::Receiver<ConnectivityEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Sync loop started (poll every {}s)", period.as_secs());
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.handle_event(ConnectivityEvent::Tick).await;
                }
            }
        }
        info!("Sync loop stopped");
    }
}

/// Reflect a started visit in the cache; failures only cost the badge
fn mark_in_progress(store: &LocalStore, visit_id: VisitId) {
    match store.get_visit(visit_id) {
        Ok(Some(mut visit)) if visit.status == VisitStatus::Assigned => {
            visit.status = VisitStatus::InProgress;
            if let Err(e) = store.put_visit(&visit) {
                warn!("Failed to update visit {}: {}", visit_id, e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to read visit {}: {}", visit_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_store;
    use crate::testing::{Call, MockApi};
    use serde_json::Map;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<LocalStore>,
        api: Arc<MockApi>,
        service: Arc<FieldSync>,
    }

    async fn harness(initial: NetworkStatus) -> Harness {
        let (dir, store) = temp_store();
        let slot = Arc::new(StoreSlot::ready(store));
        let store = slot.get().await.unwrap();
        let api = Arc::new(MockApi::new());
        let config = SyncConfig::from_lookup(|_| None);
        let service = Arc::new(FieldSync::new(config, slot, api.clone(), initial).unwrap());

        let mut session = Session::new("tok");
        session.technician_id = Some("7".into());
        service.sign_in(&session).await.unwrap();
        Harness {
            _dir: dir,
            store,
            api,
            service,
        }
    }

    fn assigned(id: VisitId) -> VisitRecord {
        VisitRecord::new(id, VisitStatus::Assigned, "Cliente", "Soporte")
    }

    fn report(visit_id: VisitId) -> NewReport {
        NewReport {
            visit_id,
            technician_id: None,
            payload: Map::new(),
            equipment: None,
        }
    }

    fn visible_ids(outcome: &RefreshOutcome) -> Vec<VisitId> {
        let visits = match outcome {
            RefreshOutcome::Updated(visits) => visits,
            RefreshOutcome::Cached { visits, .. } => visits,
            other => panic!("no visit list in {:?}", other),
        };
        let mut ids: Vec<_> = visits.iter().map(|v| v.id).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_signed_out_refresh_makes_no_calls() {
        let h = harness(NetworkStatus::Online).await;
        h.service.sign_out().await.unwrap();
        assert_eq!(h.service.refresh_visits(false).await, RefreshOutcome::SignedOut);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_fingerprint_skips_download() {
        let h = harness(NetworkStatus::Online).await;
        h.api.set_visits(vec![assigned(1), assigned(2)]);

        let first = h.service.refresh_visits(false).await;
        assert_eq!(visible_ids(&first), vec![1, 2]);
        assert_eq!(h.service.refresh_visits(true).await, RefreshOutcome::Unchanged);
        assert_eq!(h.api.fetch_calls(), 1);

        h.api.set_fingerprint("fp-1");
        assert_eq!(h.service.refresh_visits(true).await, RefreshOutcome::Unchanged);
        assert_eq!(h.api.fetch_calls(), 2);

        h.api.set_fingerprint("fp-2");
        h.api.set_visits(vec![assigned(1)]);
        let changed = h.service.refresh_visits(true).await;
        assert_eq!(visible_ids(&changed), vec![1]);
    }

    #[tokio::test]
    async fn test_offline_refresh_uses_cache() {
        let h = harness(NetworkStatus::Offline).await;
        let mut cached = assigned(3);
        cached.technician_id = Some("7".into());
        h.store.put_visit(&cached).unwrap();

        let outcome = h.service.refresh_visits(false).await;
        assert_eq!(visible_ids(&outcome), vec![3]);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_fetch_signs_out() {
        let h = harness(NetworkStatus::Online).await;
        h.api.fail_fetch(ApiError::Unauthorized(403));

        assert_eq!(h.service.refresh_visits(false).await, RefreshOutcome::SignedOut);
        assert!(h.store.token().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_to_cache() {
        let h = harness(NetworkStatus::Online).await;
        h.api.set_visits(vec![assigned(4)]);
        h.service.refresh_visits(false).await;

        h.api.set_fingerprint("fp-9");
        h.api.fail_fetch(ApiError::Transport("connection reset".into()));
        match h.service.refresh_visits(false).await {
            RefreshOutcome::Cached { visits, reason } => {
                assert_eq!(visits.len(), 1);
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_background_refresh_stays_on_cache_when_check_fails() {
        let h = harness(NetworkStatus::Online).await;
        h.api.fail_check_updates(ApiError::Transport("timeout".into()));

        assert!(matches!(
            h.service.refresh_visits(true).await,
            RefreshOutcome::Cached { .. }
        ));
        assert_eq!(h.api.fetch_calls(), 0);

        assert!(matches!(
            h.service.refresh_visits(false).await,
            RefreshOutcome::Updated(_)
        ));
        assert_eq!(h.api.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_technician_learned_from_visit_list() {
        let h = harness(NetworkStatus::Online).await;
        h.api.set_technician("21", "Laura");
        h.api.set_visits(vec![assigned(1)]);
        h.service.refresh_visits(false).await;

        let session = h.store.session().unwrap().unwrap();
        assert_eq!(session.technician_id.as_deref(), Some("21"));
        assert_eq!(session.technician_name.as_deref(), Some("Laura"));
        assert_eq!(h.store.get_visit(1).unwrap().unwrap().technician_id.as_deref(), Some("21"));
    }

    #[tokio::test]
    async fn test_completed_visit_never_resurfaces() {
        let h = harness(NetworkStatus::Online).await;
        h.api.set_visits(vec![assigned(10), assigned(11)]);
        h.service.refresh_visits(false).await;

        let submission = h.service.complete_visit(report(10), Vec::new()).await.unwrap();
        assert!(matches!(submission.drain, Some(DrainOutcome::Completed(_))));
        assert!(h.store.is_completed(10).unwrap());

        // Server still lags and reports visit 10 as assigned.
        h.api.set_fingerprint("fp-a");
        let outcome = h.service.refresh_visits(false).await;
        assert_eq!(visible_ids(&outcome), vec![11]);

        h.api.set_fingerprint("fp-b");
        assert_eq!(h.service.refresh_visits(false).await, RefreshOutcome::Unchanged);
        let cached: Vec<_> = h.service.cached_visits().await.iter().map(|v| v.id).collect();
        assert_eq!(cached, vec![11]);
    }

    #[tokio::test]
    async fn test_start_visit_offline_is_replayed_on_reconnect() {
        let h = harness(NetworkStatus::Offline).await;
        h.store.put_visit(&assigned(5)).unwrap();

        assert_eq!(h.service.start_visit(5).await.unwrap(), StartOutcome::Queued);
        assert_eq!(h.store.get_visit(5).unwrap().unwrap().status, VisitStatus::InProgress);
        assert_eq!(h.store.list_requests().unwrap().len(), 1);

        let outcome = h.service.handle_event(ConnectivityEvent::Online).await;
        assert_eq!(outcome.action, MonitorAction::SyncAndRefresh);
        assert!(outcome.refresh.is_some());
        assert_eq!(
            h.api.count(|c| matches!(c, Call::Replay { url } if url == "visitas-tecnicas/5/iniciar")),
            1
        );
        assert!(h.store.list_requests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_visit_online() {
        let h = harness(NetworkStatus::Online).await;
        assert_eq!(h.service.start_visit(6).await.unwrap(), StartOutcome::Sent);
        assert_eq!(h.api.count(|c| matches!(c, Call::StartVisit(6))), 1);

        h.api.fail_start(ApiError::Transport("dns".into()));
        assert_eq!(h.service.start_visit(7).await.unwrap(), StartOutcome::Queued);

        h.api.fail_start(ApiError::Unauthorized(401));
        assert!(h.service.start_visit(8).await.is_err());
        assert!(h.store.token().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_nap_waits_for_connection() {
        let h = harness(NetworkStatus::Offline).await;
        let submission = h
            .service
            .save_nap(NewNap {
                zone: "Oeste".into(),
                ports: 8,
                location: "Parque".into(),
                details: None,
                latitude: None,
                longitude: None,
                precision: None,
            })
            .await
            .unwrap();
        assert_eq!(submission.drain, None);
        assert_eq!(h.service.pending_summary().await.unwrap().naps, 1);

        let outcome = h.service.handle_event(ConnectivityEvent::Offline).await;
        assert_eq!(outcome.action, MonitorAction::None);
        h.service.handle_event(ConnectivityEvent::Online).await;
        assert_eq!(h.service.pending_summary().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_drains_on_online_event() {
        let h = harness(NetworkStatus::Offline).await;
        h.store.add_report(report(12)).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let service = h.service.clone();
        let handle = tokio::spawn(async move {
            service
                .run(rx, async move {
                    let _ = stop_rx.await;
                })
                .await;
        });

        tx.send(ConnectivityEvent::Online).await.unwrap();
        for _ in 0..100 {
            if h.store.is_completed(12).unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.store.is_completed(12).unwrap());
        assert!(h.service.monitor().is_online());

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_visit_and_prune() {
        let h = harness(NetworkStatus::Online).await;
        h.store.put_visit(&assigned(30)).unwrap();
        let outcome = h.service.finalize_visit(30).await.unwrap();
        assert!(outcome.visit_removed);
        assert_eq!(h.store.list_completed().unwrap()[0].technician_id.as_deref(), Some("7"));
        assert_eq!(h.service.prune().await.unwrap(), 0);
    }
}
