//! ============================================================================
//! Cache Reconciler - Merge the remote visit list with local state
//! ============================================================================
//! The server lags behind the device: a visit completed here may still come
//! back as `asignada` until its report is uploaded and processed. The local
//! ledger and the pending-report queue decide what is shown:
//! - status `completada`         -> hidden
//! - id in the completed ledger  -> hidden, permanently
//! - id with an unsynced report  -> hidden, row kept for the sync queue
//! ============================================================================

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::slot::StoreSlot;
use crate::db::{CompletionOutcome, LocalStore};
use crate::types::{now_millis, VisitId, VisitRecord};

/// Ids that must not appear in the active visit list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSets {
    /// Visits in the completed ledger
    pub completed: HashSet<VisitId>,
    /// Visits with a report still waiting for the server
    pub pending: HashSet<VisitId>,
}

impl ExclusionSets {
    pub fn load(store: &LocalStore) -> Result<Self> {
        let completed = store.completed_ids()?;
        let pending = store
            .pending_reports()?
            .into_iter()
            .map(|r| r.visit_id)
            .collect();
        Ok(Self { completed, pending })
    }

    pub fn excludes(&self, visit: &VisitRecord) -> bool {
        visit.is_completed()
            || self.completed.contains(&visit.id)
            || self.pending.contains(&visit.id)
    }
}

/// Drop every visit the exclusion sets hide. Applying it twice is a no-op.
pub fn filter_visits(visits: Vec<VisitRecord>, sets: &ExclusionSets) -> Vec<VisitRecord> {
    visits.into_iter().filter(|v| !sets.excludes(v)).collect()
}

pub struct Reconciler {
    slot: Arc<StoreSlot>,
}

impl Reconciler {
    pub fn new(slot: Arc<StoreSlot>) -> Self {
        Self { slot }
    }

    async fn store(&self) -> Result<Arc<LocalStore>> {
        self.slot
            .wait_ready()
            .await
            .ok_or_else(|| anyhow!("Local store unavailable"))
    }

    pub async fn exclusions(&self) -> Result<ExclusionSets> {
        ExclusionSets::load(&*self.store().await?)
    }

    /// Filter a freshly fetched list and make it the new visit cache.
    /// Visits hidden only because a report is pending stay stored until the
    /// report settles. Returns the visible list.
    pub async fn reconcile(
        &self,
        remote: Vec<VisitRecord>,
        technician_id: Option<&str>,
    ) -> Result<Vec<VisitRecord>> {
        let store = self.store().await?;
        let sets = ExclusionSets::load(&store)?;

        let received = remote.len();
        let now = now_millis();
        let visible: Vec<VisitRecord> = filter_visits(remote, &sets)
            .into_iter()
            .map(|mut visit| {
                if visit.technician_id.is_none() {
                    visit.technician_id = technician_id.map(str::to_string);
                }
                visit.timestamp = now;
                visit
            })
            .collect();

        store.replace_visits(&visible, &sets.pending)?;

        info!(
            "Reconciled visit list: {} received, {} visible ({} in ledger, {} pending sync)",
            received,
            visible.len(),
            sets.completed.len(),
            sets.pending.len()
        );
        Ok(visible)
    }

    /// Visible visits from the cache. Degrades to an empty list when the
    /// store is unavailable or unreadable.
    pub async fn load_cached(&self, technician_id: Option<&str>) -> Vec<VisitRecord> {
        let Some(store) = self.slot.wait_ready().await else {
            return Vec::new();
        };
        let cached = match store.list_visits(technician_id) {
            Ok(visits) => visits,
            Err(e) => {
                warn!("Failed to read cached visits: {}", e);
                return Vec::new();
            }
        };
        match ExclusionSets::load(&store) {
            Ok(sets) => {
                let visible = filter_visits(cached, &sets);
                debug!("Loaded {} cached visits", visible.len());
                visible
            }
            Err(e) => {
                warn!("Failed to read exclusion sets: {}", e);
                Vec::new()
            }
        }
    }

    /// Permanently retire a visit: ledger entry, then cache and PDF eviction
    pub async fn finalize_visit(
        &self,
        visit_id: VisitId,
        technician_id: Option<&str>,
    ) -> Result<CompletionOutcome> {
        self.store().await?.complete_visit(visit_id, technician_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{temp_store, NewReport};
    use crate::types::VisitStatus;
    use serde_json::{json, Map};

    fn assigned(id: VisitId) -> VisitRecord {
        VisitRecord::new(id, VisitStatus::Assigned, "Cliente", "Instalación")
    }

    fn ids(visits: &[VisitRecord]) -> Vec<VisitId> {
        let mut ids: Vec<_> = visits.iter().map(|v| v.id).collect();
        ids.sort();
        ids
    }

    async fn setup() -> (tempfile::TempDir, Arc<LocalStore>, Reconciler) {
        let (dir, store) = temp_store();
        let slot = Arc::new(StoreSlot::ready(store));
        let store = slot.get().await.unwrap();
        (dir, store, Reconciler::new(slot))
    }

    fn pending_report(store: &LocalStore, visit_id: VisitId) -> u64 {
        store
            .add_report(NewReport {
                visit_id,
                technician_id: Some("7".into()),
                payload: Map::new(),
                equipment: None,
            })
            .unwrap()
    }

    #[test]
    fn test_filter_is_idempotent() {
        let mut sets = ExclusionSets::default();
        sets.completed.insert(2);
        sets.pending.insert(3);
        let mut done = assigned(4);
        done.status = VisitStatus::Completed;
        let list = vec![assigned(1), assigned(2), assigned(3), done, assigned(5)];

        let once = filter_visits(list, &sets);
        let twice = filter_visits(once.clone(), &sets);
        assert_eq!(ids(&once), vec![1, 5]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_string_ids_match_ledger() {
        let remote: VisitRecord =
            serde_json::from_value(json!({"id": "42", "estado": "asignada"})).unwrap();
        let mut sets = ExclusionSets::default();
        sets.completed.insert(42);
        assert!(filter_visits(vec![remote], &sets).is_empty());
    }

    #[tokio::test]
    async fn test_scenario_a_visit_stays_visible() {
        let (_dir, store, reconciler) = setup().await;
        store.put_visit(&assigned(10)).unwrap();

        let visible = reconciler.reconcile(vec![assigned(10)], Some("7")).await.unwrap();
        assert_eq!(ids(&visible), vec![10]);
        assert_eq!(visible[0].technician_id.as_deref(), Some("7"));
        assert!(visible[0].timestamp > 0);
        assert_eq!(ids(&reconciler.load_cached(Some("7")).await), vec![10]);
    }

    #[tokio::test]
    async fn test_scenario_b_ledger_hides_visit() {
        let (_dir, store, reconciler) = setup().await;
        store.put_visit(&assigned(10)).unwrap();
        reconciler.finalize_visit(10, Some("7")).await.unwrap();

        let visible = reconciler.reconcile(vec![assigned(10)], Some("7")).await.unwrap();
        assert!(visible.is_empty());
        assert!(store.get_visit(10).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_visit_hidden_but_kept() {
        let (_dir, store, reconciler) = setup().await;
        store.put_visit(&assigned(20)).unwrap();
        pending_report(&store, 20);

        let visible = reconciler
            .reconcile(vec![assigned(20), assigned(21)], None)
            .await
            .unwrap();
        assert_eq!(ids(&visible), vec![21]);
        assert!(store.get_visit(20).unwrap().is_some());
        assert_eq!(ids(&reconciler.load_cached(None).await), vec![21]);
    }

    #[tokio::test]
    async fn test_ledger_survives_repeated_refreshes() {
        let (_dir, store, reconciler) = setup().await;
        let report = pending_report(&store, 30);
        store.settle_report(report, 500).unwrap();

        for _ in 0..3 {
            let visible = reconciler.reconcile(vec![assigned(30)], None).await.unwrap();
            assert!(visible.is_empty());
        }
        assert!(store.get_visit(30).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_replace_drops_stale_rows() {
        let (_dir, store, reconciler) = setup().await;
        store.put_visit(&assigned(1)).unwrap();
        store.put_visit(&assigned(2)).unwrap();

        reconciler.reconcile(vec![assigned(2)], None).await.unwrap();
        assert!(store.get_visit(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let reconciler = Reconciler::new(Arc::new(StoreSlot::with_policy(
            2,
            std::time::Duration::from_millis(1),
        )));
        assert!(reconciler.load_cached(None).await.is_empty());
        assert!(reconciler.reconcile(vec![assigned(1)], None).await.is_err());
    }
}
