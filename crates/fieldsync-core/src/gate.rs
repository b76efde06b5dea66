//! ============================================================================
//! Change Gate - Skip full visit refreshes when nothing changed remotely
//! ============================================================================
//! The server exposes a cheap fingerprint of the technician's visit list.
//! When it matches the last stored one the caller keeps what it already
//! rendered and downloads nothing.
//! ============================================================================

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::db::slot::StoreSlot;
use crate::db::short;
use crate::types::VisitRecord;

/// Result of a fingerprint check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Remote list identical to the last refresh
    Unchanged,
    /// Remote list differs (or was never seen); `fingerprint` is the new one
    Changed { fingerprint: String },
    /// The check itself failed; keep whatever is already shown
    Unknown,
}

impl Freshness {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Freshness::Unchanged)
    }
}

/// Compare a freshly fetched fingerprint with the stored one
pub fn compare(previous: Option<&str>, current: &str) -> Freshness {
    match previous {
        Some(prev) if prev == current => Freshness::Unchanged,
        _ => Freshness::Changed {
            fingerprint: current.to_string(),
        },
    }
}

/// SHA-256 of a visit list as serialized for the cache.
/// The local cache time is left out, so restamping the same list keeps its fingerprint.
pub fn content_fingerprint(visits: &[VisitRecord]) -> String {
    let mut hasher = Sha256::new();
    for visit in visits {
        let mut visit = visit.clone();
        visit.timestamp = 0;
        match serde_json::to_vec(&visit) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(visit.id.to_le_bytes()),
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct ChangeGate {
    slot: Arc<StoreSlot>,
}

impl ChangeGate {
    pub fn new(slot: Arc<StoreSlot>) -> Self {
        Self { slot }
    }

    /// Ask the server for its fingerprint and compare with the stored one.
    /// Never fails: network or store problems yield `Unknown`.
    pub async fn check(&self, api: &dyn RemoteApi, token: &str) -> Freshness {
        let current = match api.check_updates(token).await {
            Ok(fp) => fp,
            Err(e) => {
                warn!("Fingerprint check failed: {}", e);
                return Freshness::Unknown;
            }
        };

        let Some(store) = self.slot.wait_ready().await else {
            return Freshness::Unknown;
        };
        let previous = match store.server_fingerprint() {
            Ok(prev) => prev,
            Err(e) => {
                warn!("Failed to read stored fingerprint: {}", e);
                None
            }
        };

        let freshness = compare(previous.as_deref(), &current);
        match &freshness {
            Freshness::Unchanged => debug!("Visit list unchanged ({})", short(&current)),
            Freshness::Changed { .. } => info!(
                "Visit list changed: {} -> {}",
                previous.as_deref().map(short).unwrap_or("none"),
                short(&current)
            ),
            Freshness::Unknown => {}
        }
        freshness
    }

    /// Persist a fingerprint after a successful full refresh
    pub async fn commit(&self, fingerprint: &str) -> Result<()> {
        match self.slot.wait_ready().await {
            Some(store) => store.set_server_fingerprint(fingerprint),
            None => Err(anyhow::anyhow!("Local store unavailable")),
        }
    }

    /// Forget the stored fingerprint so the next check reports `Changed`
    pub async fn reset(&self) -> Result<()> {
        match self.slot.wait_ready().await {
            Some(store) => store.clear_fingerprints(),
            None => Err(anyhow::anyhow!("Local store unavailable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::db::temp_store;
    use crate::testing::MockApi;
    use crate::types::VisitStatus;

    #[test]
    fn test_compare() {
        assert_eq!(compare(Some("abc"), "abc"), Freshness::Unchanged);
        assert_eq!(
            compare(Some("abc"), "def"),
            Freshness::Changed { fingerprint: "def".into() }
        );
        assert_eq!(
            compare(None, "abc"),
            Freshness::Changed { fingerprint: "abc".into() }
        );
    }

    #[test]
    fn test_content_fingerprint_tracks_content() {
        let a = VisitRecord::new(1, VisitStatus::Assigned, "A", "x");
        let mut b = a.clone();
        assert_eq!(content_fingerprint(&[a.clone()]), content_fingerprint(&[b.clone()]));
        b.status = VisitStatus::InProgress;
        assert_ne!(content_fingerprint(&[a]), content_fingerprint(&[b]));
        assert_eq!(content_fingerprint(&[]).len(), 64);
    }

    #[test]
    fn test_content_fingerprint_ignores_cache_time() {
        let a = VisitRecord::new(1, VisitStatus::Assigned, "A", "x");
        let mut restamped = a.clone();
        restamped.timestamp = 1_792_326_231_363;
        assert_eq!(content_fingerprint(&[a]), content_fingerprint(&[restamped]));
    }

    #[tokio::test]
    async fn test_check_then_commit() {
        let (_dir, store) = temp_store();
        let gate = ChangeGate::new(Arc::new(StoreSlot::ready(store)));
        let api = MockApi::new();
        api.set_fingerprint("h1");

        assert_eq!(
            gate.check(&api, "tok").await,
            Freshness::Changed { fingerprint: "h1".into() }
        );
        gate.commit("h1").await.unwrap();
        assert!(gate.check(&api, "tok").await.is_unchanged());

        api.set_fingerprint("h2");
        assert!(matches!(gate.check(&api, "tok").await, Freshness::Changed { .. }));

        gate.reset().await.unwrap();
        api.set_fingerprint("h1");
        assert!(matches!(gate.check(&api, "tok").await, Freshness::Changed { .. }));
    }

    #[tokio::test]
    async fn test_failed_check_is_unknown() {
        let (_dir, store) = temp_store();
        let gate = ChangeGate::new(Arc::new(StoreSlot::ready(store)));
        let api = MockApi::new();
        api.fail_check_updates(ApiError::Transport("timeout".into()));
        assert_eq!(gate.check(&api, "tok").await, Freshness::Unknown);
    }
}
