//! ============================================================================
//! Store Slot - Shared handle to a local store that may not be open yet
//! ============================================================================
//! Callers wait briefly for the store and degrade when it never shows up.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::LocalStore;

/// Default number of readiness probes
pub const DEFAULT_WAIT_ATTEMPTS: u32 = 50;

/// Default delay between probes
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

pub struct StoreSlot {
    inner: RwLock<Option<Arc<LocalStore>>>,
    attempts: u32,
    interval: Duration,
}

impl StoreSlot {
    /// Slot with no store yet; `install` fills it later
    pub fn empty() -> Self {
        Self::with_policy(DEFAULT_WAIT_ATTEMPTS, DEFAULT_WAIT_INTERVAL)
    }

    pub fn with_policy(attempts: u32, interval: Duration) -> Self {
        Self {
            inner: RwLock::new(None),
            attempts,
            interval,
        }
    }

    /// Slot holding an already open store
    pub fn ready(store: LocalStore) -> Self {
        Self::ready_with_policy(store, DEFAULT_WAIT_ATTEMPTS, DEFAULT_WAIT_INTERVAL)
    }

    pub fn ready_with_policy(store: LocalStore, attempts: u32, interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(store))),
            attempts,
            interval,
        }
    }

    pub async fn install(&self, store: LocalStore) {
        let mut slot = self.inner.write().await;
        debug!("Local store installed: {}", store.path().display());
        *slot = Some(Arc::new(store));
    }

    /// Current store without waiting
    pub async fn get(&self) -> Option<Arc<LocalStore>> {
        self.inner.read().await.clone()
    }

    /// Poll until the store is open or the attempts run out
    pub async fn wait_ready(&self) -> Option<Arc<LocalStore>> {
        for attempt in 0..self.attempts.max(1) {
            if let Some(store) = self.get().await {
                return Some(store);
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        warn!(
            "Local store not available after {} attempts",
            self.attempts.max(1)
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_slot_returns_immediately() {
        let (_dir, store) = super::super::temp_store();
        let slot = StoreSlot::ready(store);
        assert!(slot.wait_ready().await.is_some());
    }

    #[tokio::test]
    async fn test_empty_slot_gives_up() {
        let slot = StoreSlot::with_policy(3, Duration::from_millis(1));
        assert!(slot.wait_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_store_installed_while_waiting() {
        let slot = Arc::new(StoreSlot::with_policy(200, Duration::from_millis(5)));
        let (dir, store) = super::super::temp_store();

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait_ready().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.install(store).await;

        assert!(waiter.await.unwrap());
        drop(dir);
    }
}
