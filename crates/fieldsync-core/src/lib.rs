//! ============================================================================
//! FIELDSYNC-CORE: Offline sync layer for field technicians
//! ============================================================================
//! This crate keeps a technician's visit list usable without a connection:
//! - Local store (redb) for visits, the completed-visit ledger and sync queues
//! - Change-detection gate that skips unchanged visit-list downloads
//! - Sync queue processor that drains reports, photos and NAP records
//! - Cache reconciler that keeps completed visits from resurfacing
//! - Connectivity monitor plus the PDF and map-tile asset cache
//! ============================================================================

pub mod api;
pub mod assets;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod gate;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use types::*;
pub use api::{ApiError, HttpApi, RemoteApi};
pub use assets::{AssetCache, Bounds, TileCoord};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, MonitorAction, NetworkStatus};
pub use db::{LocalStore, StoreSlot};
pub use queue::PendingSummary;
pub use service::{FieldSync, RefreshOutcome, StartOutcome, Submission};
pub use sync::{DrainOutcome, DrainReport};
