//! ============================================================================
//! Configuration - Environment-driven settings for the sync service
//! ============================================================================

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::assets::{DEFAULT_MAX_TILES, DEFAULT_TILE_URL};
use crate::db::slot::{DEFAULT_WAIT_ATTEMPTS, DEFAULT_WAIT_INTERVAL};

pub const DEFAULT_API_URL: &str = "http://localhost:3000/api/";

/// Periodic fallback poll, seconds
pub const DEFAULT_POLL_SECS: u64 = 30;
const MIN_POLL_SECS: u64 = 10;
const MAX_POLL_SECS: u64 = 300;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Synced reports older than this are pruned
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

const MIN_TILE_ZOOM: u8 = 13;
const MAX_TILE_ZOOM: u8 = 17;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    /// None uses FIELDSYNC_DB_PATH or the home-directory default
    pub db_path: Option<String>,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub tile_url: String,
    pub tile_zooms: RangeInclusive<u8>,
    /// Tile downloads covering more tiles than this are refused
    pub max_tiles: u64,
    pub retention_days: u32,
    pub store_wait_attempts: u32,
    pub store_wait_interval: Duration,
}

impl SyncConfig {
    /// Build from a variable lookup (the process environment in `Default`)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        let poll_secs = number("FIELDSYNC_POLL_SECS")
            .unwrap_or(DEFAULT_POLL_SECS)
            .clamp(MIN_POLL_SECS, MAX_POLL_SECS);
        let timeout_secs = number("FIELDSYNC_HTTP_TIMEOUT_SECS")
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        let retention_days = number("FIELDSYNC_RETENTION_DAYS")
            .and_then(|d| u32::try_from(d).ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        Self {
            api_url: lookup("FIELDSYNC_API_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            db_path: lookup("FIELDSYNC_DB_PATH").filter(|v| !v.trim().is_empty()),
            poll_interval: Duration::from_secs(poll_secs),
            http_timeout: Duration::from_secs(timeout_secs),
            tile_url: lookup("FIELDSYNC_TILE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TILE_URL.to_string()),
            tile_zooms: MIN_TILE_ZOOM..=MAX_TILE_ZOOM,
            max_tiles: number("FIELDSYNC_TILE_MAX")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_TILES),
            retention_days,
            store_wait_attempts: DEFAULT_WAIT_ATTEMPTS,
            store_wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}
