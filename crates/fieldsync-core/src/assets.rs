//! ============================================================================
//! Asset Cache - Visit PDFs and offline map tiles
//! ============================================================================
//! Pure cache: anything missing is fetched again on demand. PDFs of a visit
//! go away with the visit through the completion path.
//! Tiles use Web Mercator `z/x/y` addressing and an OSM-style URL template.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::db::slot::StoreSlot;
use crate::db::{CachedPdf, LocalStore, MapTile};
use crate::types::{now_millis, VisitId};

/// Default tile source
pub const DEFAULT_TILE_URL: &str = "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png";

/// Tile server subdomains, rotated per tile
const TILE_SERVERS: [&str; 3] = ["a", "b", "c"];

/// Average tile size used for storage estimates
pub const AVG_TILE_BYTES: u64 = 20 * 1024;

/// Tiles fetched in parallel
const DOWNLOAD_BATCH: usize = 5;

/// Largest area a single download may cover
pub const DEFAULT_MAX_TILES: u64 = 50_000;

const USER_AGENT: &str = concat!("fieldsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Storage key `z/x/y`
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.z, self.x, self.y)
    }

    pub fn url(&self, template: &str) -> String {
        let server = TILE_SERVERS[((self.x + self.y) as usize) % TILE_SERVERS.len()];
        template
            .replace("{s}", server)
            .replace("{z}", &self.z.to_string())
            .replace("{x}", &self.x.to_string())
            .replace("{y}", &self.y.to_string())
    }
}

/// Geographic area selected for offline use
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self> {
        let valid_lat = |v: f64| (-90.0..=90.0).contains(&v);
        let valid_lng = |v: f64| (-180.0..=180.0).contains(&v);
        if !(valid_lat(north) && valid_lat(south) && valid_lng(east) && valid_lng(west)) {
            return Err(anyhow!("Bounds out of range"));
        }
        if north < south || east < west {
            return Err(anyhow!("Bounds must satisfy north >= south and east >= west"));
        }
        Ok(Self { north, south, east, west })
    }
}

/// Web Mercator tile containing a point
pub fn lat_lng_to_tile(lat: f64, lng: f64, zoom: u8) -> TileCoord {
    let n = 2f64.powi(i32::from(zoom));
    let max = n - 1.0;
    let lat = lat.clamp(-85.051_128_78, 85.051_128_78);
    let lat_rad = lat.to_radians();

    let x = ((lng + 180.0) / 360.0 * n).floor().clamp(0.0, max);
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n)
        .floor()
        .clamp(0.0, max);

    TileCoord {
        z: zoom,
        x: x as u32,
        y: y as u32,
    }
}

/// Tile index ranges covering `bounds` at one zoom level
fn tile_span(bounds: &Bounds, zoom: u8) -> (RangeInclusive<u32>, RangeInclusive<u32>) {
    let nw = lat_lng_to_tile(bounds.north, bounds.west, zoom);
    let se = lat_lng_to_tile(bounds.south, bounds.east, zoom);
    (
        nw.x.min(se.x)..=nw.x.max(se.x),
        nw.y.min(se.y)..=nw.y.max(se.y),
    )
}

/// Every tile covering `bounds` at one zoom level
pub fn tiles_for_bounds(bounds: &Bounds, zoom: u8) -> Vec<TileCoord> {
    let (xs, ys) = tile_span(bounds, zoom);
    let mut tiles = Vec::new();
    for x in xs {
        for y in ys.clone() {
            tiles.push(TileCoord { z: zoom, x, y });
        }
    }
    tiles
}

pub fn tiles_for_zoom_range(bounds: &Bounds, zooms: RangeInclusive<u8>) -> Vec<TileCoord> {
    zooms.flat_map(|z| tiles_for_bounds(bounds, z)).collect()
}

/// Number of tiles covering `bounds` at one zoom level, without listing them
pub fn tile_count_for_bounds(bounds: &Bounds, zoom: u8) -> u64 {
    let (xs, ys) = tile_span(bounds, zoom);
    let width = u64::from(xs.end() - xs.start()) + 1;
    let height = u64::from(ys.end() - ys.start()) + 1;
    width * height
}

pub fn tile_count_for_zoom_range(bounds: &Bounds, zooms: RangeInclusive<u8>) -> u64 {
    zooms.map(|z| tile_count_for_bounds(bounds, z)).sum()
}

/// Result of a tile download run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadTally {
    pub total: usize,
    pub downloaded: usize,
    pub already_cached: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub tiles: usize,
    pub estimated_tile_bytes: u64,
    pub pdfs: usize,
}

pub struct AssetCache {
    slot: Arc<StoreSlot>,
    client: reqwest::Client,
    tile_url: String,
    zooms: RangeInclusive<u8>,
    max_tiles: u64,
    downloading: AtomicBool,
    cancel_requested: AtomicBool,
}

/// Releases the download slot however the run ends
struct DownloadGuard<'a> {
    downloading: &'a AtomicBool,
    cancel_requested: &'a AtomicBool,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        self.cancel_requested.store(false, Ordering::Release);
        self.downloading.store(false, Ordering::Release);
    }
}

impl AssetCache {
    pub fn new(
        slot: Arc<StoreSlot>,
        client: reqwest::Client,
        tile_url: &str,
        zooms: RangeInclusive<u8>,
    ) -> Self {
        Self {
            slot,
            client,
            tile_url: tile_url.to_string(),
            zooms,
            max_tiles: DEFAULT_MAX_TILES,
            downloading: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Refuse downloads covering more than `max_tiles` tiles
    pub fn with_max_tiles(mut self, max_tiles: u64) -> Self {
        self.max_tiles = max_tiles;
        self
    }

    pub fn max_tiles(&self) -> u64 {
        self.max_tiles
    }

    async fn store(&self) -> Result<Arc<LocalStore>> {
        self.slot
            .wait_ready()
            .await
            .ok_or_else(|| anyhow!("Local store unavailable"))
    }

    pub fn zooms(&self) -> RangeInclusive<u8> {
        self.zooms.clone()
    }

    // ========================================================================
    // PDFs
    // ========================================================================

    pub async fn store_pdf(
        &self,
        visit_id: VisitId,
        file_name: &str,
        original_name: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.store()
            .await?
            .put_pdf(visit_id, file_name, original_name, data)
    }

    /// Cached PDF, or `None` when it must be fetched again
    pub async fn pdf(&self, visit_id: VisitId, file_name: &str) -> Option<CachedPdf> {
        let store = self.slot.wait_ready().await?;
        match store.get_pdf(visit_id, file_name) {
            Ok(pdf) => pdf,
            Err(e) => {
                warn!("Failed to read PDF {}/{}: {}", visit_id, file_name, e);
                None
            }
        }
    }

    pub async fn has_pdf(&self, visit_id: VisitId, file_name: &str) -> bool {
        self.pdf(visit_id, file_name).await.is_some()
    }

    pub async fn delete_pdfs_for_visit(&self, visit_id: VisitId) -> Result<usize> {
        self.store().await?.delete_pdfs_for_visit(visit_id)
    }

    // ========================================================================
    // Tiles
    // ========================================================================

    pub async fn tile(&self, coord: TileCoord) -> Option<MapTile> {
        let store = self.slot.wait_ready().await?;
        match store.get_tile(&coord.key()) {
            Ok(tile) => tile,
            Err(e) => {
                warn!("Failed to read tile {}: {}", coord.key(), e);
                None
            }
        }
    }

    /// Tile count and estimated size for an area over the configured zooms
    pub fn estimate(&self, bounds: &Bounds) -> (u64, u64) {
        let count = tile_count_for_zoom_range(bounds, self.zooms.clone());
        (count, count.saturating_mul(AVG_TILE_BYTES))
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::Acquire)
    }

    /// Stop a running download after the current batch.
    /// The download keeps its slot until it has actually stopped.
    pub fn cancel_download(&self) {
        if self.is_downloading() {
            self.cancel_requested.store(true, Ordering::Release);
            info!("Tile download cancellation requested");
        }
    }

    /// Fetch every missing tile of `bounds` for the configured zoom range
    pub async fn download_tiles(&self, bounds: &Bounds) -> Result<DownloadTally> {
        if self
            .downloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(anyhow!("Tile download already in progress"));
        }
        let _guard = DownloadGuard {
            downloading: &self.downloading,
            cancel_requested: &self.cancel_requested,
        };
        self.cancel_requested.store(false, Ordering::Release);
        self.download_missing(bounds).await
    }

    async fn download_missing(&self, bounds: &Bounds) -> Result<DownloadTally> {
        let count = tile_count_for_zoom_range(bounds, self.zooms.clone());
        if count > self.max_tiles {
            return Err(anyhow!(
                "Area covers {} tiles, more than the limit of {}",
                count,
                self.max_tiles
            ));
        }

        let store = self.store().await?;
        let tiles = tiles_for_zoom_range(bounds, self.zooms.clone());
        let mut tally = DownloadTally {
            total: tiles.len(),
            ..Default::default()
        };

        let mut missing = Vec::new();
        for coord in tiles {
            if store.has_tile(&coord.key())? {
                tally.already_cached += 1;
            } else {
                missing.push(coord);
            }
        }
        info!(
            "Downloading {} tiles ({} already cached)",
            missing.len(),
            tally.already_cached
        );

        for batch in missing.chunks(DOWNLOAD_BATCH) {
            if self.cancel_requested.load(Ordering::Acquire) {
                tally.cancelled = true;
                break;
            }
            let mut set = JoinSet::new();
            for coord in batch {
                let client = self.client.clone();
                let url = coord.url(&self.tile_url);
                let coord = *coord;
                set.spawn(async move { (coord, fetch_tile(&client, &url).await) });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((coord, Ok(data))) => {
                        store.put_tile(&MapTile {
                            key: coord.key(),
                            zoom: coord.z,
                            data,
                            stored_at: now_millis(),
                        })?;
                        tally.downloaded += 1;
                    }
                    Ok((coord, Err(e))) => {
                        debug!("Tile {} failed: {}", coord.key(), e);
                        tally.failed += 1;
                    }
                    Err(e) => {
                        warn!("Tile task failed: {}", e);
                        tally.failed += 1;
                    }
                }
            }
        }

        info!(
            "Tile download finished: {} downloaded, {} failed",
            tally.downloaded, tally.failed
        );
        Ok(tally)
    }

    pub async fn storage_info(&self) -> Result<StorageInfo> {
        let store = self.store().await?;
        let tiles = store.tile_count()?;
        Ok(StorageInfo {
            tiles,
            estimated_tile_bytes: tiles as u64 * AVG_TILE_BYTES,
            pdfs: store.pdf_count()?,
        })
    }

    pub async fn clear_tiles(&self) -> Result<usize> {
        self.store().await?.clear_tiles()
    }
}

async fn fetch_tile(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(|e| anyhow!("Failed to fetch tile: {}", e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("Tile server returned HTTP {}", status));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| anyhow!("Failed to read tile: {}", e))?;
    Ok(bytes.to_vec())
}
