// ============================================================================
// Cached assets: visit PDFs and map tiles
// ============================================================================

use anyhow::{anyhow, Result};
use redb::{ReadableMultimapTable, ReadableTable, ReadableTableMetadata, WriteTransaction};
use tracing::debug;

use super::types::{CachedPdf, MapTile};
use super::{decode_bin, encode_bin, LocalStore, PDFS, PDFS_BY_VISIT, TILES};
use crate::types::{now_millis, VisitId};

fn pdf_key(visit_id: VisitId, file_name: &str) -> String {
    format!("{}/{}", visit_id, file_name)
}

impl LocalStore {
    // ========================================================================
    // PDF Operations
    // ========================================================================

    /// Store (or overwrite) a PDF attached to a visit
    pub fn put_pdf(
        &self,
        visit_id: VisitId,
        file_name: &str,
        original_name: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        let key = pdf_key(visit_id, file_name);
        let record = CachedPdf {
            visit_id,
            file_name: file_name.to_string(),
            original_name: original_name.to_string(),
            data,
            stored_at: now_millis(),
        };
        let value = encode_bin(&record, "pdf")?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(PDFS)
                .map_err(|e| anyhow!("Failed to open pdfs table: {}", e))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert pdf: {}", e))?;

            let mut index = write_txn
                .open_multimap_table(PDFS_BY_VISIT)
                .map_err(|e| anyhow!("Failed to open pdf index: {}", e))?;
            index
                .insert(visit_id, key.as_str())
                .map_err(|e| anyhow!("Failed to index pdf: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Cached PDF {} ({} bytes)", key, record.data.len());
        Ok(())
    }

    pub fn get_pdf(&self, visit_id: VisitId, file_name: &str) -> Result<Option<CachedPdf>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(PDFS)
            .map_err(|e| anyhow!("Failed to open pdfs table: {}", e))?;

        let key = pdf_key(visit_id, file_name);
        match table
            .get(key.as_str())
            .map_err(|e| anyhow!("Failed to get pdf: {}", e))?
        {
            Some(value) => Ok(Some(decode_bin(value.value(), "pdf")?)),
            None => Ok(None),
        }
    }

    pub fn pdfs_for_visit(&self, visit_id: VisitId) -> Result<Vec<CachedPdf>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let index = read_txn
            .open_multimap_table(PDFS_BY_VISIT)
            .map_err(|e| anyhow!("Failed to open pdf index: {}", e))?;
        let table = read_txn
            .open_table(PDFS)
            .map_err(|e| anyhow!("Failed to open pdfs table: {}", e))?;

        let mut results = Vec::new();
        for key in index
            .get(visit_id)
            .map_err(|e| anyhow!("Failed to read pdf index: {}", e))?
        {
            let key = key.map_err(|e| anyhow!("Failed to read index entry: {}", e))?;
            if let Some(value) = table
                .get(key.value())
                .map_err(|e| anyhow!("Failed to get pdf: {}", e))?
            {
                results.push(decode_bin::<CachedPdf>(value.value(), "pdf")?);
            }
        }
        Ok(results)
    }

    pub fn delete_pdfs_for_visit(&self, visit_id: VisitId) -> Result<usize> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed = remove_pdfs_in(&write_txn, visit_id)?;
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(removed)
    }

    pub fn pdf_count(&self) -> Result<usize> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(PDFS)
            .map_err(|e| anyhow!("Failed to open pdfs table: {}", e))?;
        let len = table
            .len()
            .map_err(|e| anyhow!("Failed to count pdfs: {}", e))?;
        Ok(len as usize)
    }

    // ========================================================================
    // Tile Operations
    // ========================================================================

    pub fn put_tile(&self, tile: &MapTile) -> Result<()> {
        let value = encode_bin(tile, "tile")?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(TILES)
                .map_err(|e| anyhow!("Failed to open tiles table: {}", e))?;
            table
                .insert(tile.key.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert tile: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    /// Tile by its `z/x/y` key
    pub fn get_tile(&self, key: &str) -> Result<Option<MapTile>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(TILES)
            .map_err(|e| anyhow!("Failed to open tiles table: {}", e))?;

        match table
            .get(key)
            .map_err(|e| anyhow!("Failed to get tile: {}", e))?
        {
            Some(value) => Ok(Some(decode_bin(value.value(), "tile")?)),
            None => Ok(None),
        }
    }

    pub fn has_tile(&self, key: &str) -> Result<bool> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(TILES)
            .map_err(|e| anyhow!("Failed to open tiles table: {}", e))?;
        Ok(table
            .get(key)
            .map_err(|e| anyhow!("Failed to get tile: {}", e))?
            .is_some())
    }

    pub fn tile_count(&self) -> Result<usize> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(TILES)
            .map_err(|e| anyhow!("Failed to open tiles table: {}", e))?;
        let len = table
            .len()
            .map_err(|e| anyhow!("Failed to count tiles: {}", e))?;
        Ok(len as usize)
    }

    /// Drop every cached tile; returns how many were removed
    pub fn clear_tiles(&self) -> Result<usize> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(TILES)
                .map_err(|e| anyhow!("Failed to open tiles table: {}", e))?;
            let mut keys = Vec::new();
            for entry in table
                .iter()
                .map_err(|e| anyhow!("Failed to iterate tiles: {}", e))?
            {
                let (key, _value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
                keys.push(key.value().to_string());
            }
            for key in &keys {
                table
                    .remove(key.as_str())
                    .map_err(|e| anyhow!("Failed to remove tile {}: {}", key, e))?;
            }
            removed = keys.len();
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Cleared {} tiles", removed);
        Ok(removed)
    }
}

/// Remove every PDF of a visit inside `txn`, index entries included
pub(super) fn remove_pdfs_in(txn: &WriteTransaction, visit_id: VisitId) -> Result<usize> {
    let mut index = txn
        .open_multimap_table(PDFS_BY_VISIT)
        .map_err(|e| anyhow!("Failed to open pdf index: {}", e))?;
    let mut keys = Vec::new();
    for key in index
        .get(visit_id)
        .map_err(|e| anyhow!("Failed to read pdf index: {}", e))?
    {
        let key = key.map_err(|e| anyhow!("Failed to read index entry: {}", e))?;
        keys.push(key.value().to_string());
    }
    if keys.is_empty() {
        return Ok(0);
    }
    index
        .remove_all(visit_id)
        .map_err(|e| anyhow!("Failed to clear pdf index: {}", e))?;

    let mut table = txn
        .open_table(PDFS)
        .map_err(|e| anyhow!("Failed to open pdfs table: {}", e))?;
    let mut removed = 0;
    for key in &keys {
        if table
            .remove(key.as_str())
            .map_err(|e| anyhow!("Failed to remove pdf {}: {}", key, e))?
            .is_some()
        {
            removed += 1;
        }
    }
    debug!("Removed {} PDFs of visit {}", removed, visit_id);
    Ok(removed)
}
