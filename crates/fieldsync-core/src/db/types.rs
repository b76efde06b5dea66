//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::types::{EquipmentAssignment, VisitId};

/// Ledger entry for a visit completed on this device.
/// Written once and never removed by normal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedVisit {
    pub visit_id: VisitId,
    /// Completion time (ms)
    pub completed_at: i64,
    pub technician_id: Option<String>,
}

/// Visit report captured locally, waiting to reach the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReport {
    pub local_id: u64,
    pub visit_id: VisitId,
    pub technician_id: Option<String>,
    /// Form fields exactly as captured (observations, GPS, signatures...)
    pub payload: Map<String, Value>,
    pub equipment: Option<EquipmentAssignment>,
    pub synced: bool,
    /// Server-assigned report id, set together with `synced`
    pub server_id: Option<i64>,
    pub created_at: i64,
}

impl PendingReport {
    /// Body for `POST reportes-visitas`: the captured form plus the ids and,
    /// when present, the equipment serial.
    pub fn request_body(&self) -> Value {
        let mut body = self.payload.clone();
        body.insert("visita_id".into(), Value::from(self.visit_id));
        body.insert(
            "tecnico_id".into(),
            self.technician_id
                .clone()
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        if let Some(eq) = &self.equipment {
            body.insert("serialEquipo".into(), Value::from(eq.serial.clone()));
            body.insert("tipoEquipo".into(), Value::from(eq.kind.clone()));
            body.insert("costoEquipo".into(), Value::from(eq.cost));
        }
        Value::Object(body)
    }

    /// True when the technician id is missing or a placeholder
    pub fn lacks_technician(&self) -> bool {
        match self.technician_id.as_deref() {
            None => true,
            Some(id) => id.trim().is_empty() || id == "unknown",
        }
    }
}

/// Input for a new pending report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReport {
    pub visit_id: VisitId,
    pub technician_id: Option<String>,
    pub payload: Map<String, Value>,
    pub equipment: Option<EquipmentAssignment>,
}

/// Which report a photo belongs to.
/// A photo is only uploadable once its report has a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReportRef {
    Local(u64),
    Server(i64),
}

/// Photo attached to a pending report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPhoto {
    pub local_id: u64,
    pub report: ReportRef,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub synced: bool,
    pub created_at: i64,
}

/// Photo bytes handed over by the capture layer
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoUpload {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// NAP box survey record captured in the field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNap {
    pub local_id: u64,
    pub zone: String,
    pub ports: u32,
    pub location: String,
    pub details: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub precision: Option<f64>,
    pub synced: bool,
    pub created_at: i64,
}

impl PendingNap {
    /// Body for `POST cajas-nap`
    pub fn request_body(&self) -> Value {
        serde_json::json!({
            "zona": self.zone,
            "puertos": self.ports,
            "ubicacion": self.location,
            "detalles": self.details,
            "latitud": self.latitude,
            "longitud": self.longitude,
            "precision": self.precision,
        })
    }
}

/// Input for a new NAP record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNap {
    pub zone: String,
    pub ports: u32,
    pub location: String,
    pub details: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub precision: Option<f64>,
}

/// HTTP verb of a queued side-effecting call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Post,
    Put,
    Delete,
}

/// Side-effecting call made while offline, replayed on the next drain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Enqueue time (ms); also the storage key
    pub timestamp: i64,
    /// Path relative to the API base, e.g. `visitas-tecnicas/10/iniciar`
    pub url: String,
    pub method: RequestMethod,
    pub body: Option<Value>,
}

impl PendingRequest {
    pub fn start_visit(visit_id: VisitId, timestamp: i64) -> Self {
        Self {
            timestamp,
            url: format!("visitas-tecnicas/{}/iniciar", visit_id),
            method: RequestMethod::Put,
            body: Some(Value::Object(Map::new())),
        }
    }
}

/// PDF attached to a visit, cached for offline viewing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPdf {
    pub visit_id: VisitId,
    pub file_name: String,
    pub original_name: String,
    pub data: Vec<u8>,
    pub stored_at: i64,
}

/// Map tile cached for offline navigation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTile {
    pub key: String,
    pub zoom: u8,
    pub data: Vec<u8>,
    pub stored_at: i64,
}

/// What a visit completion removed from the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub visit_removed: bool,
    pub pdfs_removed: usize,
    pub photos_remapped: usize,
    pub photos_dropped: usize,
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub visits: usize,
    pub visit_counts: HashMap<String, usize>,
    pub completed: usize,
    pub pending_reports: usize,
    pub synced_reports: usize,
    pub pending_photos: usize,
    pub pending_naps: usize,
    pub pending_requests: usize,
    pub pdfs: usize,
    pub tiles: usize,
}
