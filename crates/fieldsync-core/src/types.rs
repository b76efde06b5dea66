//! ============================================================================
//! Core Types - Visits, ids and session state shared across FieldSync
//! ============================================================================
//! Wire names follow the visit API (Spanish field names), Rust names are English.
//! Every visit id passes through `normalize_id`, so a `"42"` from one endpoint
//! and a `42` from another always compare equal.
//! ============================================================================

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Visit identifier as assigned by the server
pub type VisitId = i64;

/// Default equipment type recorded when a serial is captured without one
pub const DEFAULT_EQUIPMENT_KIND: &str = "Onu CData";

/// Default equipment cost (COP) sent with an equipment assignment
pub const DEFAULT_EQUIPMENT_COST: u64 = 180_000;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a JSON id to an integer.
/// Accepts numbers (including integral floats) and numeric strings.
pub fn normalize_id(value: &Value) -> Option<VisitId> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<VisitId>().ok(),
        _ => None,
    }
}

/// Deserialize a required id that may arrive as a number or a string
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<VisitId, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    normalize_id(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid visit id: {}", value)))
}

/// Deserialize an optional id; null and unparseable values become `None`
pub fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<VisitId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(normalize_id))
}

/// Deserialize an identifier kept as text (technician ids come as numbers or strings)
pub fn deserialize_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn deserialize_lossy_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

fn deserialize_lossy_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(normalize_id).unwrap_or(0))
}

// ============================================================================
// Visit Types
// ============================================================================

/// Lifecycle state of a technical visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VisitStatus {
    #[serde(rename = "asignada")]
    Assigned,
    #[serde(rename = "en_progreso")]
    InProgress,
    #[serde(rename = "completada")]
    Completed,
    #[serde(rename = "cancelada")]
    Cancelled,
    /// Any state this client does not know about
    #[default]
    #[serde(rename = "desconocido", other)]
    Unknown,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "asignada",
            Self::InProgress => "en_progreso",
            Self::Completed => "completada",
            Self::Cancelled => "cancelada",
            Self::Unknown => "desconocido",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "asignada" | "assigned" => Some(Self::Assigned),
            "en_progreso" | "en-progreso" | "in-progress" | "in_progress" => {
                Some(Self::InProgress)
            }
            "completada" | "completed" => Some(Self::Completed),
            "cancelada" | "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPS position of the client premises
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    #[serde(rename = "latitud")]
    pub lat: f64,
    #[serde(rename = "longitud")]
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }

    /// Parse `{latitud, longitud}`, `{lat, lng}` or a `"lat,lng"` string
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let lat = ["latitud", "lat", "latitude"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(as_f64))?;
                let lng = ["longitud", "lng", "lon", "longitude"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(as_f64))?;
                Self::new(lat, lng)
            }
            Value::String(s) => {
                let (lat, lng) = s.split_once(',')?;
                Self::new(lat.trim().parse().ok()?, lng.trim().parse().ok()?)
            }
            _ => None,
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn deserialize_coordinates<'de, D>(deserializer: D) -> Result<Option<Coordinates>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Coordinates::from_value))
}

/// A visit assigned to a technician.
/// Fields this client does not interpret are kept in `extra` and written back
/// unchanged, so the offline cache holds everything the server sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: VisitId,
    #[serde(
        rename = "tecnico_id",
        default,
        deserialize_with = "deserialize_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub technician_id: Option<String>,
    #[serde(rename = "estado", default)]
    pub status: VisitStatus,
    #[serde(rename = "cliente_nombre", default, deserialize_with = "deserialize_lossy_string")]
    pub client_name: String,
    #[serde(rename = "motivo_visita", default, deserialize_with = "deserialize_lossy_string")]
    pub reason: String,
    #[serde(
        rename = "coordenadas",
        default,
        deserialize_with = "deserialize_coordinates",
        skip_serializing_if = "Option::is_none"
    )]
    pub coordinates: Option<Coordinates>,
    /// Local cache time (ms); zero when the record never touched the cache
    #[serde(default, deserialize_with = "deserialize_lossy_i64")]
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VisitRecord {
    pub fn new(id: VisitId, status: VisitStatus, client_name: &str, reason: &str) -> Self {
        Self {
            id,
            technician_id: None,
            status,
            client_name: client_name.to_string(),
            reason: reason.to_string(),
            coordinates: None,
            timestamp: 0,
            extra: Map::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == VisitStatus::Completed
    }

    /// Still actionable by the technician (not completed, not cancelled)
    pub fn is_open(&self) -> bool {
        !matches!(self.status, VisitStatus::Completed | VisitStatus::Cancelled)
    }
}

/// Technician summary returned alongside the visit list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicianInfo {
    #[serde(default, deserialize_with = "deserialize_opt_text")]
    pub id: Option<String>,
    #[serde(rename = "nombre", default, deserialize_with = "deserialize_lossy_string")]
    pub name: String,
}

/// Equipment serial captured while completing a visit.
/// Assigned to the client once the owning report reaches the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentAssignment {
    pub serial: String,
    pub kind: String,
    pub cost: u64,
}

impl EquipmentAssignment {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: DEFAULT_EQUIPMENT_KIND.to_string(),
            cost: DEFAULT_EQUIPMENT_COST,
        }
    }
}

/// Authenticated technician session.
/// Absence of a session is a normal state (logged out), not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            technician_id: None,
            technician_name: None,
        }
    }
}
