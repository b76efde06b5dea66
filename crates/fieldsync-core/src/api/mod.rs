//! ============================================================================
//! Remote API - Bearer-token HTTP backend of the visits app
//! ============================================================================
//! `RemoteApi` is the seam between the sync layer and the network; `HttpApi`
//! is the reqwest implementation.
//! ============================================================================

mod http;

pub use http::HttpApi;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::{PendingPhoto, PendingRequest};
use crate::types::{EquipmentAssignment, TechnicianInfo, VisitId, VisitRecord};

/// Failure talking to the remote API
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Not authorized (HTTP {0})")]
    Unauthorized(u16),

    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// 401/403: the session is no longer valid
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    /// Worth retrying on the next trigger
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Decode(_) => true,
            ApiError::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            ApiError::Unauthorized(_) | ApiError::Rejected(_) => false,
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => ApiError::Unauthorized(status),
            s if s >= 500 || s == 408 || s == 429 => ApiError::Server {
                status,
                message: message.into(),
            },
            _ => ApiError::Rejected(format!("HTTP {}: {}", status, message.into())),
        }
    }
}

/// Visit list as returned by `mis-visitas`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisitList {
    pub visits: Vec<VisitRecord>,
    pub technician: Option<TechnicianInfo>,
}

/// Remote endpoints the sync layer depends on.
/// Every call carries the bearer token of the current session.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_visits(&self, token: &str) -> Result<VisitList, ApiError>;

    /// Opaque fingerprint of the technician's current visit list
    async fn check_updates(&self, token: &str) -> Result<String, ApiError>;

    /// Submit a report body; returns the server report id.
    /// `Ok(None)` means the report was accepted but the response carried no usable id.
    async fn submit_report(&self, token: &str, body: &Value) -> Result<Option<i64>, ApiError>;

    /// Upload photos of an accepted report in one multipart request
    async fn upload_photos(
        &self,
        token: &str,
        server_report_id: i64,
        photos: &[PendingPhoto],
    ) -> Result<(), ApiError>;

    async fn submit_nap(&self, token: &str, body: &Value) -> Result<(), ApiError>;

    /// Replay a request queued while offline
    async fn replay(&self, token: &str, request: &PendingRequest) -> Result<(), ApiError>;

    async fn start_visit(&self, token: &str, visit_id: VisitId) -> Result<(), ApiError>;

    async fn assign_equipment(
        &self,
        token: &str,
        visit_id: VisitId,
        equipment: &EquipmentAssignment,
    ) -> Result<(), ApiError>;
}
