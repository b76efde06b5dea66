//! ============================================================================
//! HTTP API - reqwest implementation of RemoteApi
//! ============================================================================
//! Endpoints (relative to the API base):
//! - GET  mis-visitas, mis-visitas/check-updates
//! - POST reportes-visitas, reportes-fotos (multipart), cajas-nap, asignar-equipo
//! - PUT  visitas-tecnicas/{id}/iniciar
//! Every response is a JSON envelope `{success, message?, ...}`.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{ApiError, RemoteApi, VisitList};
use crate::db::{PendingPhoto, PendingRequest, RequestMethod};
use crate::types::{normalize_id, EquipmentAssignment, TechnicianInfo, VisitId, VisitRecord};

/// Longest server message kept in an error
const MAX_MESSAGE_LEN: usize = 200;

/// Executor for the visits backend
pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpApi {
    /// Create a client for `base_url` (e.g. `https://host/api/`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| anyhow!("Invalid API URL {}: {}", base, e))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        info!("Remote API at {}", base_url);
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Transport(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str, token: &str) -> Result<RequestBuilder, ApiError> {
        let url = self.endpoint(path)?;
        debug!("{} {}", method, url);
        Ok(self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token)))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, ApiError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        read_envelope(response).await
    }
}

/// Turn a response into its JSON envelope, classifying failures.
/// An explicit `success: false` is a rejection even with a 2xx status.
async fn read_envelope(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ApiError::Transport(format!("Failed to read response: {}", e)))?;

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| envelope_message(&body))
            .unwrap_or_else(|| clip(&text));
        return Err(ApiError::from_status(status.as_u16(), message));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let body: Value = serde_json::from_str(&text)
        .map_err(|e| ApiError::Decode(format!("Invalid JSON: {}", e)))?;
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = envelope_message(&body).unwrap_or_else(|| "success: false".to_string());
        return Err(ApiError::Rejected(message));
    }
    Ok(body)
}

/// Stricter check for endpoints whose answer must carry `success: true`
fn require_success(body: &Value) -> Result<(), ApiError> {
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        _ => Err(ApiError::Decode("Missing success flag".to_string())),
    }
}

fn envelope_message(body: &Value) -> Option<String> {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(clip)
}

fn clip(text: &str) -> String {
    text.chars().take(MAX_MESSAGE_LEN).collect()
}

/// Any 2xx answer not flagged `success: false` means the report is stored
fn parse_report_ack(body: &Value) -> Option<i64> {
    let id = body.get("reporteId").and_then(normalize_id);
    if id.is_none() {
        warn!("Report accepted without a usable reporteId: {}", clip(&body.to_string()));
    }
    id
}

fn parse_visit_list(body: &Value) -> Result<VisitList, ApiError> {
    let visits = match body.get("visitas") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match serde_json::from_value::<VisitRecord>(item.clone()) {
                Ok(visit) => Some(visit),
                Err(e) => {
                    let id = item.get("id").cloned().unwrap_or(Value::Null);
                    warn!("Skipping malformed visit {}: {}", id, e);
                    None
                }
            })
            .collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(ApiError::Decode(format!("visitas is not a list: {}", clip(&other.to_string()))))
        }
    };
    let technician = body
        .get("tecnico")
        .filter(|t| !t.is_null())
        .and_then(|t| serde_json::from_value::<TechnicianInfo>(t.clone()).ok());

    Ok(VisitList { visits, technician })
}

fn to_method(method: RequestMethod) -> Method {
    match method {
        RequestMethod::Post => Method::POST,
        RequestMethod::Put => Method::PUT,
        RequestMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn fetch_visits(&self, token: &str) -> Result<VisitList, ApiError> {
        let body = self
            .send(self.request(Method::GET, "mis-visitas", token)?)
            .await?;
        require_success(&body)?;
        let list = parse_visit_list(&body)?;
        debug!("Fetched {} visits", list.visits.len());
        Ok(list)
    }

    async fn check_updates(&self, token: &str) -> Result<String, ApiError> {
        let body = self
            .send(self.request(Method::GET, "mis-visitas/check-updates", token)?)
            .await?;
        require_success(&body)?;
        match body.get("hash") {
            Some(Value::String(hash)) if !hash.is_empty() => Ok(hash.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(ApiError::Decode("Missing hash in check-updates".to_string())),
        }
    }

    async fn submit_report(&self, token: &str, body: &Value) -> Result<Option<i64>, ApiError> {
        let sent = self
            .send(self.request(Method::POST, "reportes-visitas", token)?.json(body))
            .await;
        match sent {
            Ok(response) => Ok(parse_report_ack(&response)),
            // 2xx with an unreadable body: stored server side, so never resend
            Err(ApiError::Decode(message)) => {
                warn!("Report accepted with an unreadable answer: {}", message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_photos(
        &self,
        token: &str,
        server_report_id: i64,
        photos: &[PendingPhoto],
    ) -> Result<(), ApiError> {
        let mut form = Form::new().text("reporteId", server_report_id.to_string());
        for photo in photos {
            let part = Part::bytes(photo.data.clone())
                .file_name(photo.file_name.clone())
                .mime_str(&photo.mime_type)
                .map_err(|e| ApiError::Decode(format!("Bad mime type {}: {}", photo.mime_type, e)))?;
            form = form.part("fotos", part);
        }

        self.send(self.request(Method::POST, "reportes-fotos", token)?.multipart(form))
            .await?;
        Ok(())
    }

    async fn submit_nap(&self, token: &str, body: &Value) -> Result<(), ApiError> {
        let response = self
            .send(self.request(Method::POST, "cajas-nap", token)?.json(body))
            .await?;
        require_success(&response)
    }

    async fn replay(&self, token: &str, request: &PendingRequest) -> Result<(), ApiError> {
        let mut builder = self.request(to_method(request.method), &request.url, token)?;
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        self.send(builder).await?;
        Ok(())
    }

    async fn start_visit(&self, token: &str, visit_id: VisitId) -> Result<(), ApiError> {
        let path = format!("visitas-tecnicas/{}/iniciar", visit_id);
        self.send(self.request(Method::PUT, &path, token)?.json(&json!({})))
            .await?;
        Ok(())
    }

    async fn assign_equipment(
        &self,
        token: &str,
        visit_id: VisitId,
        equipment: &EquipmentAssignment,
    ) -> Result<(), ApiError> {
        let body = json!({
            "visitaId": visit_id,
            "serialEquipo": equipment.serial,
            "costoEquipo": equipment.cost,
            "tipoEquipo": equipment.kind,
        });
        self.send(self.request(Method::POST, "asignar-equipo", token)?.json(&body))
            .await?;
        Ok(())
    }
}
