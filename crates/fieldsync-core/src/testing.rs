//! Scriptable `RemoteApi` for unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::api::{ApiError, RemoteApi, VisitList};
use crate::db::{PendingPhoto, PendingRequest};
use crate::types::{normalize_id, EquipmentAssignment, TechnicianInfo, VisitId, VisitRecord};

/// One recorded API call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    FetchVisits,
    CheckUpdates,
    SubmitReport { visit_id: Option<VisitId>, body: Value },
    UploadPhotos { report_id: i64, files: Vec<String> },
    SubmitNap { body: Value },
    Replay { url: String },
    StartVisit(VisitId),
    AssignEquipment { visit_id: VisitId, serial: String },
}

/// Pause point inside `submit_report`
#[derive(Default)]
pub struct Hold {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct Failures {
    fetch: Option<ApiError>,
    check: Option<ApiError>,
    report: Option<ApiError>,
    photos: Option<ApiError>,
    nap: Option<ApiError>,
    replay: Option<ApiError>,
    start: Option<ApiError>,
    equipment: Option<ApiError>,
}

struct MockState {
    calls: Vec<Call>,
    visits: Vec<VisitRecord>,
    technician: Option<TechnicianInfo>,
    fingerprint: String,
    next_report_id: i64,
    omit_report_id: bool,
    fail: Failures,
    hold: Option<Arc<Hold>>,
}

pub struct MockApi {
    state: Mutex<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                visits: Vec::new(),
                technician: None,
                fingerprint: "fp-0".to_string(),
                next_report_id: 1000,
                omit_report_id: false,
                fail: Failures::default(),
                hold: None,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_visits(&self, visits: Vec<VisitRecord>) {
        self.with(|s| s.visits = visits);
    }

    pub fn set_technician(&self, id: &str, name: &str) {
        self.with(|s| {
            s.technician = Some(TechnicianInfo {
                id: Some(id.to_string()),
                name: name.to_string(),
            })
        });
    }

    pub fn set_fingerprint(&self, fingerprint: &str) {
        self.with(|s| s.fingerprint = fingerprint.to_string());
    }

    pub fn set_next_report_id(&self, id: i64) {
        self.with(|s| s.next_report_id = id);
    }

    /// Accept reports but answer without a `reporteId`
    pub fn accept_reports_without_id(&self) {
        self.with(|s| s.omit_report_id = true);
    }

    pub fn fail_fetch(&self, err: ApiError) {
        self.with(|s| s.fail.fetch = Some(err));
    }

    pub fn fail_check_updates(&self, err: ApiError) {
        self.with(|s| s.fail.check = Some(err));
    }

    pub fn fail_reports(&self, err: ApiError) {
        self.with(|s| s.fail.report = Some(err));
    }

    pub fn fail_photos(&self, err: ApiError) {
        self.with(|s| s.fail.photos = Some(err));
    }

    pub fn fail_naps(&self, err: ApiError) {
        self.with(|s| s.fail.nap = Some(err));
    }

    pub fn fail_replay(&self, err: ApiError) {
        self.with(|s| s.fail.replay = Some(err));
    }

    pub fn fail_start(&self, err: ApiError) {
        self.with(|s| s.fail.start = Some(err));
    }

    pub fn fail_equipment(&self, err: ApiError) {
        self.with(|s| s.fail.equipment = Some(err));
    }

    pub fn clear_failures(&self) {
        self.with(|s| s.fail = Failures::default());
    }

    /// Make the next `submit_report` wait until `release` is notified
    pub fn hold_reports(&self) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        self.with(|s| s.hold = Some(hold.clone()));
        hold
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.with(|s| s.calls.iter().filter(|c| pred(c)).count())
    }

    pub fn report_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::SubmitReport { .. }))
    }

    pub fn fetch_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::FetchVisits))
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn fetch_visits(&self, _token: &str) -> Result<VisitList, ApiError> {
        self.with(|s| {
            s.calls.push(Call::FetchVisits);
            if let Some(err) = &s.fail.fetch {
                return Err(err.clone());
            }
            Ok(VisitList {
                visits: s.visits.clone(),
                technician: s.technician.clone(),
            })
        })
    }

    async fn check_updates(&self, _token: &str) -> Result<String, ApiError> {
        self.with(|s| {
            s.calls.push(Call::CheckUpdates);
            match &s.fail.check {
                Some(err) => Err(err.clone()),
                None => Ok(s.fingerprint.clone()),
            }
        })
    }

    async fn submit_report(&self, _token: &str, body: &Value) -> Result<Option<i64>, ApiError> {
        let hold = self.with(|s| {
            s.calls.push(Call::SubmitReport {
                visit_id: body.get("visita_id").and_then(normalize_id),
                body: body.clone(),
            });
            s.hold.take()
        });
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        self.with(|s| {
            if let Some(err) = &s.fail.report {
                return Err(err.clone());
            }
            if s.omit_report_id {
                return Ok(None);
            }
            let id = s.next_report_id;
            s.next_report_id += 1;
            Ok(Some(id))
        })
    }

    async fn upload_photos(
        &self,
        _token: &str,
        server_report_id: i64,
        photos: &[PendingPhoto],
    ) -> Result<(), ApiError> {
        self.with(|s| {
            s.calls.push(Call::UploadPhotos {
                report_id: server_report_id,
                files: photos.iter().map(|p| p.file_name.clone()).collect(),
            });
            match &s.fail.photos {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    async fn submit_nap(&self, _token: &str, body: &Value) -> Result<(), ApiError> {
        self.with(|s| {
            s.calls.push(Call::SubmitNap { body: body.clone() });
            match &s.fail.nap {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    async fn replay(&self, _token: &str, request: &PendingRequest) -> Result<(), ApiError> {
        self.with(|s| {
            s.calls.push(Call::Replay {
                url: request.url.clone(),
            });
            match &s.fail.replay {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    async fn start_visit(&self, _token: &str, visit_id: VisitId) -> Result<(), ApiError> {
        self.with(|s| {
            s.calls.push(Call::StartVisit(visit_id));
            match &s.fail.start {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    async fn assign_equipment(
        &self,
        _token: &str,
        visit_id: VisitId,
        equipment: &EquipmentAssignment,
    ) -> Result<(), ApiError> {
        self.with(|s| {
            s.calls.push(Call::AssignEquipment {
                visit_id,
                serial: equipment.serial.clone(),
            });
            match &s.fail.equipment {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }
}
