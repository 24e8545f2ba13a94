//! HTTP surface.
//!
//! A thin JSON layer over the store and the device sessions. Direct device
//! endpoints (test print, live status, datetime, cancel receipt) take the
//! same per-printer lock the queue uses, so REST traffic can never overlap a
//! running job on the same device. Every error body is `{"detail": ...}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::adapters::{get_adapter, supported_models};
use crate::datecs::fiscal;
use crate::db::{now_iso, Db, JobPatch};
use crate::models::{JobCreate, Printer, PrinterCreate, PrinterUpdate, JOB_FAILED, JOB_PRINTING, JOB_SUCCESS};
use crate::mqtt::MqttBridge;
use crate::queue::JobQueue;
use crate::service;
use crate::settings::Settings;
use crate::transport::list_serial_ports;

pub struct AppState {
    pub db: Arc<Db>,
    pub queue: Arc<JobQueue>,
    pub mqtt: Arc<MqttBridge>,
    pub settings: Arc<Settings>,
}

type SharedState = State<Arc<AppState>>;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }
}

impl From<String> for ApiError {
    fn from(detail: String) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/printers", get(printers_list).post(printer_create))
        .route(
            "/api/printers/:id",
            get(printer_get).put(printer_update).delete(printer_delete),
        )
        .route("/api/printers/:id/test-print", post(printer_test_print))
        .route("/api/printers/:id/status", get(printer_status))
        .route("/api/printers/:id/datetime", get(printer_datetime))
        .route("/api/printers/:id/datetime/sync", post(printer_datetime_sync))
        .route("/api/printers/:id/cancel_receipt", post(printer_cancel_receipt))
        .route("/api/jobs", get(jobs_list).post(job_create))
        .route("/api/jobs/:id", get(job_get))
        .route("/api/jobs/:id/retry", post(job_retry))
        .route("/api/jobs/:id/cancel", post(job_cancel))
        .route("/api/logs", get(logs_list))
        .route("/api/tools/serial-ports", get(serial_ports))
        .route("/api/tools/models", get(models_list))
        .route("/api/mqtt/status", get(mqtt_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

fn load_printer(state: &AppState, id: i64) -> ApiResult<Printer> {
    state
        .db
        .get_printer(id)?
        .ok_or_else(|| ApiError::not_found("Printer not found"))
}

fn validate_printer_fields(model: Option<&str>, transport: Option<&str>) -> ApiResult<()> {
    if let Some(model) = model {
        get_adapter(model).map_err(|e| ApiError::bad_request(e.to_string()))?;
    }
    if let Some(transport) = transport {
        if !matches!(transport.to_lowercase().as_str(), "serial" | "lan") {
            return Err(ApiError::bad_request(format!(
                "Unsupported transport type: {transport}"
            )));
        }
    }
    Ok(())
}

async fn printers_list(State(state): SharedState) -> ApiResult<Json<Vec<Printer>>> {
    Ok(Json(state.db.list_printers()?))
}

async fn printer_get(State(state): SharedState, Path(id): Path<i64>) -> ApiResult<Json<Printer>> {
    Ok(Json(load_printer(&state, id)?))
}

async fn printer_create(
    State(state): SharedState,
    Json(body): Json<PrinterCreate>,
) -> ApiResult<Json<Printer>> {
    validate_printer_fields(Some(&body.model), Some(&body.transport))?;
    Ok(Json(state.db.create_printer(&body)?))
}

async fn printer_update(
    State(state): SharedState,
    Path(id): Path<i64>,
    Json(body): Json<PrinterUpdate>,
) -> ApiResult<Json<Printer>> {
    validate_printer_fields(body.model.as_deref(), body.transport.as_deref())?;
    state
        .db
        .update_printer(id, &body)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Printer not found"))
}

async fn printer_delete(
    State(state): SharedState,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    if !state.db.delete_printer(id)? {
        return Err(ApiError::not_found("Printer not found"));
    }
    Ok(Json(json!({"status": "deleted"})))
}

async fn printer_test_print(
    State(state): SharedState,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let printer = load_printer(&state, id)?;
    if !printer.enabled {
        return Err(ApiError::bad_request("Printer is disabled"));
    }
    let lock = state.queue.printer_lock(printer.id);
    let _guard = lock.lock().await;
    let global_dry_run = state.settings.global_dry_run;
    let result = tokio::task::spawn_blocking(move || service::test_print(&printer, global_dry_run))
        .await
        .map_err(|e| ApiError::from(e.to_string()))?
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({"status": "sent", "result": result})))
}

/// Live status probe, shaped for the UI: ok / warning / error plus issue
/// slugs.
async fn printer_status(
    State(state): SharedState,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let printer = load_printer(&state, id)?;
    let lock = state.queue.printer_lock(printer.id);
    let _guard = lock.lock().await;
    let outcome = tokio::task::spawn_blocking(move || fiscal::probe_status(&printer))
        .await
        .map_err(|e| ApiError::from(e.to_string()))?;

    let flags = match outcome {
        Ok(flags) => flags,
        Err(e) => {
            return Ok(Json(json!({
                "status": "error",
                "message": e.to_string(),
                "issues": ["unknown_error"],
            })))
        }
    };
    let mut issues: Vec<&str> = Vec::new();
    if flags.receipt_open() {
        issues.push("receipt_open");
    }
    for (flag, slug) in [
        ("no_paper", "no_paper"),
        ("cover_open", "cover_open"),
        ("clock_not_set", "clock_not_set"),
    ] {
        if flags.contains(flag) {
            issues.push(slug);
        }
    }
    if issues.is_empty() {
        Ok(Json(json!({
            "status": "ok",
            "message": "Принтерът е готов",
            "issues": [],
        })))
    } else {
        let message = issues
            .iter()
            .map(|issue| match *issue {
                "receipt_open" => "Отворен бон",
                "no_paper" => "Няма хартия",
                "cover_open" => "Отворен капак",
                "clock_not_set" => "Часовникът не е настроен",
                other => other,
            })
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Json(json!({
            "status": "warning",
            "message": message,
            "issues": issues,
        })))
    }
}

async fn printer_datetime(
    State(state): SharedState,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let printer = load_printer(&state, id)?;
    let lock = state.queue.printer_lock(printer.id);
    let _guard = lock.lock().await;
    let (raw, parsed) = tokio::task::spawn_blocking(move || fiscal::read_printer_datetime(&printer))
        .await
        .map_err(|e| ApiError::from(e.to_string()))?
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({
        "raw": raw,
        "datetime": parsed.map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
    })))
}

async fn printer_datetime_sync(
    State(state): SharedState,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let printer = load_printer(&state, id)?;
    let lock = state.queue.printer_lock(printer.id);
    let _guard = lock.lock().await;
    let now = chrono::Local::now().naive_local();
    let sent = fiscal::format_printer_datetime(&now);
    tokio::task::spawn_blocking(move || fiscal::set_printer_datetime(&printer, &now))
        .await
        .map_err(|e| ApiError::from(e.to_string()))?
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({"status": "synced", "datetime": sent})))
}

async fn printer_cancel_receipt(
    State(state): SharedState,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let printer = load_printer(&state, id)?;
    // Audit trail: manual cancellations are recorded as jobs too.
    let job = state.db.create_job(
        printer.id,
        "cancel_receipt",
        &json!({"reason": "Manual cancellation by user"}),
    )?;
    let lock = state.queue.printer_lock(printer.id);
    let _guard = lock.lock().await;
    state.db.update_job(
        job.id,
        &JobPatch {
            status: Some(JOB_PRINTING),
            started_at: Some(Some(now_iso())),
            ..Default::default()
        },
    )?;
    let worker_printer = printer.clone();
    let outcome =
        tokio::task::spawn_blocking(move || fiscal::cancel_receipt_operation(&worker_printer))
            .await
            .map_err(|e| ApiError::from(e.to_string()))?;
    match outcome {
        Ok(result) => {
            state.db.update_job(
                job.id,
                &JobPatch {
                    status: Some(JOB_SUCCESS),
                    result: Some(Some(result.clone())),
                    finished_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            )?;
            Ok(Json(json!({
                "success": true,
                "message": "Receipt cancelled",
                "job_id": job.id,
                "result": result,
            })))
        }
        Err(e) => {
            state.db.update_job(
                job.id,
                &JobPatch {
                    status: Some(JOB_FAILED),
                    error: Some(Some(e.to_string())),
                    finished_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            )?;
            Err(ApiError::from(format!("Failed to cancel receipt: {e}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn jobs_list(
    State(state): SharedState,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(json!(state.db.list_jobs(limit)?)))
}

async fn job_create(
    State(state): SharedState,
    Json(body): Json<JobCreate>,
) -> ApiResult<Json<Value>> {
    let printer = load_printer(&state, body.printer_id)?;
    if !printer.enabled {
        return Err(ApiError::bad_request("Printer is disabled"));
    }
    let job = state
        .db
        .create_job(printer.id, body.payload_type.as_str(), &body.payload)?;
    Ok(Json(json!(job)))
}

async fn job_get(State(state): SharedState, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let job = state
        .db
        .get_job(id)?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(Json(json!(job)))
}

async fn job_retry(State(state): SharedState, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let job = state
        .queue
        .retry_job(id)
        .map_err(|e| ApiError::bad_request(e))?;
    Ok(Json(json!(job)))
}

async fn job_cancel(State(state): SharedState, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let job = state
        .queue
        .cancel_job(id)
        .map_err(|e| ApiError::bad_request(e))?;
    Ok(Json(json!(job)))
}

// ---------------------------------------------------------------------------
// Logs & tools
// ---------------------------------------------------------------------------

async fn logs_list(
    State(state): SharedState,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(200).clamp(1, 500);
    Ok(Json(json!(state.db.list_logs(limit)?)))
}

async fn serial_ports() -> Json<Value> {
    Json(json!({"ports": list_serial_ports()}))
}

async fn models_list() -> Json<Value> {
    Json(json!({"models": supported_models()}))
}

async fn mqtt_status(State(state): SharedState) -> Json<Value> {
    Json(state.mqtt.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AppState> {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let settings = Arc::new(Settings::default());
        let queue = JobQueue::new(Arc::clone(&db), Arc::clone(&settings));
        let mqtt = MqttBridge::new(Arc::clone(&db), Arc::clone(&settings));
        Arc::new(AppState {
            db,
            queue,
            mqtt,
            settings,
        })
    }

    #[test]
    fn test_validate_printer_fields() {
        assert!(validate_printer_fields(Some("datecs_fp700mx"), Some("serial")).is_ok());
        assert!(validate_printer_fields(Some("datecs_fp2000"), Some("LAN")).is_ok());
        assert!(validate_printer_fields(Some("bogus"), Some("serial")).is_err());
        assert!(validate_printer_fields(Some("datecs_fp700mx"), Some("bluetooth")).is_err());
        assert!(validate_printer_fields(None, None).is_ok());
    }

    #[tokio::test]
    async fn test_job_create_requires_enabled_printer() {
        let state = state();
        let printer = state
            .db
            .create_printer(
                &serde_json::from_value(json!({
                    "name": "p", "model": "datecs_fp700mx", "transport": "serial",
                    "port": "COM1", "enabled": false
                }))
                .unwrap(),
            )
            .unwrap();
        let body: JobCreate = serde_json::from_value(json!({
            "printer_id": printer.id,
            "payload_type": "fiscal_receipt",
            "payload": {}
        }))
        .unwrap();
        let result = job_create(State(Arc::clone(&state)), Json(body)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_job_create_round_trip() {
        let state = state();
        let printer = state
            .db
            .create_printer(
                &serde_json::from_value(json!({
                    "name": "p", "model": "datecs_fp700mx", "transport": "serial", "port": "COM1"
                }))
                .unwrap(),
            )
            .unwrap();
        let body: JobCreate = serde_json::from_value(json!({
            "printer_id": printer.id,
            "payload_type": "text",
            "payload": {"lines": ["hi"]}
        }))
        .unwrap();
        let Json(created) = job_create(State(Arc::clone(&state)), Json(body)).await.unwrap();
        assert_eq!(created["status"], "queued");
        let id = created["id"].as_i64().unwrap();
        let Json(fetched) = job_get(State(state), Path(id)).await.unwrap();
        assert_eq!(fetched["payload"]["lines"][0], "hi");
    }

    #[tokio::test]
    async fn test_unknown_payload_kind_rejected_at_parse() {
        let body: Result<JobCreate, _> = serde_json::from_value(json!({
            "printer_id": 1,
            "payload_type": "teleport",
            "payload": {}
        }));
        assert!(body.is_err());
    }
}
