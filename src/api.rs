use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use roost_db::camera::{Capabilities, CameraSettings};

use crate::context::Context;
use crate::printer::PrintState;
use crate::reconcile::{self, OverrideError, SyncReport, SyncStats};
use crate::settings::SettingsOverride;

pub(crate) fn start_api_server(ctx: Arc<Context>, cancel: CancellationToken) {
    let port = crate::config::config().api_port();
    tokio::spawn(async move {
        let app = Router::new()
            .route("/", get(index))
            .route("/status", get(status))
            .route("/sync", post(force_sync))
            .route("/cameras", get(list_cameras))
            .route("/cameras/{id}", get(camera_detail))
            .route(
                "/cameras/{id}/override",
                post(set_override).delete(clear_override),
            )
            .route(
                "/cameras/{id}/capabilities/refresh",
                post(refresh_capabilities),
            )
            .with_state(ctx);

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("could not bind api port {}: {:#}", port, e);
                return;
            }
        };
        log::info!("api server listening on port {}", port);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("api server error: {:#}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down api server");
}

pub enum ApiError {
    NotFound(&'static str),
    Invalid(serde_json::Value),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": what })),
            )
                .into_response(),
            ApiError::Invalid(body) => (StatusCode::BAD_REQUEST, Json(body)).into_response(),
            ApiError::Internal(e) => {
                log::error!("api error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

fn override_error(err: OverrideError) -> ApiError {
    match err {
        OverrideError::CameraNotFound => ApiError::NotFound("camera not found"),
        OverrideError::Rejected(rejection) => ApiError::Invalid(serde_json::json!({
            "error": rejection.reason,
            "validation_failed": true,
            "suggestions": rejection.suggestions,
            "hint": "set \"validate\": false to skip validation",
        })),
        OverrideError::Internal(e) => ApiError::Internal(e),
    }
}

type ApiJsonResult<T> = Result<Json<T>, ApiError>;

async fn index() -> &'static str {
    "roost api"
}

#[derive(Serialize)]
struct StatusResponse {
    service: &'static str,
    cameras_configured: usize,
    cameras_connected: usize,
    active_overrides: usize,
    rejected_cameras: Vec<crate::device::watch::RejectedCamera>,
    sync: SyncStats,
    backend_available: bool,
    streams_ready: usize,
    active_readers: usize,
    print_state: &'static str,
}

async fn status(State(ctx): State<Arc<Context>>) -> ApiJsonResult<StatusResponse> {
    let conn = ctx.db.connect()?;
    let records = roost_db::camera::query_all(&conn).await?;
    let runtime = ctx.backend.list_runtime_paths().await.unwrap_or_default();
    let streams_ready = runtime.iter().filter(|p| p.ready).count();
    let active_readers = runtime.iter().map(|p| p.readers.len()).sum();

    Ok(Json(StatusResponse {
        service: "roost",
        cameras_configured: records.len(),
        cameras_connected: records.iter().filter(|c| c.connected).count(),
        active_overrides: ctx.overrides.read().await.len(),
        rejected_cameras: ctx.rejected.lock().await.clone(),
        sync: ctx.sync_stats.lock().await.clone(),
        backend_available: ctx.backend.is_available().await,
        streams_ready,
        active_readers,
        print_state: match ctx.print_snapshot().await.state {
            PrintState::Printing => "printing",
            PrintState::Standby => "standby",
        },
    }))
}

#[derive(Serialize)]
struct CameraSummary {
    id: String,
    friendly_name: String,
    hardware_id: String,
    enabled: bool,
    connected: bool,
    device_path: Option<String>,
    effective_settings: CameraSettings,
    has_override: bool,
}

async fn summarize(ctx: &Context, record: &roost_db::camera::CameraRecord) -> CameraSummary {
    let effective = reconcile::resolved_settings(ctx, record).await;
    let has_override = ctx.overrides.read().await.contains_key(&record.id);
    CameraSummary {
        id: record.id.clone(),
        friendly_name: record.friendly_name.clone(),
        hardware_id: record.hardware_id.clone(),
        enabled: record.enabled,
        connected: record.connected,
        device_path: record.device_path.clone(),
        effective_settings: effective,
        has_override,
    }
}

async fn list_cameras(State(ctx): State<Arc<Context>>) -> ApiJsonResult<Vec<CameraSummary>> {
    let conn = ctx.db.connect()?;
    let records = roost_db::camera::query_all(&conn).await?;

    let mut cameras = Vec::with_capacity(records.len());
    for record in &records {
        cameras.push(summarize(&ctx, record).await);
    }
    Ok(Json(cameras))
}

#[derive(Serialize)]
struct CameraDetail {
    #[serde(flatten)]
    summary: CameraSummary,
    persisted_settings: CameraSettings,
    capabilities: Capabilities,
    override_patch: Option<SettingsOverride>,
}

async fn camera_detail(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> ApiJsonResult<CameraDetail> {
    let conn = ctx.db.connect()?;
    let record = roost_db::camera::by_id(&id, &conn)
        .await?
        .ok_or(ApiError::NotFound("camera not found"))?;

    Ok(Json(CameraDetail {
        summary: summarize(&ctx, &record).await,
        override_patch: ctx.overrides.read().await.get(&record.id).cloned(),
        persisted_settings: record.settings,
        capabilities: record.capabilities,
    }))
}

#[derive(Deserialize)]
struct OverrideRequest {
    #[serde(flatten)]
    patch: SettingsOverride,
    /// Validate the combined settings against cached capabilities.
    #[serde(default = "default_true")]
    validate: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct OverrideResponse {
    id: String,
    override_patch: SettingsOverride,
    sync: SyncReport,
}

async fn set_override(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
    Json(request): Json<OverrideRequest>,
) -> ApiJsonResult<OverrideResponse> {
    if request.patch.is_empty() {
        return Err(ApiError::Invalid(serde_json::json!({
            "error": "no override fields provided"
        })));
    }
    let report = reconcile::set_override(&ctx, &id, request.patch.clone(), request.validate)
        .await
        .map_err(override_error)?;
    Ok(Json(OverrideResponse {
        id,
        override_patch: request.patch,
        sync: report,
    }))
}

#[derive(Serialize)]
struct ClearOverrideResponse {
    id: String,
    cleared: bool,
    sync: Option<SyncReport>,
}

async fn clear_override(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> ApiJsonResult<ClearOverrideResponse> {
    let report = reconcile::clear_override(&ctx, &id).await;
    Ok(Json(ClearOverrideResponse {
        id,
        cleared: report.is_some(),
        sync: report,
    }))
}

async fn force_sync(State(ctx): State<Arc<Context>>) -> ApiJsonResult<SyncReport> {
    Ok(Json(reconcile::sync_cycle(&ctx).await))
}

#[derive(Serialize)]
struct RefreshResponse {
    id: String,
    capabilities: Capabilities,
}

async fn refresh_capabilities(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> ApiJsonResult<RefreshResponse> {
    let conn = ctx.db.connect()?;
    let mut record = roost_db::camera::by_id(&id, &conn)
        .await?
        .ok_or(ApiError::NotFound("camera not found"))?;

    let Some(device_path) = record.device_path.clone() else {
        return Err(ApiError::Invalid(serde_json::json!({
            "error": "camera is not connected"
        })));
    };

    let capabilities = crate::device::probe::probe_capabilities(&device_path).await;
    record.capabilities = capabilities.clone();
    roost_db::camera::update(&record, &conn).await?;

    Ok(Json(RefreshResponse { id, capabilities }))
}
