use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{
        CommandId, CommandRecord, DeviceId, DeviceSummary, MirroredSwitch, SwitchActivity, SwitchId,
    },
    error::{ApiError, ErrorCode, SyncError},
    protocol::{SubmitCommandRequest, SubmitCommandResponse},
};
use storage::Storage;
use sync_api::SyncContext;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod app_state;
mod config;
mod link;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct ListCommandsQuery {
    device_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<u32>,
}

const MAX_REQUEST_BYTES: usize = 16 * 1024;
const GC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let sync = SyncContext::new(
        storage,
        settings.mediator_settings(),
        settings.router_settings(),
    );
    sync.router.reload(Instant::now()).await?;
    spawn_sweeps(sync.clone(), &settings);

    let app = build_router(Arc::new(AppState { sync }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Background upkeep: silent sessions go stale, due commands are retried or
/// expired, and old resolved commands are purged.
fn spawn_sweeps(sync: SyncContext, settings: &Settings) {
    let mut ticker = interval(settings.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_gc = Instant::now();

    tokio::spawn(async move {
        loop {
            let now = ticker.tick().await;
            if let Err(err) = sync.mediator.sweep_heartbeats(now).await {
                error!(error = %err, "sweep: heartbeat check failed");
            }
            if let Err(err) = sync.router.sweep(now).await {
                error!(error = %err, "sweep: command sweep failed");
            }
            if now.duration_since(last_gc) >= GC_INTERVAL {
                last_gc = now;
                if let Err(err) = sync.router.collect_garbage().await {
                    error!(error = %err, "sweep: command purge failed");
                }
            }
        }
    });
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/commands", get(http_list_commands).post(http_submit_command))
        .route("/commands/:command_id", get(http_command_status))
        .route("/devices", get(http_list_devices))
        .route("/devices/:device_id/switches", get(http_list_switches))
        .route(
            "/devices/:device_id/switches/:switch_id/events",
            get(http_switch_activity),
        )
        .route("/link", get(link::link_handler))
        .route("/events", get(link::events_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn sync_error(err: SyncError) -> (StatusCode, Json<ApiError>) {
    let api_error = ApiError::from(err);
    let status = match api_error.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Rejected => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(api_error))
}

fn internal(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, err.to_string())),
    )
}

fn not_found(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(ErrorCode::NotFound, message)),
    )
}

fn validation(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.sync.storage().health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            warn!(error = %err, "healthz: storage unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn http_submit_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitCommandRequest>,
) -> ApiResult<(StatusCode, Json<SubmitCommandResponse>)> {
    if req.device_id.as_str().trim().is_empty() {
        return Err(validation("device_id must not be empty"));
    }
    if req.switch_id.as_str().trim().is_empty() {
        return Err(validation("switch_id must not be empty"));
    }
    let response = state
        .sync
        .router
        .submit(req, Instant::now())
        .await
        .map_err(sync_error)?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn http_list_commands(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListCommandsQuery>,
) -> ApiResult<Json<Vec<CommandRecord>>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    let device_id = q
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(DeviceId::new);
    let commands = state
        .sync
        .storage()
        .list_commands(device_id.as_ref(), limit)
        .await
        .map_err(internal)?;
    Ok(Json(commands))
}

async fn http_command_status(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
) -> ApiResult<Json<CommandRecord>> {
    let command_id = Uuid::parse_str(&command_id)
        .map(CommandId)
        .map_err(|_| validation("command_id must be a UUID"))?;
    state
        .sync
        .router
        .status(command_id)
        .await
        .map_err(sync_error)?
        .map(Json)
        .ok_or_else(|| not_found("command not found"))
}

async fn http_list_devices(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<DeviceSummary>>> {
    let devices = state
        .sync
        .storage()
        .list_devices()
        .await
        .map_err(internal)?;
    Ok(Json(devices))
}

async fn http_list_switches(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<MirroredSwitch>>> {
    let device_id = DeviceId::new(device_id);
    let storage = state.sync.storage();
    storage
        .load_device(&device_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("device not found"))?;
    let switches = storage.list_switches(&device_id).await.map_err(internal)?;
    Ok(Json(switches))
}

async fn http_switch_activity(
    State(state): State<Arc<AppState>>,
    Path((device_id, switch_id)): Path<(String, String)>,
    Query(q): Query<ActivityQuery>,
) -> ApiResult<Json<Vec<SwitchActivity>>> {
    let (device_id, switch_id) = (DeviceId::new(device_id), SwitchId::new(switch_id));
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let storage = state.sync.storage();
    storage
        .load_switch(&device_id, &switch_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("switch not found"))?;
    let activity = storage
        .list_switch_activity(&device_id, &switch_id, limit)
        .await
        .map_err(internal)?;
    Ok(Json(activity))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/link_tests.rs"]
mod link_tests;
