use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::Capability;
use crate::engine::CommandReport;
use crate::engine::ControllerError;
use crate::engine::Engine;
use crate::engine::Group;
use crate::engine::GroupCommand;
use crate::engine::GroupSnapshot;
use crate::engine::Phase;
use crate::engine::TurnOn;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    groups: usize,
}

/// One group as returned by the /v1/groups endpoints
#[derive(Serialize)]
struct GroupResponse {
    id: String,
    name: String,
    phase: Phase,
    color_mode: Capability,
    state: GroupSnapshot,
}

impl From<Group> for GroupResponse {
    fn from(group: Group) -> Self {
        let state = group.handle.snapshot();
        Self {
            phase: group.handle.phase(),
            color_mode: state.color_mode(),
            id: group.id,
            name: group.name,
            state: GroupSnapshot::clone(&state),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum ApiError {
    UnknownGroup(String),
    Controller(ControllerError),
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        ApiError::Controller(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::UnknownGroup(id) => (StatusCode::NOT_FOUND, format!("unknown group: {}", id)),
            ApiError::Controller(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

impl AppState {
    fn group(&self, id: &str) -> Result<Group, ApiError> {
        self.engine
            .group(id)
            .ok_or_else(|| ApiError::UnknownGroup(id.to_string()))
    }
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<AppState>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            groups: state.engine.groups().len(),
        }),
    )
}

/// Handler for GET /v1/groups
#[tracing::instrument(skip(state))]
async fn list_groups(State(state): State<AppState>) -> Json<Vec<GroupResponse>> {
    Json(
        state
            .engine
            .groups()
            .into_iter()
            .map(GroupResponse::from)
            .collect(),
    )
}

/// Handler for GET /v1/groups/:id
#[tracing::instrument(skip(state))]
async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GroupResponse>, ApiError> {
    Ok(Json(state.group(&id)?.into()))
}

/// Handler for POST /v1/groups/:id/turn_on
#[tracing::instrument(skip(state))]
async fn turn_on(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(turn_on): Json<TurnOn>,
) -> Result<Json<CommandReport>, ApiError> {
    let group = state.group(&id)?;
    let report = group
        .handle
        .issue_command(GroupCommand::TurnOn(turn_on))
        .await?;
    Ok(Json(report))
}

/// Handler for POST /v1/groups/:id/turn_off
#[tracing::instrument(skip(state))]
async fn turn_off(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandReport>, ApiError> {
    let group = state.group(&id)?;
    let report = group.handle.issue_command(GroupCommand::TurnOff).await?;
    Ok(Json(report))
}

/// Create the API router with all endpoints
pub fn create_router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        version: env!("CARGO_PKG_VERSION"),
        engine,
    };

    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/:id", get(get_group))
        .route("/v1/groups/:id/turn_on", post(turn_on))
        .route("/v1/groups/:id/turn_off", post(turn_off))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(engine);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
