//! REST API Handlers
//!
//! Portal-facing endpoints for volumes, attachments, snapshots and
//! replications. Mutating volume operations answer 202 with the ledger body
//! as soon as intake has recorded them.

use crate::controlplane::intake::*;
use crate::controlplane::replication::ReplicationService;
use crate::domain::model::CallerContext;
use crate::domain::ports::ListFilter;
use crate::error::{Error, ErrorKind};
use crate::replication::CreateReplicationOpts;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Json, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Header carrying the caller's user id
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the caller's tenant id
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
/// Header carrying a caller supplied request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InternalServer => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: Error) -> Response {
    let kind = err.kind();
    let status = status_for(kind);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }
    (
        status,
        Json(ApiErrorResponse {
            error: kind.code().into(),
            message: err.to_string(),
            details: None,
        }),
    )
        .into_response()
}

/// JSON body whose rejection is reported as a bad request
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(bad_body(rejection)),
        }
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    error_response(Error::BadRequest(rejection.body_text()))
}

fn respond<T: Serialize>(status: StatusCode, result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

/// 202 with the ledger body; the background handle is dropped
fn accepted<T: Serialize>(result: crate::error::Result<Accepted<T>>) -> Response {
    match result {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted.body)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Caller identity taken from request headers
fn caller_context(headers: &HeaderMap) -> CallerContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    CallerContext {
        user_id: header(USER_ID_HEADER).unwrap_or_default(),
        tenant_id: header(TENANT_ID_HEADER).unwrap_or_default(),
        is_admin: false,
        request_id: header(REQUEST_ID_HEADER)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    intake: Arc<RequestIntake>,
    replication: Arc<ReplicationService>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(intake: Arc<RequestIntake>, replication: Arc<ReplicationService>) -> Self {
        Self {
            intake,
            replication,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            intake: self.intake,
            replication: self.replication,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route(
                "/v1/volumes/:id",
                get(get_volume).put(update_volume).delete(delete_volume),
            )
            .route("/v1/volumes/:id/extend", post(extend_volume))
            // Attachment endpoints
            .route("/v1/attachments", post(create_attachment).get(list_attachments))
            .route(
                "/v1/attachments/:id",
                get(get_attachment)
                    .put(update_attachment)
                    .delete(delete_attachment),
            )
            // Snapshot endpoints
            .route("/v1/snapshots", post(create_snapshot).get(list_snapshots))
            .route(
                "/v1/snapshots/:id",
                get(get_snapshot).put(update_snapshot).delete(delete_snapshot),
            )
            // Replication endpoints
            .route(
                "/v1/replications",
                post(create_replication).get(list_replications),
            )
            .route(
                "/v1/replications/:id",
                get(get_replication).delete(delete_replication),
            )
            .route("/v1/replications/:id/enable", post(enable_replication))
            .route("/v1/replications/:id/disable", post(disable_replication))
            .route("/v1/replications/:id/failover", post(failover_replication))
            // Pool endpoint
            .route("/v1/pools", get(list_pools))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    intake: Arc<RequestIntake>,
    replication: Arc<ReplicationService>,
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CreateVolumeRequest>,
) -> Response {
    info!("Create volume: {} ({} GiB)", request.name, request.size);
    let ctx = caller_context(&headers);
    accepted(state.intake.create_volume(&ctx, request).await)
}

async fn list_volumes(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> Response {
    respond(StatusCode::OK, state.intake.list_volumes(&filter).await)
}

async fn get_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.intake.get_volume(&id).await)
}

async fn update_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateVolumeRequest>,
) -> Response {
    respond(StatusCode::OK, state.intake.update_volume(&id, request).await)
}

async fn extend_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ExtendVolumeRequest>,
) -> Response {
    info!("Extend volume {} to {} GiB", id, request.new_size);
    let ctx = caller_context(&headers);
    accepted(state.intake.extend_volume(&ctx, &id, request).await)
}

async fn delete_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    info!("Delete volume {}", id);
    let ctx = caller_context(&headers);
    accepted(state.intake.delete_volume(&ctx, &id).await)
}

// =============================================================================
// Attachment Handlers
// =============================================================================

async fn create_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CreateAttachmentRequest>,
) -> Response {
    info!("Attach volume {}", request.volume_id);
    let ctx = caller_context(&headers);
    accepted(state.intake.create_attachment(&ctx, request).await)
}

async fn list_attachments(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> Response {
    respond(StatusCode::OK, state.intake.list_attachments(&filter).await)
}

async fn get_attachment(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.intake.get_attachment(&id).await)
}

async fn update_attachment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateAttachmentRequest>,
) -> Response {
    respond(
        StatusCode::OK,
        state.intake.update_attachment(&id, request).await,
    )
}

async fn delete_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = caller_context(&headers);
    accepted(state.intake.delete_attachment(&ctx, &id).await)
}

// =============================================================================
// Snapshot Handlers
// =============================================================================

async fn create_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CreateSnapshotRequest>,
) -> Response {
    info!("Snapshot volume {}: {}", request.volume_id, request.name);
    let ctx = caller_context(&headers);
    accepted(state.intake.create_snapshot(&ctx, request).await)
}

async fn list_snapshots(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> Response {
    respond(StatusCode::OK, state.intake.list_snapshots(&filter).await)
}

async fn get_snapshot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.intake.get_snapshot(&id).await)
}

async fn update_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateSnapshotRequest>,
) -> Response {
    respond(StatusCode::OK, state.intake.update_snapshot(&id, request).await)
}

async fn delete_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = caller_context(&headers);
    accepted(state.intake.delete_snapshot(&ctx, &id).await)
}

// =============================================================================
// Replication Handlers
// =============================================================================

async fn create_replication(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateReplicationOpts>,
) -> Response {
    info!(
        "Create replication {} -> {}",
        request.primary_volume_id, request.secondary_volume_id
    );
    respond(StatusCode::CREATED, state.replication.create(request).await)
}

async fn list_replications(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.replication.list().await)
}

async fn get_replication(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.replication.get(&id).await)
}

async fn enable_replication(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.replication.enable(&id).await)
}

async fn disable_replication(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.replication.disable(&id).await)
}

async fn failover_replication(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    respond(StatusCode::OK, state.replication.failover(&id).await)
}

async fn delete_replication(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.replication.delete(&id).await)
}

// =============================================================================
// Pool and Health Handlers
// =============================================================================

async fn list_pools(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.intake.ledger().list_pools().await)
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // placement needs at least one pool
    match state.intake.ledger().list_pools().await {
        Ok(pools) if !pools.is_empty() => (StatusCode::OK, "ready"),
        Ok(_) => (StatusCode::SERVICE_UNAVAILABLE, "no pools registered"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "ledger unavailable"),
    }
}
