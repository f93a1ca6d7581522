//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::error::Error;
use crate::job_tracker::VideoUpload;
use crate::models::ApiResponse;
use crate::realtime_hub::{ErrorMessage, HubMessage, SubscriptionStateMessage, ViewAckMessage};
use crate::session::SessionContext;
use crate::state::AppState;
use crate::subscription_manager::ViewKind;

/// Multipart overhead allowed on top of the video size limit
const MULTIPART_SLACK_BYTES: usize = 64 * 1024;

/// Longest a job status request may wait for completion
const MAX_JOB_WAIT_SECS: u64 = 60;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.upload.max_bytes + MULTIPART_SLACK_BYTES;

    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Devices
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/:id", put(update_device).delete(delete_device))
        .route("/api/devices/:id/detection/toggle", post(toggle_detection))
        // Notifications
        .route("/api/notifications", get(list_notifications))
        // Analysis jobs
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/:id", get(get_job))
        // Subscriptions (diagnostics)
        .route("/api/subscriptions", get(list_subscriptions))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ========================================
// Devices
// ========================================

#[derive(Debug, Deserialize)]
struct CreateDeviceRequest {
    name: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct UpdateDeviceRequest {
    name: String,
}

async fn list_devices(State(state): State<AppState>, ctx: SessionContext) -> impl IntoResponse {
    Json(ApiResponse::success(state.devices.list(&ctx)))
}

async fn create_device(
    State(state): State<AppState>,
    ctx: SessionContext,
    Json(req): Json<CreateDeviceRequest>,
) -> impl IntoResponse {
    match state.devices.add_device(&ctx, &req.name, &req.address).await {
        Ok(device) => (StatusCode::CREATED, Json(ApiResponse::success(device))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn update_device(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> impl IntoResponse {
    match state.devices.rename_device(&ctx, &id, &req.name).await {
        Ok(device) => Json(ApiResponse::success(device)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_device(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.devices.delete_device(&ctx, &id).await {
        Ok(()) => Json(ApiResponse::success(serde_json::json!({ "deleted": id }))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Toggle detection on a device
///
/// Runs on its own task so a dropped request cannot strand the optimistic
/// write or the in-flight flag.
async fn toggle_detection(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let toggles = state.toggles.clone();
    let task = tokio::spawn(async move { toggles.request_toggle(&ctx, &id).await });

    match task.await {
        Ok(Ok(device)) => Json(ApiResponse::success(device)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => Error::Internal(format!("toggle task failed: {}", e)).into_response(),
    }
}

// ========================================
// Notifications
// ========================================

#[derive(Debug, Deserialize)]
struct NotificationQuery {
    device_id: Option<String>,
}

async fn list_notifications(
    State(state): State<AppState>,
    ctx: SessionContext,
    Query(query): Query<NotificationQuery>,
) -> impl IntoResponse {
    let views = state.devices.notifications(&ctx, query.device_id.as_deref());
    Json(ApiResponse::success(views))
}

// ========================================
// Analysis jobs
// ========================================

#[derive(Debug, Deserialize)]
struct JobQuery {
    /// Wait up to this many seconds for the job to complete
    wait_secs: Option<u64>,
}

async fn list_jobs(State(state): State<AppState>, ctx: SessionContext) -> impl IntoResponse {
    Json(ApiResponse::success(state.jobs.list(&ctx)))
}

async fn get_job(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> impl IntoResponse {
    let job = match state.jobs.status(&ctx, &id).await {
        Ok(Some(job)) => job,
        Ok(None) => return Error::NotFound(format!("job {}", id)).into_response(),
        Err(e) => return e.into_response(),
    };

    let job = match query.wait_secs {
        Some(secs) if secs > 0 && !job.status.is_terminal() => {
            let timeout = Duration::from_secs(secs.min(MAX_JOB_WAIT_SECS));
            match state.jobs.wait_for_completion(&id, timeout).await {
                Some(done) => done,
                None => state.jobs.status(&ctx, &id).await.ok().flatten().unwrap_or(job),
            }
        }
        _ => job,
    };

    Json(ApiResponse::success(job)).into_response()
}

/// Accept a video (multipart field `file`) and create its analysis job
async fn submit_job(
    State(state): State<AppState>,
    ctx: SessionContext,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut upload = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return Error::Validation(format!("malformed multipart body: {}", e))
                    .into_response()
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        match field.bytes().await {
            Ok(bytes) => {
                upload = Some(VideoUpload {
                    file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            Err(e) => {
                return Error::Validation(format!("failed to read upload: {}", e)).into_response()
            }
        }
    }

    let Some(upload) = upload else {
        return Error::Validation("missing multipart field `file`".to_string()).into_response();
    };

    match state.jobs.submit_video(&ctx, upload).await {
        Ok(job) => (StatusCode::CREATED, Json(ApiResponse::success(job))).into_response(),
        Err(e) => e.into_response(),
    }
}

// ========================================
// Subscriptions
// ========================================

async fn list_subscriptions(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.subscriptions.snapshot()))
}

// ========================================
// WebSocket Handler
// ========================================

/// Client request on the socket
#[derive(Debug, Deserialize)]
struct ViewRequest {
    action: ViewAction,
    view: ViewKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ViewAction {
    Activate,
    Deactivate,
}

impl ViewAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
        }
    }
}

/// Views a connection currently holds (one entry per activation)
type HeldViews = Arc<Mutex<Vec<ViewKind>>>;

fn lock_views(views: &HeldViews) -> std::sync::MutexGuard<'_, Vec<ViewKind>> {
    views.lock().unwrap_or_else(|p| p.into_inner())
}

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ctx: SessionContext,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, ctx))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState, ctx: SessionContext) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut rx) = state.realtime.register(ctx.user_id.clone()).await;
    let views: HeldViews = Arc::new(Mutex::new(Vec::new()));

    // Hub -> socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Lifecycle states of keys this connection holds
    let state_task = {
        let state = state.clone();
        let ctx = ctx.clone();
        let views = views.clone();
        let mut changes = state.subscriptions.subscribe_states();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let held = lock_views(&views)
                            .iter()
                            .any(|view| view.keys(&ctx).contains(&change.key));
                        if held {
                            let message =
                                HubMessage::SubscriptionState(SubscriptionStateMessage::from(change));
                            state.realtime.send_to_connection(&conn_id, message).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(connection_id = %conn_id, skipped = skipped, "State updates skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    // Socket -> view activations
    let mut recv_task = {
        let state = state.clone();
        let ctx = ctx.clone();
        let views = views.clone();
        tokio::spawn(async move {
            while let Some(result) = receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        handle_view_request(&state, &ctx, conn_id, &views, &text).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        })
    };

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    state_task.abort();

    let held = std::mem::take(&mut *lock_views(&views));
    for view in &held {
        state.subscriptions.deactivate_view(&ctx, view);
    }
    if !held.is_empty() {
        tracing::info!(connection_id = %conn_id, views = held.len(), "Released views of closed socket");
    }

    state.realtime.unregister(&conn_id).await;
}

async fn handle_view_request(
    state: &AppState,
    ctx: &SessionContext,
    conn_id: Uuid,
    views: &HeldViews,
    text: &str,
) {
    let request: ViewRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            let message = HubMessage::Error(ErrorMessage {
                message: format!("invalid request: {}", e),
            });
            state.realtime.send_to_connection(&conn_id, message).await;
            return;
        }
    };

    let keys = match request.action {
        ViewAction::Activate => {
            if let Err(e) = state.devices.authorize_view(ctx, &request.view).await {
                tracing::warn!(
                    connection_id = %conn_id,
                    user_id = %ctx.user_id,
                    error = %e,
                    "View activation rejected"
                );
                let message = HubMessage::Error(ErrorMessage {
                    message: format!("view not available: {}", e),
                });
                state.realtime.send_to_connection(&conn_id, message).await;
                return;
            }
            let keys = state.subscriptions.activate_view(ctx, &request.view);
            lock_views(views).push(request.view.clone());
            keys
        }
        ViewAction::Deactivate => {
            let released = {
                let mut held = lock_views(views);
                match held.iter().position(|v| *v == request.view) {
                    Some(index) => {
                        held.remove(index);
                        true
                    }
                    None => false,
                }
            };
            if !released {
                let message = HubMessage::Error(ErrorMessage {
                    message: "view is not active on this connection".to_string(),
                });
                state.realtime.send_to_connection(&conn_id, message).await;
                return;
            }
            state.subscriptions.deactivate_view(ctx, &request.view);
            request.view.keys(ctx)
        }
    };

    tracing::debug!(
        connection_id = %conn_id,
        action = request.action.as_str(),
        keys = keys.len(),
        "View request handled"
    );

    let ack = HubMessage::ViewAck(ViewAckMessage {
        action: request.action.as_str().to_string(),
        view: request.view,
        keys,
    });
    state.realtime.send_to_connection(&conn_id, ack).await;
}
