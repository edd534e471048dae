//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Followers/Following collections

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::{
    ActorDocument, Inbox, InboxOutcome, InboxRequest, get_followers, get_following_id,
};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

fn activity_json(value: serde_json::Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], value.to_string()).into_response()
}

async fn local_actor(state: &AppState, username: &str) -> Result<Actor, AppError> {
    let handle = format!("{}@{}", username, state.config.server.domain);
    state
        .db
        .get_local_actor_by_handle(&handle)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /users/:username
///
/// Returns ActivityPub Actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let document = serde_json::to_value(ActorDocument::from_local(&actor))
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(activity_json(document))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    // Verify username exists
    local_actor(&state, &username).await?;
    receive(&state, &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox; the activity itself names the local recipient.
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

async fn receive(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let inbox = Inbox {
        db: &state.db,
        directory: &state.directory,
        queue: &state.queue,
        max_skew: state.config.federation.signature_max_skew(),
    };
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let result = inbox
        .process(InboxRequest {
            method: "POST",
            path_and_query,
            headers,
            body,
        })
        .await;

    let status_label = match &result {
        Ok(InboxOutcome::Processed) => "processed",
        Ok(InboxOutcome::Duplicate) => "duplicate",
        Ok(InboxOutcome::Ignored) => "ignored",
        Err(error) => error.kind(),
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", status_label])
        .inc();

    result.map(|_| StatusCode::ACCEPTED)
}

fn ordered_collection(id: String, items: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let items = get_followers(&state.db, &actor.id).await?;
    let id = actor
        .followers
        .unwrap_or_else(|| format!("{}/followers", actor.id));
    Ok(activity_json(ordered_collection(id, items)))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let items = get_following_id(&state.db, &actor.id).await?;
    let id = actor
        .following
        .unwrap_or_else(|| format!("{}/following", actor.id));
    Ok(activity_json(ordered_collection(id, items)))
}
