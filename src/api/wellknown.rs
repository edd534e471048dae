//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{generate_webfinger_response, parse_acct};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    if !query.resource.starts_with("acct:") {
        return Err(AppError::Validation(
            "Resource must start with 'acct:'".to_string(),
        ));
    }

    let (username, domain) = parse_acct(&query.resource)
        .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

    // Verify domain matches local domain
    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let handle = format!("{}@{}", username, state.config.server.domain);
    let actor = state
        .db
        .get_local_actor_by_handle(&handle)
        .await?
        .ok_or(AppError::NotFound)?;

    let jrd = generate_webfinger_response(
        &actor.profile.preferred_username,
        &state.config.server.domain,
        &actor.id,
    );
    let body = serde_json::to_string(&jrd).map_err(|e| AppError::Internal(e.into()))?;

    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], body).into_response())
}
