use crate::RouterState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use common::config::Configuration;
use common::model::{ContextEntityType, DeleteMode};
use guard::SkipReason;
use serde::Deserialize;
use serde_json::{Value, json};

/// Operator credential required for `mode=hard`.
pub const HARD_DELETE_HEADER: &str = "x-hard-delete-key";

/// Create context entity routes
pub fn router<S: RouterState>() -> Router<S> {
    Router::new()
        .route("/:entity_type/bulk-delete", post(bulk_delete::<S>))
        .route("/:entity_type/:id", delete(delete_entity::<S>))
        .route("/:entity_type/:id/usage", get(entity_usage::<S>))
}

#[derive(Debug, Default, Deserialize)]
pub struct ModeParams {
    mode: Option<String>,
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "message": message.into()
        })),
    )
        .into_response()
}

/// Requested delete mode, refusing hard delete without the configured credential.
fn resolve_mode(
    config: &Configuration,
    params: &ModeParams,
    headers: &HeaderMap,
) -> Result<DeleteMode, Response> {
    let mode = match params.mode.as_deref() {
        None => DeleteMode::default(),
        Some(raw) => raw
            .parse::<DeleteMode>()
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_mode", e))?,
    };

    if mode == DeleteMode::Hard {
        let Some(expected) = config.guard.hard_delete_key.as_deref() else {
            return Err(error_response(
                StatusCode::FORBIDDEN,
                "hard_delete_disabled",
                "hard delete is not enabled on this service",
            ));
        };
        let supplied = headers
            .get(HARD_DELETE_HEADER)
            .and_then(|value| value.to_str().ok());
        if supplied != Some(expected) {
            return Err(error_response(
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("hard delete requires a valid {HARD_DELETE_HEADER} header"),
            ));
        }
    }

    Ok(mode)
}

fn parse_target(entity_type: &str, id: &str) -> Result<(ContextEntityType, i64), Response> {
    let entity_type = entity_type
        .parse::<ContextEntityType>()
        .map_err(|e| {
            error_response(
                StatusCode::BAD_REQUEST,
                "unsupported_entity_type",
                e.to_string(),
            )
        })?;
    let id = id.trim().parse::<i64>().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("'{id}' is not an integer id"),
        )
    })?;
    Ok((entity_type, id))
}

/// POST /:entity_type/bulk-delete?mode=soft|hard
///
/// Body `{"ids": [...]}`. Answers `{deleted, skipped}` with every distinct id in exactly
/// one of the two.
#[tracing::instrument(skip(state, headers, body))]
pub async fn bulk_delete<S: RouterState>(
    state: State<S>,
    Path(entity_type): Path<String>,
    Query(params): Query<ModeParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mode = match resolve_mode(state.config(), &params, &headers) {
        Ok(mode) => mode,
        Err(response) => return response,
    };

    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                format!("request body is not valid JSON: {e}"),
            );
        }
    };

    let request = match state.guard().parse_request(&entity_type, &body) {
        Ok(request) => request,
        Err(e) if e.is_too_large() => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "too_many_ids", e.to_string());
        }
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_request", e.to_string()),
    };

    let outcome = state.guard().execute(&request, mode).await;
    (StatusCode::OK, Json(outcome)).into_response()
}

/// DELETE /:entity_type/:id?mode=soft|hard
///
/// Single-id delete through the same probe-then-commit path as bulk delete.
#[tracing::instrument(skip(state, headers))]
pub async fn delete_entity<S: RouterState>(
    state: State<S>,
    Path((entity_type, id)): Path<(String, String)>,
    Query(params): Query<ModeParams>,
    headers: HeaderMap,
) -> Response {
    let (entity_type, id) = match parse_target(&entity_type, &id) {
        Ok(target) => target,
        Err(response) => return response,
    };
    let mode = match resolve_mode(state.config(), &params, &headers) {
        Ok(mode) => mode,
        Err(response) => return response,
    };

    match state.guard().delete_one(entity_type, id, mode).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(reason) => {
            let (status, error) = match &reason {
                SkipReason::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                SkipReason::InUse(_) => (StatusCode::CONFLICT, "in_use"),
                SkipReason::VerificationFailed(_) | SkipReason::ProbeFailed => {
                    (StatusCode::SERVICE_UNAVAILABLE, "verification_failed")
                }
                SkipReason::LoadFailed(_) | SkipReason::DeleteFailed(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            };
            error_response(status, error, reason.to_string())
        }
    }
}

/// GET /:entity_type/:id/usage
///
/// Usage check offered to peers: the probe result for a live entity.
#[tracing::instrument(skip(state))]
pub async fn entity_usage<S: RouterState>(
    state: State<S>,
    Path((entity_type, id)): Path<(String, String)>,
) -> Response {
    let (entity_type, id) = match parse_target(&entity_type, &id) {
        Ok(target) => target,
        Err(response) => return response,
    };

    match state.catalog().get_entity(entity_type, id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{entity_type} {id} not found"),
            );
        }
        Err(e) => {
            log::error!("Failed to load {entity_type} {id}: {e}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                e.to_string(),
            );
        }
    }

    match state.guard().checker().probe(entity_type, id).await {
        Ok(usage) => (StatusCode::OK, Json(usage)).into_response(),
        Err(e) => {
            log::error!("Usage probe for {entity_type} {id} failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}
