// HTTP route handlers for the Sentinel API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use sentinel_common::redis;
use sentinel_common::types::{IntakeError, IntakePolicy, Language, ResourceLimits, Submission};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::language_config::LanguageRegistry;
use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    #[serde(default)]
    pub tenant: Option<String>,
    pub source_code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submission_id: Uuid,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Validate a request into the submission that gets queued
pub fn build_submission(
    payload: SubmitRequest,
    policy: &IntakePolicy,
    languages: &LanguageRegistry,
) -> Result<Submission, IntakeError> {
    let language: Language = payload.language.parse()?;
    if !languages.is_enabled(language) {
        return Err(IntakeError::UnknownLanguage(payload.language));
    }

    let mut submission = Submission::new(language, payload.source_code.into_bytes(), payload.limits);
    if let Some(tenant) = payload.tenant {
        submission.tenant = tenant;
    }
    if let Some(stdin) = payload.stdin {
        submission.stdin = stdin.into_bytes();
    }
    submission.accept(policy)
}

fn rejection_reason(err: &IntakeError) -> &'static str {
    match err {
        IntakeError::UnknownLanguage(_) => "unknown_language",
        IntakeError::EmptySource => "empty_source",
        IntakeError::SourceTooLarge { .. } | IntakeError::StdinTooLarge { .. } => "too_large",
        IntakeError::LimitAboveCeiling { .. } => "limit_above_ceiling",
        IntakeError::InvalidTenant(_) => "invalid_tenant",
    }
}

/// POST /submissions - Validate and queue a submission
pub async fn submit(State(state): State<Arc<AppState>>, Json(payload): Json<SubmitRequest>) -> Response {
    let submission = match build_submission(payload, &state.policy, &state.languages) {
        Ok(submission) => submission,
        Err(e) => {
            metrics::SUBMISSIONS_REJECTED.with_label_values(&[rejection_reason(&e)]).inc();
            warn!(error = %e, "Submission rejected");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let mut conn = state.redis.clone();
    match redis::push_submission(&mut conn, &submission, state.result_ttl_secs).await {
        Ok(()) => {
            metrics::SUBMISSIONS_ACCEPTED
                .with_label_values(&[submission.language.as_str()])
                .inc();
            info!(
                submission_id = %submission.id,
                language = %submission.language,
                tenant = %submission.tenant,
                source_size = submission.source.len(),
                "Submission queued"
            );
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    submission_id: submission.id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(submission_id = %submission.id, error = %e, "Failed to queue submission");
            error_response(StatusCode::SERVICE_UNAVAILABLE, format!("Failed to queue submission: {}", e))
        }
    }
}

/// GET /submissions/{id} - Query a submission's outcome
pub async fn get_submission(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(submission_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid submission ID format");
    };

    let mut conn = state.redis.clone();
    match redis::get_record(&mut conn, &submission_id).await {
        Ok(Some(record)) => return (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => {}
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to fetch submission record");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query submission: {}", e));
        }
    }

    match redis::get_status(&mut conn, &submission_id).await {
        Ok(Some(status)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "submission_id": submission_id,
                "status": status,
            })),
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Unknown or expired submission"),
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to fetch submission status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query submission: {}", e))
        }
    }
}

/// DELETE /submissions/{id} - Ask the worker to stop a submission
pub async fn cancel_submission(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(submission_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid submission ID format");
    };

    let mut conn = state.redis.clone();
    match redis::get_status(&mut conn, &submission_id).await {
        Ok(Some(sentinel_common::types::SubmissionStatus::Finished)) => {
            return error_response(StatusCode::CONFLICT, "Submission already finished");
        }
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Unknown or expired submission"),
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to fetch submission status");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query submission: {}", e));
        }
    }

    match redis::request_cancel(&mut conn, &submission_id, state.result_ttl_secs).await {
        Ok(()) => {
            metrics::CANCELLATIONS.inc();
            info!(submission_id = %submission_id, "Cancellation requested");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "submission_id": submission_id, "cancel_requested": true })),
            )
                .into_response()
        }
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to record cancellation");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to cancel submission: {}", e))
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_endpoint() -> Response {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
