use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use tryon_core::DomainError;
use tryon_infra::gateway::SubmitError;
use tryon_infra::service::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Submit(SubmitError::Domain(e)) | ServiceError::Domain(e) => domain_error_to_response(e),
        ServiceError::Submit(SubmitError::Store(e)) | ServiceError::Store(e) => {
            error!(error = %e, "record store failure");
            internal_error()
        }
        ServiceError::Submit(SubmitError::Blob(e)) => {
            error!(error = %e, "object store failure");
            internal_error()
        }
        ServiceError::PollTimedOut { task_id, attempts } => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "still_processing",
            format!("task {task_id} still processing after {attempts} checks"),
        ),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::QuotaExhausted(msg) => json_error(StatusCode::FORBIDDEN, "quota_exhausted", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::InvariantViolation(msg) => {
            error!(%msg, "invariant violated on request path");
            internal_error()
        }
    }
}

fn internal_error() -> axum::response::Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Something went wrong. Please try again.",
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
