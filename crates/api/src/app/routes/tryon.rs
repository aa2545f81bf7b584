use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Multipart, Path},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use tracing::debug;

use tryon_core::{TaskId, TaskStatus};

use crate::app::dto::{self, FormError, PendingTasksResponse};
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit))
        .route("/pending", get(pending))
        .route("/:id", get(poll))
}

pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    form: Multipart,
) -> axum::response::Response {
    let submission = match dto::read_submission(user.user_id(), form).await {
        Ok(s) => s,
        Err(FormError::Domain(e)) => return errors::domain_error_to_response(e),
        Err(FormError::Multipart(e)) => {
            debug!(error = %e, "unreadable multipart body");
            return errors::json_error(e.status(), "invalid_form", e.body_text());
        }
    };

    let receipt = match services.tryon.submit(submission).await {
        Ok(r) => r,
        Err(e) => return errors::service_error_to_response(e),
    };

    if receipt.status == TaskStatus::Processing {
        let retry_after = services.poll.interval.as_secs().max(1);
        let mut response = (StatusCode::ACCEPTED, Json(receipt)).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }
    (StatusCode::OK, Json(receipt)).into_response()
}

pub async fn poll(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let task_id: TaskId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.tryon.poll(user.user_id(), task_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn pending(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.tryon.pending_tasks(user.user_id(), Utc::now()).await {
        Ok(tasks) => Json(PendingTasksResponse { tasks }).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
