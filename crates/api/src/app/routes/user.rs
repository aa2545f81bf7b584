use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};
use chrono::Utc;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::UserContext;

pub async fn balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.tryon.balance(user.user_id(), Utc::now()).await {
        Ok(figures) => Json(figures).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
