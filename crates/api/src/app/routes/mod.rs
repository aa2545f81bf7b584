use axum::{Router, routing::get};

pub mod system;
pub mod tryon;
pub mod user;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/try-on", tryon::router())
        .route("/user/balance", get(user::balance))
}
