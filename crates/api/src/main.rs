use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use tryon_api::app::{self, services::AppServices};
use tryon_infra::bootstrap::Runtime;
use tryon_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tryon_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
        warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let bind_addr = config.bind_addr.clone();
    let max_upload_bytes = config.request.max_upload_bytes;

    let runtime = Runtime::from_config(config).await.context("failed to start services")?;
    let services = Arc::new(AppServices::new(runtime.service, max_upload_bytes));
    let app = app::build_app(jwt_secret, services);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
