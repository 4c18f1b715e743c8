//! publix-server binary.
//!
//! Environment: the `PUBLIX_*` engine keys, `PUBLIX_SEED_FILE` (JSON with
//! studies, components, batches and pre-provisioned workers) and
//! `PUBLIX_SERVER_ADDR`.

use std::sync::Arc;

use anyhow::Context;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use publix_kernel::{InMemoryPublixStore, PublixStore, StoreSeed};
use publix_runtime::{Publix, PublixConfig};
use publix_server::{build_router, PublixApiState};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Headroom over the largest accepted payload for headers and framing.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status":"ok"})))
}

fn load_seed() -> anyhow::Result<StoreSeed> {
    match std::env::var("PUBLIX_SEED_FILE") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read seed file {}", path))?;
            StoreSeed::from_json(&raw).with_context(|| format!("parse seed file {}", path))
        }
        Err(_) => Ok(StoreSeed::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,publix_runtime=info,publix_server=info")),
        )
        .init();

    let config = PublixConfig::from_env().map_err(anyhow::Error::msg)?;
    if config.token_secret.is_none() {
        tracing::warn!("PUBLIX_TOKEN_SECRET is unset; identity tokens won't survive a restart");
    }
    let seed = load_seed()?;
    tracing::info!(
        studies = seed.studies.len(),
        batches = seed.batches.len(),
        "store seeded"
    );
    let body_limit = config
        .result_data_max_size
        .max(usize::try_from(config.uploads.max_file_size).unwrap_or(usize::MAX))
        .saturating_add(BODY_LIMIT_SLACK);

    let store: Arc<dyn PublixStore> = Arc::new(InMemoryPublixStore::from_seed(seed));
    let publix = Publix::builder(store)
        .config(config)
        .build()
        .context("build publix engine")?;
    let state = PublixApiState::new(Arc::new(publix)).with_body_limit(body_limit);

    let addr = std::env::var("PUBLIX_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".into());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(build_router(state));

    tracing::info!(%addr, "publix server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
