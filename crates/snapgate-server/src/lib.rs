use std::sync::Arc;

use anyhow::{Context, Result};
use snapgate_core::AdmissionGate;

pub mod config;
pub mod fs_store;
pub mod http_server;
pub mod renderer;

use crate::config::ServerConfig;
use crate::fs_store::FsBlobStore;
use crate::renderer::HttpRenderer;

/// Wire the filesystem store, the HTTP renderer and the gate, then serve.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let ServerConfig {
        host,
        port,
        cors_origin,
        store_dir,
        renderer,
        gate,
    } = config;

    tokio::fs::create_dir_all(&store_dir)
        .await
        .with_context(|| format!("Failed to create store directory {}", store_dir.display()))?;

    if gate.secret.is_some() {
        tracing::info!("signed requests required on cache miss");
    } else {
        tracing::warn!("no secret configured; cache misses are admitted without a signature");
    }
    tracing::info!(
        "objects stored under {} with prefix '{}'",
        store_dir.display(),
        gate.key_prefix
    );

    let renderer = HttpRenderer::new(&renderer).context("Failed to initialise renderer client")?;
    let store = Arc::new(FsBlobStore::new(store_dir));
    let gate = AdmissionGate::new(gate, store);

    http_server::run_http_server(&host, port, gate, Arc::new(renderer), &cors_origin).await
}
