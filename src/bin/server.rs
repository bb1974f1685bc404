//! catalog-strata HTTP server binary.
//!
//! Builds one [`Catalog`] from configuration, applies the configured init
//! sources and serves the HTTP surface over it.
//!
//! # Environment Variables
//!
//! - `PORT` - HTTP port (default: 8080)
//! - `CATALOG_CONFIG` - Path to a YAML or JSON `CatalogConfig` file (optional)
//! - `CATALOG_BASE_URL`, `CATALOG_SHARE_SERVICE_URL`, `CATALOG_STRICT_CONTEXT`
//!   - Override the matching config fields
//! - `RUST_LOG` - Tracing filter (default: "info,catalog_strata=debug")
//!
//! # Usage
//!
//! ```bash
//! CATALOG_CONFIG=config.yaml cargo run --bin server
//! ```

use std::path::Path;

use anyhow::Context;
use catalog_strata::server::{app_router, AppState};
use catalog_strata::{Catalog, CatalogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,catalog_strata=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let config = match std::env::var("CATALOG_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading configuration from {}", path);
            CatalogConfig::from_file(Path::new(&path)).with_context(|| format!("reading {}", path))?
        }
        Err(_) => CatalogConfig::default(),
    }
    .apply_env_overrides();

    let catalog = Catalog::new(config);
    catalog.queue_configured_init_sources();
    if let Err(e) = catalog.load_init_sources().await {
        // Partial failures leave every other source applied.
        tracing::warn!("Some init sources failed: {}", e);
    }
    tracing::info!("Catalog ready with {} models", catalog.models().len());

    let app = app_router(AppState::new(catalog));

    tracing::info!("catalog-strata server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health          - liveness probe");
    tracing::info!("  GET  /models/:id      - inspect a model");
    tracing::info!("  POST /models/:id/load - run a lifecycle phase");
    tracing::info!("  GET  /workbench       - workbench contents");
    tracing::info!("  POST /init            - apply init data");
    tracing::info!("  POST /share           - apply a share link");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
