//! HTTP surface over one [`Catalog`](crate::catalog::Catalog).
//!
//! Exposes model inspection, phase loading, the workbench and init/share
//! application to tools that cannot link the library directly:
//!
//! - `GET  /health`          - Liveness probe
//! - `GET  /models/:id`      - Inspect a model by id or share key
//! - `POST /models/:id/load` - Run a lifecycle phase
//! - `GET  /workbench`       - Workbench contents
//! - `POST /init`            - Apply init data
//! - `POST /share`           - Apply a share link

pub mod routes;

pub use routes::{app_router, AppState};
