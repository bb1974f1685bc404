//! # catalog-strata
//!
//! Core of a geospatial data catalog: a layered trait model, single-flight
//! reactive loading and share-key identity.
//!
//! Every catalog item is a [`Model`] whose traits are resolved across
//! priority-ordered strata (underride, loader-produced layers, definition,
//! user, override). Loader-produced strata fill themselves on first read
//! inside a reactive context and reload when the traits they read change.
//! A [`Catalog`] owns the trait and adapter registries, the model registry
//! with its share keys, and the workbench/view state that init sources and
//! share links write into.
//!
//! ```no_run
//! use catalog_strata::{Catalog, CatalogConfig, StratumId};
//! use serde_json::json;
//!
//! # async fn run() -> catalog_strata::CatalogResult<()> {
//! let catalog = Catalog::new(CatalogConfig::default());
//! let parks = catalog.upsert_model_from_json(
//!     &StratumId::Definition,
//!     &json!({"id": "parks", "type": "group", "name": "Parks"}),
//!     None,
//!     false,
//! )?;
//! parks.set_trait(&StratumId::User, "name", json!("My Parks"))?;
//! assert_eq!(catalog.runtime().observe(|| parks.name())?, "My Parks");
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod init;
pub mod member;
pub mod model;
pub mod reactive;
pub mod reference;
pub mod registry;
pub mod server;
pub mod strata;
pub mod traits;

pub use catalog::{Catalog, ViewState, ROOT_ID};
pub use config::CatalogConfig;
pub use error::{AggregateLoadError, CatalogError, CatalogResult};
pub use fetch::{Fetcher, HttpFetcher, MemoryFetcher};
pub use init::{InitData, InitSource, ShareData};
pub use member::lifecycle::load_phase_all;
pub use member::{AdapterRegistry, FormatAdapter, MapItem, Phase, PhaseStatus};
pub use model::{Model, ModelDescription, ModelSnapshot};
pub use reactive::{ReactionHandle, Reactive};
pub use registry::ModelRegistry;
pub use strata::{AsyncLoader, LoadableStratum, StratumId, TraitBag};
pub use traits::{ModelTypeDef, TraitDef, TraitRegistry, TraitType};

/// Crate version reported by the HTTP surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
