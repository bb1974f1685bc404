//! The catalog root object.
//!
//! A [`Catalog`] owns one reactive runtime, the trait and adapter registries,
//! the model registry and the view state (workbench, timeline, cameras,
//! settings). It is created explicitly and torn down explicitly; several
//! catalogs in one process never share state.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::init::InitSource;
use crate::member::AdapterRegistry;
use crate::model::json::{restore_snapshot, update_model_from_json, upsert_model_from_json};
use crate::model::{Model, ModelSnapshot};
use crate::reactive::{Cell, ReactionHandle, Reactive};
use crate::registry::ModelRegistry;
use crate::strata::StratumId;
use crate::traits::{TraitRegistry, GROUP_TYPE};

/// Id of the root group every init source's `catalog` entries join.
pub const ROOT_ID: &str = "/";

/// Application state outside the model tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    /// Ids of the models shown on the map, in order.
    pub workbench: Vec<String>,
    /// Workbench ids that also appear on the timeline.
    pub timeline: Vec<String>,
    pub settings: Map<String, Value>,
    pub initial_camera: Option<Value>,
    pub home_camera: Option<Value>,
    pub cors_domains: Vec<String>,
    pub previewed_item_id: Option<String>,
    pub viewer_mode: Option<String>,
    pub show_splitter: bool,
    pub split_position: Option<f64>,
    /// Unrecognised `key=value` pairs from share links.
    pub user_properties: BTreeMap<String, String>,
}

pub struct Catalog {
    this: Weak<Catalog>,
    config: CatalogConfig,
    runtime: Reactive,
    traits: TraitRegistry,
    adapters: AdapterRegistry,
    models: ModelRegistry,
    fetcher: Arc<dyn Fetcher>,
    view: RwLock<ViewState>,
    resolving: Mutex<HashSet<String>>,
    init_queue: Mutex<Vec<InitSource>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("models", &self.models)
            .field("adapters", &self.adapters)
            .field("workbench", &self.view.read().workbench)
            .finish()
    }
}

impl Catalog {
    /// Create a catalog fetching over HTTP and the local filesystem.
    pub fn new(config: CatalogConfig) -> Arc<Catalog> {
        let fetcher = Arc::new(HttpFetcher::from_config(&config));
        Self::with_fetcher(config, fetcher)
    }

    /// Create a catalog with an explicit fetcher.
    pub fn with_fetcher(config: CatalogConfig, fetcher: Arc<dyn Fetcher>) -> Arc<Catalog> {
        let runtime = Reactive::new(config.strict_reactive_context);
        let traits = TraitRegistry::with_defaults();
        for dir in &config.model_type_dirs {
            match traits.load_directory(dir) {
                Ok(count) => log::debug!("Loaded {} model types from {}", count, dir.display()),
                Err(e) => log::warn!("Failed to load model types from {}: {}", dir.display(), e),
            }
        }

        let catalog = Arc::new_cyclic(|this| Catalog {
            this: this.clone(),
            models: ModelRegistry::new(runtime.clone()),
            runtime,
            traits,
            adapters: AdapterRegistry::new(),
            fetcher,
            view: RwLock::new(ViewState::default()),
            resolving: Mutex::new(HashSet::new()),
            init_queue: Mutex::new(Vec::new()),
            config,
        });
        catalog.install_root();
        catalog
    }

    fn install_root(&self) {
        let root = self
            .create_model(GROUP_TYPE, ROOT_ID)
            .and_then(|root| {
                root.set_trait(&StratumId::Underride, "name", json!("Root Group"))?;
                self.models.register(root)
            });
        if let Err(e) = root {
            log::error!("Failed to create the root group: {}", e);
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Reactive {
        &self.runtime
    }

    pub fn traits(&self) -> &TraitRegistry {
        &self.traits
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub(crate) fn resolving(&self) -> &Mutex<HashSet<String>> {
        &self.resolving
    }

    pub(crate) fn init_queue(&self) -> &Mutex<Vec<InitSource>> {
        &self.init_queue
    }

    /// The root group.
    pub fn root(&self) -> Option<Arc<Model>> {
        self.models.get_by_id(ROOT_ID, None)
    }

    /// Build an unregistered model of a registered type, wired to this
    /// catalog and to the type's adapter.
    pub fn create_model(&self, type_name: &str, id: &str) -> CatalogResult<Arc<Model>> {
        let def = self.traits.get(type_name)?;
        let adapter = self.adapters.get(type_name);
        Ok(Model::create(id, def, self.runtime.clone(), self.this.clone(), adapter))
    }

    // -----------------------------------------------------------------------
    // Descriptions
    // -----------------------------------------------------------------------

    /// See [`upsert_model_from_json`].
    pub fn upsert_model_from_json(
        &self,
        stratum: &StratumId,
        json: &Value,
        parent_id: Option<&str>,
        replace: bool,
    ) -> CatalogResult<Arc<Model>> {
        upsert_model_from_json(self, stratum, json, parent_id, replace)
    }

    /// See [`update_model_from_json`].
    pub fn update_model_from_json(
        &self,
        model: &Arc<Model>,
        stratum: &StratumId,
        json: &Value,
        replace: bool,
    ) -> CatalogResult<()> {
        update_model_from_json(self, model, stratum, json, replace)
    }

    /// See [`restore_snapshot`].
    pub fn restore_snapshot(&self, snapshot: &ModelSnapshot) -> CatalogResult<Arc<Model>> {
        restore_snapshot(self, snapshot)
    }

    /// Snapshots of every registered model, sorted by id.
    pub fn snapshot_models(&self) -> Vec<ModelSnapshot> {
        self.models
            .ids()
            .iter()
            .filter_map(|id| self.models.get_by_id(id, None))
            .map(|model| model.snapshot())
            .collect()
    }

    /// Remove a model from the registry, the workbench and the timeline.
    pub fn remove_model(&self, id: &str) -> Option<Arc<Model>> {
        let removed = self.models.remove(id)?;
        self.update_view(|view| {
            view.workbench.retain(|item| item != id);
            view.timeline.retain(|item| item != id);
            if view.previewed_item_id.as_deref() == Some(id) {
                view.previewed_item_id = None;
            }
        });
        self.runtime.forget_owner(id);
        log::debug!("Removed model `{}`", id);
        Some(removed)
    }

    // -----------------------------------------------------------------------
    // View state
    // -----------------------------------------------------------------------

    /// Current view state. Observed.
    pub fn view(&self) -> ViewState {
        self.runtime.report_observed(&Cell::View);
        self.view.read().clone()
    }

    /// Mutate the view state and notify observers once.
    pub fn update_view<R>(&self, f: impl FnOnce(&mut ViewState) -> R) -> R {
        let (result, changed) = {
            let mut view = self.view.write();
            let before = view.clone();
            let result = f(&mut view);
            (result, *view != before)
        };
        if changed {
            self.runtime.report_changed(&Cell::View);
        }
        result
    }

    /// Ids on the workbench. Observed.
    pub fn workbench_ids(&self) -> Vec<String> {
        self.runtime.report_observed(&Cell::View);
        self.view.read().workbench.clone()
    }

    /// Registered models on the workbench, in order.
    pub fn workbench_models(&self) -> Vec<Arc<Model>> {
        self.workbench_ids()
            .iter()
            .filter_map(|id| self.models.get_by_id_or_share_key(id, None))
            .collect()
    }

    /// Put a model on the workbench and load its map items.
    ///
    /// References are dereferenced first and their target is loaded. The
    /// item stays on the workbench when loading fails; the failure is
    /// returned and retained on the model.
    pub async fn add_to_workbench(&self, model: &Arc<Model>) -> CatalogResult<()> {
        self.update_view(|view| {
            if !view.workbench.iter().any(|id| id == model.id()) {
                view.workbench.push(model.id().to_string());
            }
        });
        let item = self.workbench_item(model).await?;
        item.load_map_items().await
    }

    /// The model whose map items a workbench entry shows.
    pub(crate) async fn workbench_item(&self, model: &Arc<Model>) -> CatalogResult<Arc<Model>> {
        if !model.def().is_reference() {
            return Ok(model.clone());
        }
        model.load_reference().await?;
        model
            .target()
            .ok_or_else(|| CatalogError::dereference(model.id(), "no target after loading"))
    }

    /// Take a model off the workbench and the timeline.
    pub fn remove_from_workbench(&self, id: &str) -> bool {
        self.update_view(|view| {
            let before = view.workbench.len();
            view.workbench.retain(|item| item != id);
            view.timeline.retain(|item| item != id);
            view.workbench.len() != before
        })
    }

    // -----------------------------------------------------------------------
    // Reactive helpers
    // -----------------------------------------------------------------------

    /// See [`Reactive::autorun`].
    pub fn autorun(&self, name: impl Into<String>, f: impl Fn() + Send + Sync + 'static) -> ReactionHandle {
        self.runtime.autorun(name, f)
    }

    /// See [`Reactive::transaction`].
    pub fn transaction<R>(&self, f: impl FnOnce() -> R) -> R {
        self.runtime.transaction(f)
    }

    /// Dispose every reaction and drop every model and queued init source.
    pub fn teardown(&self) {
        self.runtime.teardown();
        self.init_queue.lock().clear();
        self.models.clear();
        *self.view.write() = ViewState::default();
        log::debug!("Catalog torn down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
