//! FormatAdapter trait: the contract for per-format data adapters.
//!
//! Adapters produce a model's `metadata` stratum and its map items. They read
//! and write traits only through the model's trait accessors, never by
//! reaching into strata directly.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use super::MapItem;
use crate::error::{CatalogError, CatalogResult};
use crate::fetch::Fetcher;
use crate::model::Model;
use crate::strata::{LoadFuture, TraitBag};

/// A per-format adapter.
///
/// Each load method is split in two. The synchronous part runs inside a
/// tracking frame: every trait it reads becomes an input of the load, so
/// changing e.g. `url` later reloads automatically. The returned future does
/// the I/O and is not tracked.
pub trait FormatAdapter: Send + Sync {
    /// Model type tag this adapter serves.
    fn model_type(&self) -> &str;

    /// Whether map items can only be loaded after metadata.
    fn metadata_required(&self) -> bool {
        true
    }

    /// Produce the `metadata` stratum.
    fn load_metadata(&self, _model: &Arc<Model>) -> CatalogResult<LoadFuture<TraitBag>> {
        Ok(futures::future::ready(Ok(TraitBag::new())).boxed())
    }

    /// Produce renderable output.
    fn load_map_items(&self, model: &Arc<Model>) -> CatalogResult<LoadFuture<Vec<MapItem>>>;
}

/// Adapters by model type.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn FormatAdapter>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for its model type. Models created afterwards use it.
    pub fn register(&self, adapter: Arc<dyn FormatAdapter>) {
        self.adapters
            .write()
            .insert(adapter.model_type().to_string(), adapter);
    }

    pub fn get(&self, model_type: &str) -> Option<Arc<dyn FormatAdapter>> {
        self.adapters.read().get(model_type).cloned()
    }

    /// Registered model types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.read().keys().cloned().collect();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// JsonAdapter
// ---------------------------------------------------------------------------

/// Generic adapter for JSON documents.
///
/// Fetches the model's `url`. Metadata is taken from the document's
/// `metadata` object (only declared traits with valid values); the whole
/// document becomes a single map item of kind `json`.
pub struct JsonAdapter {
    model_type: String,
    fetcher: Arc<dyn Fetcher>,
}

impl JsonAdapter {
    pub fn new(model_type: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            model_type: model_type.into(),
            fetcher,
        }
    }

    fn url(model: &Model, phase: &str) -> CatalogResult<String> {
        model
            .get_string("url")?
            .ok_or_else(|| CatalogError::load(model.id(), phase, "no `url` set"))
    }
}

impl FormatAdapter for JsonAdapter {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn load_metadata(&self, model: &Arc<Model>) -> CatalogResult<LoadFuture<TraitBag>> {
        let url = Self::url(model, "metadata")?;
        let fetcher = self.fetcher.clone();
        let def = model.def().clone();
        Ok(async move {
            let document = fetcher.fetch_json(&url).await?;
            let mut bag = TraitBag::new();
            if let Some(Value::Object(metadata)) = document.get("metadata") {
                for (name, value) in metadata {
                    let valid = def
                        .trait_def(name)
                        .map_or(false, |trait_def| trait_def.validate(value).is_ok());
                    if valid {
                        bag.insert(name.clone(), value.clone());
                    } else {
                        log::debug!("Ignoring metadata key `{}` from {}", name, url);
                    }
                }
            }
            Ok(bag)
        }
        .boxed())
    }

    fn load_map_items(&self, model: &Arc<Model>) -> CatalogResult<LoadFuture<Vec<MapItem>>> {
        let url = Self::url(model, "mapItems")?;
        let fetcher = self.fetcher.clone();
        Ok(async move {
            let document = fetcher.fetch_json(&url).await?;
            Ok(vec![MapItem::new("json", document)])
        }
        .boxed())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
