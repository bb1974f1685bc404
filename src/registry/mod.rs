//! Model Registry: every live model of one catalog, by id and by share key.
//!
//! A share key is a historical id a model still answers to, so that share
//! links and saved state keep working after entries are renamed or moved.
//! Resolving a share key never creates a model; it redirects to the model
//! currently registered under the key's target id, or to nothing.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{CatalogError, CatalogResult};
use crate::model::Model;
use crate::reactive::{Cell, Reactive};

/// Table of live models.
pub struct ModelRegistry {
    runtime: Reactive,
    models: DashMap<String, Arc<Model>>,
    /// share key -> model id
    share_keys: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.len())
            .field("share_keys", &self.share_keys.read().len())
            .finish()
    }
}

impl ModelRegistry {
    pub fn new(runtime: Reactive) -> Self {
        Self {
            runtime,
            models: DashMap::new(),
            share_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Add a model. Fails if the id is taken.
    pub fn register(&self, model: Arc<Model>) -> CatalogResult<()> {
        match self.models.entry(model.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CatalogError::DuplicateModel(model.id().to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(model);
            }
        }
        self.runtime.report_changed(&Cell::Registry);
        Ok(())
    }

    /// Look up by primary id, optionally requiring a type.
    pub fn get_by_id(&self, id: &str, type_name: Option<&str>) -> Option<Arc<Model>> {
        self.runtime.report_observed(&Cell::Registry);
        let model = self.models.get(id).map(|entry| entry.value().clone())?;
        type_matches(&model, type_name).then_some(model)
    }

    /// Look up by primary id, then by share key.
    pub fn get_by_id_or_share_key(&self, id_or_key: &str, type_name: Option<&str>) -> Option<Arc<Model>> {
        if let Some(model) = self.get_by_id(id_or_key, type_name) {
            return Some(model);
        }
        let target = self.share_keys.read().get(id_or_key).cloned()?;
        let model = self.models.get(&target).map(|entry| entry.value().clone())?;
        if !type_matches(&model, type_name) {
            return None;
        }
        log::debug!("Share key `{}` resolved to `{}`", id_or_key, target);
        Some(model)
    }

    /// Id a share key currently points at.
    pub fn model_id_by_share_key(&self, key: &str) -> Option<String> {
        self.runtime.report_observed(&Cell::Registry);
        self.share_keys.read().get(key).cloned()
    }

    /// Associate `key` with `model_id`.
    ///
    /// If the key already aliases a different model, the newer registration
    /// wins and the superseded alias is dropped. A key equal to the model's
    /// own id is ignored.
    pub fn add_share_key(&self, model_id: &str, key: &str) {
        if key == model_id {
            return;
        }
        let previous = self
            .share_keys
            .write()
            .insert(key.to_string(), model_id.to_string());
        match previous {
            Some(previous) if previous == model_id => return,
            Some(previous) => log::warn!(
                "Share key `{}` moved from `{}` to `{}`",
                key,
                previous,
                model_id
            ),
            None => {}
        }
        if self.models.contains_key(key) {
            log::warn!(
                "Share key `{}` shadows a live model id; id lookups take precedence",
                key
            );
        }
        self.runtime.report_changed(&Cell::Registry);
    }

    /// Every share key pointing at `model_id`, sorted.
    pub fn share_keys_of(&self, model_id: &str) -> Vec<String> {
        self.runtime.report_observed(&Cell::Registry);
        let mut keys: Vec<String> = self
            .share_keys
            .read()
            .iter()
            .filter(|(_, target)| target.as_str() == model_id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove a model and every share key pointing at it.
    pub fn remove(&self, model_id: &str) -> Option<Arc<Model>> {
        let removed = self.models.remove(model_id).map(|(_, model)| model)?;
        self.share_keys
            .write()
            .retain(|_, target| target.as_str() != model_id);
        self.runtime.report_changed(&Cell::Registry);
        Some(removed)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.runtime.report_observed(&Cell::Registry);
        self.models.contains_key(model_id)
    }

    /// Every registered id, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.runtime.report_observed(&Cell::Registry);
        let mut ids: Vec<String> = self.models.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Drop every model and share key.
    pub fn clear(&self) {
        self.models.clear();
        self.share_keys.write().clear();
        self.runtime.report_changed(&Cell::Registry);
    }
}

fn type_matches(model: &Model, type_name: Option<&str>) -> bool {
    type_name.map_or(true, |t| model.type_name() == t)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
