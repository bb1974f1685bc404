//! A live model: identity, type and stratum store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::catalog::Catalog;
use crate::error::{CatalogError, CatalogResult};
use crate::member::adapter::FormatAdapter;
use crate::member::lifecycle;
use crate::member::MapItem;
use crate::reactive::{Cell, Reactive};
use crate::reference::dereference;
use crate::strata::{AsyncLoader, LoadableStratum, StratumId, TraitBag};
use crate::traits::{resolver, ModelTypeDef, TraitDef};

use super::snapshot::ModelSnapshot;

/// One layer of a model's stratum store.
#[derive(Debug, Clone)]
pub enum Layer {
    /// Values written through [`Model::set_trait`]. Copy-on-write.
    Plain(Arc<TraitBag>),
    /// Values produced by a loader.
    Loadable(Arc<LoadableStratum>),
}

/// An addressable catalog entity.
///
/// Trait values live in priority-ordered strata; [`Model::get_trait`]
/// resolves them on every read, so the effective value never depends on the
/// order in which strata were written.
pub struct Model {
    id: String,
    def: Arc<ModelTypeDef>,
    runtime: Reactive,
    catalog: Weak<Catalog>,
    layers: RwLock<BTreeMap<StratumId, Layer>>,
    known_containers: RwLock<Vec<String>>,
    metadata: Option<Arc<LoadableStratum>>,
    map_items: Option<AsyncLoader<Arc<Vec<MapItem>>>>,
    reference: Option<AsyncLoader<Option<Arc<Model>>>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("type", &self.def.type_name())
            .field("strata", &self.layers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Model {
    /// Build a model. Loaders are wired from the adapter (if any) and, for
    /// reference types, the dereferencing loader.
    pub(crate) fn create(
        id: impl Into<String>,
        def: Arc<ModelTypeDef>,
        runtime: Reactive,
        catalog: Weak<Catalog>,
        adapter: Option<Arc<dyn FormatAdapter>>,
    ) -> Arc<Model> {
        let id = id.into();
        Arc::new_cyclic(|weak: &Weak<Model>| {
            let metadata = adapter.as_ref().map(|adapter| {
                Arc::new(LoadableStratum::new(
                    runtime.clone(),
                    &id,
                    StratumId::metadata(),
                    lifecycle::metadata_load_fn(id.clone(), weak.clone(), adapter.clone()),
                ))
            });
            let map_items = adapter.as_ref().filter(|_| def.is_mappable()).map(|adapter| {
                AsyncLoader::new(
                    runtime.clone(),
                    Cell::loader(&id, "mapItems"),
                    lifecycle::map_items_load_fn(id.clone(), weak.clone(), adapter.clone()),
                )
            });
            let reference = def.is_reference().then(|| {
                AsyncLoader::new(
                    runtime.clone(),
                    Cell::loader(&id, "reference"),
                    dereference::reference_load_fn(id.clone(), weak.clone()),
                )
            });

            let mut layers: BTreeMap<StratumId, Layer> = StratumId::FIXED
                .iter()
                .map(|id| (id.clone(), Layer::Plain(Arc::new(TraitBag::new()))))
                .collect();
            if let Some(stratum) = &metadata {
                layers.insert(stratum.id().clone(), Layer::Loadable(stratum.clone()));
            }

            Model {
                id,
                def,
                runtime,
                catalog,
                layers: RwLock::new(layers),
                known_containers: RwLock::new(Vec::new()),
                metadata,
                map_items,
                reference,
            }
        })
    }

    /// A model outside any catalog, without loaders.
    pub fn detached(id: impl Into<String>, def: Arc<ModelTypeDef>, runtime: Reactive) -> Arc<Model> {
        Self::create(id, def, runtime, Weak::new(), None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.def.type_name()
    }

    pub fn def(&self) -> &Arc<ModelTypeDef> {
        &self.def
    }

    pub fn runtime(&self) -> &Reactive {
        &self.runtime
    }

    /// The catalog this model belongs to, if it is still alive.
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.upgrade()
    }

    pub(crate) fn metadata_stratum(&self) -> Option<&Arc<LoadableStratum>> {
        self.metadata.as_ref()
    }

    pub(crate) fn map_items_loader(&self) -> Option<&AsyncLoader<Arc<Vec<MapItem>>>> {
        self.map_items.as_ref()
    }

    pub(crate) fn reference_loader(&self) -> Option<&AsyncLoader<Option<Arc<Model>>>> {
        self.reference.as_ref()
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Effective value of one trait.
    ///
    /// Unset traits read as `None`; undeclared names fail with
    /// [`CatalogError::UnknownTrait`]. Reading through a loadable stratum is a
    /// triggering access.
    pub fn get_trait(&self, name: &str) -> CatalogResult<Option<Value>> {
        let def = self.def.require_trait(name)?;
        self.runtime.report_observed(&Cell::strata(&self.id));
        let layers = self.layers_snapshot();

        if def.is_first_wins() {
            for (stratum, layer) in layers.iter().rev() {
                if let Some(value) = self.layer_value(stratum, layer, name)? {
                    return Ok(Some(value));
                }
            }
            return Ok(None);
        }

        let mut bottom_up = Vec::new();
        for (stratum, layer) in &layers {
            if let Some(value) = self.layer_value(stratum, layer, name)? {
                bottom_up.push(value);
            }
        }
        Ok(resolver::resolve(def, &bottom_up))
    }

    /// Effective value as a string, if set and a string.
    pub fn get_string(&self, name: &str) -> CatalogResult<Option<String>> {
        Ok(self
            .get_trait(name)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Effective value of a string array trait (empty when unset).
    pub fn get_string_list(&self, name: &str) -> CatalogResult<Vec<String>> {
        Ok(self
            .get_trait(name)?
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Display name, falling back to the id.
    pub fn name(&self) -> CatalogResult<String> {
        Ok(self.get_string("name")?.unwrap_or_else(|| self.id.clone()))
    }

    /// Effective value computed from cached data only. Never starts a load
    /// and never records a read.
    pub fn peek_trait(&self, name: &str) -> CatalogResult<Option<Value>> {
        let def = self.def.require_trait(name)?;
        let mut bottom_up = Vec::new();
        for layer in self.layers.read().values() {
            let value = match layer {
                Layer::Plain(bag) => bag.get(name).cloned(),
                Layer::Loadable(stratum) => stratum.peek().and_then(|bag| bag.get(name).cloned()),
            };
            bottom_up.extend(value);
        }
        Ok(resolver::resolve(def, &bottom_up))
    }

    /// Every set trait, resolved.
    pub fn effective_traits(&self) -> CatalogResult<Map<String, Value>> {
        let mut traits = Map::new();
        for def in self.def.traits() {
            if let Some(value) = self.get_trait(&def.name)? {
                traits.insert(def.name.clone(), value);
            }
        }
        Ok(traits)
    }

    fn layers_snapshot(&self) -> Vec<(StratumId, Layer)> {
        self.layers
            .read()
            .iter()
            .map(|(id, layer)| (id.clone(), layer.clone()))
            .collect()
    }

    fn layer_value(&self, stratum: &StratumId, layer: &Layer, name: &str) -> CatalogResult<Option<Value>> {
        match layer {
            Layer::Plain(bag) => {
                self.runtime
                    .report_observed(&Cell::trait_cell(&self.id, stratum, name));
                Ok(bag.get(name).cloned())
            }
            Layer::Loadable(loadable) => loadable.read_trait(name),
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Write one trait into one plain stratum. `null` clears it.
    pub fn set_trait(&self, stratum: &StratumId, name: &str, value: Value) -> CatalogResult<()> {
        let def = self.def.require_trait(name)?;
        def.validate(&value)?;
        if stratum.is_loaded() {
            return Err(CatalogError::ReadOnlyStratum(stratum.to_string()));
        }
        self.runtime
            .transaction(|| self.write_validated(stratum, def, value))
    }

    /// Write a whole bag of traits into one stratum in a single transaction.
    ///
    /// Every entry is attempted; failures are collected and returned together.
    /// With `replace` the stratum is cleared first.
    pub fn set_traits(&self, stratum: &StratumId, traits: &TraitBag, replace: bool) -> CatalogResult<()> {
        if stratum.is_loaded() {
            return Err(CatalogError::ReadOnlyStratum(stratum.to_string()));
        }
        self.runtime.transaction(|| {
            if replace {
                self.clear_stratum(stratum);
            }
            let errors = traits
                .iter()
                .filter_map(|(name, value)| self.set_trait(stratum, name, value.clone()).err())
                .collect();
            match CatalogError::combine(errors) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn write_validated(&self, stratum: &StratumId, def: &TraitDef, value: Value) -> CatalogResult<()> {
        let (changed, created) = {
            let mut layers = self.layers.write();
            let mut created = false;
            let layer = layers.entry(stratum.clone()).or_insert_with(|| {
                created = true;
                Layer::Plain(Arc::new(TraitBag::new()))
            });
            let Layer::Plain(bag) = layer else {
                return Err(CatalogError::ReadOnlyStratum(stratum.to_string()));
            };
            let changed = if value.is_null() {
                bag.contains_key(&def.name) && Arc::make_mut(bag).remove(&def.name).is_some()
            } else if bag.get(&def.name) == Some(&value) {
                false
            } else {
                Arc::make_mut(bag).insert(def.name.clone(), value);
                true
            };
            (changed, created)
        };
        if created {
            self.runtime.report_changed(&Cell::strata(&self.id));
        }
        if changed {
            self.runtime
                .report_changed(&Cell::trait_cell(&self.id, stratum, &def.name));
        }
        Ok(())
    }

    /// Remove every value from a plain stratum.
    pub fn clear_stratum(&self, stratum: &StratumId) {
        let cleared = {
            let mut layers = self.layers.write();
            match layers.get_mut(stratum) {
                Some(Layer::Plain(bag)) => std::mem::take(Arc::make_mut(bag)),
                _ => TraitBag::new(),
            }
        };
        for name in cleared.keys() {
            self.runtime
                .report_changed(&Cell::trait_cell(&self.id, stratum, name));
        }
    }

    /// Values held by one plain stratum, without recording a read.
    pub fn stratum(&self, stratum: &StratumId) -> Option<Arc<TraitBag>> {
        match self.layers.read().get(stratum) {
            Some(Layer::Plain(bag)) => Some(bag.clone()),
            _ => None,
        }
    }

    /// Ids of every stratum, bottom to top.
    pub fn strata_ids(&self) -> Vec<StratumId> {
        self.runtime.report_observed(&Cell::strata(&self.id));
        self.layers.read().keys().cloned().collect()
    }

    /// Non-empty plain strata, bottom to top, without recording a read.
    pub fn plain_strata(&self) -> BTreeMap<StratumId, TraitBag> {
        self.layers
            .read()
            .iter()
            .filter_map(|(id, layer)| match layer {
                Layer::Plain(bag) if !bag.is_empty() => Some((id.clone(), bag.as_ref().clone())),
                _ => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    /// Record a group known to contain this model.
    pub fn add_known_container(&self, container_id: &str) {
        let mut containers = self.known_containers.write();
        if !containers.iter().any(|c| c == container_id) {
            containers.push(container_id.to_string());
        }
    }

    pub fn known_containers(&self) -> Vec<String> {
        self.known_containers.read().clone()
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// One stratum in catalog description format: `id`, `type` and the
    /// stratum's trait values.
    pub fn to_description(&self, stratum: &StratumId) -> Value {
        let mut description = Map::new();
        description.insert("id".into(), Value::String(self.id.clone()));
        description.insert("type".into(), Value::String(self.type_name().to_string()));
        if let Some(bag) = self.stratum(stratum) {
            for (key, value) in bag.iter() {
                description.insert(key.clone(), value.clone());
            }
        }
        Value::Object(description)
    }

    /// Every plain stratum plus share keys, for saving and restoring.
    pub fn snapshot(&self) -> ModelSnapshot {
        let share_keys = self
            .catalog()
            .map(|catalog| catalog.models().share_keys_of(&self.id))
            .unwrap_or_default();
        ModelSnapshot {
            id: self.id.clone(),
            type_name: self.type_name().to_string(),
            share_keys,
            strata: self.plain_strata(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::IdProperty;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer_type() -> Arc<ModelTypeDef> {
        Arc::new(
            ModelTypeDef::new("test-layer")
                .mappable()
                .with_trait(TraitDef::number("opacity"))
                .with_trait(TraitDef::object("rectangle"))
                .with_trait(TraitDef::object_array("columns", IdProperty::Field("name".into()))),
        )
    }

    fn model() -> Arc<Model> {
        Model::detached("layer-1", layer_type(), Reactive::new(true))
    }

    #[test]
    fn test_unset_trait_is_none() {
        let m = model();
        assert_eq!(m.get_trait("opacity").unwrap(), None);
    }

    #[test]
    fn test_unknown_trait_is_error() {
        let m = model();
        assert!(matches!(
            m.get_trait("colour").unwrap_err(),
            CatalogError::UnknownTrait { .. }
        ));
        assert!(m.set_trait(&StratumId::User, "colour", json!("red")).is_err());
    }

    #[test]
    fn test_override_independent_of_write_order() {
        let orders: [[StratumId; 3]; 2] = [
            [StratumId::Underride, StratumId::Definition, StratumId::User],
            [StratumId::User, StratumId::Definition, StratumId::Underride],
        ];
        for order in orders {
            let m = model();
            for stratum in &order {
                m.set_trait(stratum, "name", json!(stratum.name())).unwrap();
            }
            assert_eq!(m.get_trait("name").unwrap(), Some(json!("user")));
        }
    }

    #[test]
    fn test_null_clears_stratum_value() {
        let m = model();
        m.set_trait(&StratumId::Definition, "opacity", json!(0.5)).unwrap();
        m.set_trait(&StratumId::User, "opacity", json!(0.8)).unwrap();
        m.set_trait(&StratumId::User, "opacity", Value::Null).unwrap();
        assert_eq!(m.get_trait("opacity").unwrap(), Some(json!(0.5)));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let m = model();
        let err = m.set_trait(&StratumId::User, "opacity", json!("high")).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidTraitValue { .. }));
    }

    #[test]
    fn test_loaded_stratum_is_read_only() {
        let m = model();
        let err = m
            .set_trait(&StratumId::metadata(), "name", json!("x"))
            .unwrap_err();
        assert_eq!(err, CatalogError::ReadOnlyStratum("metadata".into()));
    }

    #[test]
    fn test_merge_array_by_id_patch_through_model() {
        let m = model();
        m.set_trait(
            &StratumId::Definition,
            "columns",
            json!([{"name": "a", "title": "A"}, {"name": "b", "title": "B"}]),
        )
        .unwrap();
        m.set_trait(&StratumId::User, "columns", json!([{"name": "b", "units": "m"}]))
            .unwrap();
        assert_eq!(
            m.get_trait("columns").unwrap(),
            Some(json!([
                {"name": "a", "title": "A"},
                {"name": "b", "title": "B", "units": "m"}
            ]))
        );
    }

    #[test]
    fn test_object_traits_merge() {
        let m = model();
        m.set_trait(&StratumId::Definition, "rectangle", json!({"west": 1, "east": 2}))
            .unwrap();
        m.set_trait(&StratumId::User, "rectangle", json!({"east": 3})).unwrap();
        assert_eq!(
            m.get_trait("rectangle").unwrap(),
            Some(json!({"west": 1, "east": 3}))
        );
    }

    #[test]
    fn test_set_traits_batches_and_collects_errors() {
        let m = model();
        let runs = Arc::new(AtomicUsize::new(0));
        let (watched, counter) = (m.clone(), runs.clone());
        let _handle = m.runtime().autorun("watch-name", move || {
            let _ = watched.get_trait("name");
            let _ = watched.get_trait("opacity");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut bag = TraitBag::new();
        bag.insert("name".into(), json!("Roads"));
        bag.insert("opacity".into(), json!(0.3));
        bag.insert("bogus".into(), json!(1));
        let err = m.set_traits(&StratumId::Definition, &bag, false).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownTrait { .. }));

        assert_eq!(m.get_trait("name").unwrap(), Some(json!("Roads")));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reaction_reruns_when_new_stratum_defines_trait() {
        let m = model();
        m.set_trait(&StratumId::Definition, "name", json!("def")).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (watched, log) = (m.clone(), seen.clone());
        let _handle = m.runtime().autorun("watch-name", move || {
            log.lock().push(watched.get_trait("name").unwrap());
        });
        m.set_trait(&StratumId::User, "name", json!("user")).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![Some(json!("def")), Some(json!("user"))]
        );
    }

    #[test]
    fn test_replace_clears_stratum() {
        let m = model();
        m.set_trait(&StratumId::User, "opacity", json!(0.1)).unwrap();
        let mut bag = TraitBag::new();
        bag.insert("name".into(), json!("n"));
        m.set_traits(&StratumId::User, &bag, true).unwrap();
        assert_eq!(m.get_trait("opacity").unwrap(), None);
        assert_eq!(m.get_trait("name").unwrap(), Some(json!("n")));
    }

    #[test]
    fn test_to_description() {
        let m = model();
        m.set_trait(&StratumId::Definition, "name", json!("Roads")).unwrap();
        assert_eq!(
            m.to_description(&StratumId::Definition),
            json!({"id": "layer-1", "type": "test-layer", "name": "Roads"})
        );
    }
}
