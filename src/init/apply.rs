//! Applying init data onto a catalog, one source at a time.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Map, Value};

use super::{InitData, InitSource};
use crate::catalog::Catalog;
use crate::error::{CatalogError, CatalogResult};
use crate::model::Model;
use crate::strata::StratumId;

impl Catalog {
    /// Add a source to the end of the queue.
    pub fn queue_init_source(&self, source: InitSource) {
        log::debug!("Queued init source {}", source.name());
        self.init_queue().lock().push(source);
    }

    /// Queue every `initializationUrls` entry of the configuration.
    pub fn queue_configured_init_sources(&self) {
        let sources: Vec<InitSource> = self
            .config()
            .initialization_urls
            .iter()
            .map(|name| InitSource::from_name(name, self.config()))
            .collect();
        for source in sources {
            self.queue_init_source(source);
        }
    }

    /// Number of queued sources.
    pub fn queued_init_sources(&self) -> usize {
        self.init_queue().lock().len()
    }

    /// Apply every queued source in queue order.
    ///
    /// Sources are fetched concurrently; each is applied only after the one
    /// before it has been fully applied. A failing source does not stop the
    /// rest. All failures are returned together at the end.
    pub async fn load_init_sources(&self) -> CatalogResult<()> {
        let sources = std::mem::take(&mut *self.init_queue().lock());
        if sources.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = sources.iter().map(InitSource::name).collect();
        let resolved = join_all(sources.into_iter().map(|source| source.resolve(self))).await;

        let mut errors = Vec::new();
        for (name, result) in names.iter().zip(resolved) {
            let datas = match result {
                Ok(datas) => datas,
                Err(e) => {
                    log::warn!("Failed to load init source {}: {}", name, e);
                    errors.push(e);
                    continue;
                }
            };
            for data in datas {
                log::debug!("Applying init source {}", name);
                if let Err(e) = self.apply_init_data(data, false).await {
                    log::warn!("Errors while applying init source {}: {}", name, e);
                    errors.push(e);
                }
            }
        }
        match CatalogError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Merge one snapshot into the catalog and view state.
    ///
    /// Trait application is synchronous; the function then awaits the loads
    /// the snapshot asks for (containers, references, workbench map items)
    /// before returning. Everything that can be applied is applied; failures
    /// are returned together.
    pub async fn apply_init_data(&self, data: InitData, replace_stratum: bool) -> CatalogResult<()> {
        let stratum = data.stratum();
        let mut errors = self.apply_synchronous(&data, &stratum);

        if let Some(models) = &data.models {
            let loads = models.keys().map(|id| {
                self.load_model_stratum(id.clone(), &stratum, models, replace_stratum, Vec::new())
            });
            for (_, model_errors) in join_all(loads).await {
                errors.extend(model_errors);
            }
        }

        if let Some(previewed) = &data.previewed_item_id {
            let id = self.resolve_id(previewed).unwrap_or_else(|| previewed.clone());
            self.update_view(|view| view.previewed_item_id = Some(id));
        }

        if let Some(workbench) = &data.workbench {
            let mut items = Vec::new();
            for id in workbench {
                match self.models().get_by_id_or_share_key(id, None) {
                    Some(model) => self.push_and_load_map_items(model, &mut items, &mut errors).await,
                    None => log::warn!("Skipping unknown workbench item `{}`", id),
                }
            }
            let ids: Vec<String> = items.iter().map(|m| m.id().to_string()).collect();
            self.update_view(|view| view.workbench = ids);
        }

        if let Some(timeline) = &data.timeline {
            let wanted: HashSet<String> = timeline.iter().filter_map(|id| self.resolve_id(id)).collect();
            self.update_view(|view| {
                view.timeline = view
                    .workbench
                    .iter()
                    .filter(|id| wanted.contains(*id))
                    .cloned()
                    .collect();
            });
        }

        match CatalogError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Catalog entries and view settings, in one transaction.
    fn apply_synchronous(&self, data: &InitData, stratum: &StratumId) -> Vec<CatalogError> {
        self.transaction(|| {
            let mut errors = Vec::new();
            if !data.catalog.is_empty() {
                let members = json!({"members": data.catalog});
                let result = self
                    .root()
                    .ok_or_else(|| CatalogError::InvalidInitData {
                        source_name: "catalog".to_string(),
                        message: "the catalog has no root group".to_string(),
                    })
                    .and_then(|root| self.update_model_from_json(&root, stratum, &members, false));
                if let Err(e) = result {
                    errors.push(e);
                }
            }

            self.update_view(|view| {
                for domain in &data.cors_domains {
                    if !view.cors_domains.contains(domain) {
                        view.cors_domains.push(domain.clone());
                    }
                }
                if let Some(mode) = &data.viewer_mode {
                    view.viewer_mode = Some(mode.to_lowercase());
                }
                if let Some(camera) = data.home_camera.clone().filter(Value::is_object) {
                    view.home_camera = Some(camera);
                }
                if let Some(camera) = data.initial_camera.clone().filter(Value::is_object) {
                    view.initial_camera = Some(camera);
                }
                if let Some(show) = data.show_splitter {
                    view.show_splitter = show;
                }
                if let Some(position) = data.split_position {
                    view.split_position = Some(position);
                }
                if let Some(settings) = &data.settings {
                    for (key, value) in settings {
                        view.settings.insert(key.clone(), value.clone());
                    }
                }
            });
            errors
        })
    }

    /// Current id of a model known by id or share key.
    fn resolve_id(&self, id_or_key: &str) -> Option<String> {
        if self.models().contains(id_or_key) {
            return Some(id_or_key.to_string());
        }
        self.models().model_id_by_share_key(id_or_key)
    }

    /// Apply one entry of `models`, after loading the groups that contain it
    /// so that dynamically created members exist first.
    fn load_model_stratum<'a>(
        &'a self,
        model_id: String,
        stratum: &'a StratumId,
        models: &'a Map<String, Value>,
        replace: bool,
        visiting: Vec<String>,
    ) -> BoxFuture<'a, (Option<Arc<Model>>, Vec<CatalogError>)> {
        async move {
            let mut errors = Vec::new();
            let entry = models.get(&model_id).cloned().unwrap_or_else(|| json!({}));
            let Value::Object(mut entry) = entry else {
                errors.push(CatalogError::InvalidInitData {
                    source_name: model_id.clone(),
                    message: "model data must be an object".to_string(),
                });
                return (None, errors);
            };
            let dereferenced = entry.remove("dereferenced");
            let containers: Vec<String> = entry
                .remove("knownContainerUniqueIds")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();

            let mut visiting = visiting;
            visiting.push(model_id.clone());
            let container_loads = containers
                .iter()
                .filter(|id| !visiting.contains(*id))
                .map(|id| self.load_container(id.clone(), stratum, models, replace, visiting.clone()));
            for container_errors in join_all(container_loads).await {
                errors.extend(container_errors);
            }

            let id = self.resolve_id(&model_id).unwrap_or(model_id);
            let existing = self.models().get_by_id(&id, None);
            if existing.is_none() && !entry.contains_key("type") {
                errors.push(CatalogError::InvalidInitData {
                    source_name: id.clone(),
                    message: "model does not exist and has no `type`".to_string(),
                });
                return (None, errors);
            }
            entry.insert("id".into(), Value::String(id.clone()));
            let model = match self.upsert_model_from_json(stratum, &Value::Object(entry), None, replace) {
                Ok(model) => model,
                Err(e) => {
                    errors.push(e);
                    match existing {
                        Some(model) => model,
                        None => return (None, errors),
                    }
                }
            };
            for container in &containers {
                model.add_known_container(container);
            }

            let group = if model.def().is_reference() {
                let dereferenced = match dereferenced {
                    Some(value) => Some(value),
                    None if replace && model.target().is_some() => Some(json!({})),
                    None => None,
                };
                match self.workbench_item(&model).await {
                    Ok(target) => {
                        if let Some(dereferenced) = dereferenced {
                            if let Err(e) = self.update_model_from_json(&target, stratum, &dereferenced, replace) {
                                errors.push(e);
                            }
                        }
                        Some(target)
                    }
                    Err(e) => {
                        errors.push(e);
                        None
                    }
                }
            } else {
                if dereferenced.is_some() {
                    errors.push(CatalogError::InvalidInitData {
                        source_name: id.clone(),
                        message: "`dereferenced` given for a model that is not a reference".to_string(),
                    });
                }
                Some(model.clone())
            };

            if let Some(group) = group.filter(|g| g.def().is_group()) {
                let open = group
                    .peek_trait("isOpen")
                    .ok()
                    .flatten()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if open {
                    if let Err(e) = group.load_members().await {
                        errors.push(e);
                    }
                }
            }
            (Some(model), errors)
        }
        .boxed()
    }

    fn load_container<'a>(
        &'a self,
        container_id: String,
        stratum: &'a StratumId,
        models: &'a Map<String, Value>,
        replace: bool,
        visiting: Vec<String>,
    ) -> BoxFuture<'a, Vec<CatalogError>> {
        async move {
            let (container, mut errors) = if models.contains_key(&container_id) {
                self.load_model_stratum(container_id.clone(), stratum, models, replace, visiting)
                    .await
            } else {
                (self.models().get_by_id_or_share_key(&container_id, None), Vec::new())
            };
            let Some(container) = container else {
                errors.push(CatalogError::InvalidInitData {
                    source_name: container_id,
                    message: "unknown container".to_string(),
                });
                return errors;
            };
            let group = match self.workbench_item(&container).await {
                Ok(group) => group,
                Err(e) => {
                    errors.push(e);
                    return errors;
                }
            };
            if group.def().is_group() {
                if let Err(e) = group.load_members().await {
                    errors.push(e);
                }
            }
            errors
        }
        .boxed()
    }

    /// Collect the mappable models a workbench entry stands for and load
    /// their map items. References contribute their target and groups their
    /// members.
    fn push_and_load_map_items<'a>(
        &'a self,
        model: Arc<Model>,
        items: &'a mut Vec<Arc<Model>>,
        errors: &'a mut Vec<CatalogError>,
    ) -> BoxFuture<'a, ()> {
        async move {
            if model.def().is_reference() {
                match self.workbench_item(&model).await {
                    Ok(target) => self.push_and_load_map_items(target, items, errors).await,
                    Err(e) => errors.push(e),
                }
            } else if model.def().is_group() {
                match model.load_members().await {
                    Ok(members) => {
                        for member in members {
                            self.push_and_load_map_items(member, items, errors).await;
                        }
                    }
                    Err(e) => errors.push(e),
                }
            } else if model.def().is_mappable() {
                if !items.iter().any(|item| item.id() == model.id()) {
                    items.push(model.clone());
                }
                if let Err(e) = model.load_map_items().await {
                    errors.push(e);
                }
            } else {
                errors.push(CatalogError::InvalidInitData {
                    source_name: "workbench".to_string(),
                    message: format!("`{}` cannot be shown on the map", model.id()),
                });
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::fetch::{Fetcher, MemoryFetcher};
    use crate::member::adapter::JsonAdapter;
    use crate::member::Phase;
    use crate::traits::{ModelTypeDef, TraitDef};
    use std::time::Duration;

    fn setup() -> (Arc<Catalog>, Arc<MemoryFetcher>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let fetcher = Arc::new(MemoryFetcher::new());
        let catalog = Catalog::with_fetcher(CatalogConfig::default(), fetcher.clone());
        catalog
            .traits()
            .register(ModelTypeDef::new("geojson").mappable().with_trait(TraitDef::number("opacity")));
        catalog
            .adapters()
            .register(Arc::new(JsonAdapter::new("geojson", fetcher.clone() as Arc<dyn Fetcher>)));
        (catalog, fetcher)
    }

    fn data(value: Value) -> InitData {
        InitData::from_value("test", value).unwrap()
    }

    #[tokio::test]
    async fn test_later_source_wins_despite_slow_earlier_fetch() {
        let (catalog, fetcher) = setup();
        fetcher.insert("http://data/test.json", json!({"metadata": {"name": "Test"}}));
        fetcher.set_delay("http://data/test.json", Duration::from_millis(80));
        fetcher.insert("http://data/test-2.json", json!({"metadata": {"name": "Test 2"}}));
        fetcher.insert(
            "http://init/a.json",
            json!({
                "catalog": [{"id": "test", "type": "geojson", "url": "http://data/test.json"}],
                "workbench": ["test"]
            }),
        );
        fetcher.set_delay("http://init/a.json", Duration::from_millis(40));
        catalog.queue_init_source(InitSource::Url("http://init/a.json".into()));
        catalog.queue_init_source(InitSource::data(
            "b",
            data(json!({
                "catalog": [{"id": "test-2", "type": "geojson", "url": "http://data/test-2.json"}],
                "workbench": ["test-2"]
            })),
        ));

        catalog.load_init_sources().await.unwrap();
        assert_eq!(catalog.workbench_ids(), vec!["test-2".to_string()]);
        assert_eq!(catalog.queued_init_sources(), 0);
    }

    #[tokio::test]
    async fn test_catalog_entries_join_root() {
        let (catalog, _) = setup();
        catalog
            .apply_init_data(data(json!({"catalog": [{"type": "group", "name": "Parks"}]})), false)
            .await
            .unwrap();
        let root = catalog.root().unwrap();
        assert_eq!(root.get_string_list("members").unwrap(), vec!["/Parks".to_string()]);
        assert!(catalog.models().get_by_id("/Parks", Some("group")).is_some());
    }

    #[tokio::test]
    async fn test_missing_workbench_leaves_workbench_unchanged() {
        let (catalog, _) = setup();
        catalog.update_view(|view| view.workbench = vec!["kept".into()]);
        catalog
            .apply_init_data(data(json!({"settings": {"baseMapId": "dark"}, "viewerMode": "2D"})), false)
            .await
            .unwrap();
        let view = catalog.view();
        assert_eq!(view.workbench, vec!["kept".to_string()]);
        assert_eq!(view.viewer_mode.as_deref(), Some("2d"));
        assert_eq!(view.settings.get("baseMapId"), Some(&json!("dark")));
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_after_applying_the_rest() {
        let (catalog, fetcher) = setup();
        fetcher.insert("http://data/good.json", json!({}));
        let err = catalog
            .apply_init_data(
                data(json!({
                    "catalog": [
                        {"id": "good", "type": "geojson", "url": "http://data/good.json"},
                        {"id": "bad", "type": "geojson", "url": "http://data/missing.json"},
                        {"id": "worse", "type": "geojson", "url": "http://data/gone.json"}
                    ],
                    "workbench": ["good", "bad", "worse"]
                })),
                false,
            )
            .await
            .unwrap_err();
        match err {
            CatalogError::Aggregate(agg) => assert_eq!(agg.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(
            catalog.workbench_ids(),
            vec!["good".to_string(), "bad".to_string(), "worse".to_string()]
        );
        let good = catalog.models().get_by_id("good", None).unwrap();
        assert!(good.phase_status(Phase::MapItems).is_loaded());
    }

    #[tokio::test]
    async fn test_unknown_workbench_items_are_skipped() {
        let (catalog, fetcher) = setup();
        fetcher.insert("http://data/good.json", json!({}));
        catalog
            .apply_init_data(
                data(json!({
                    "catalog": [{"id": "good", "type": "geojson", "url": "http://data/good.json"}],
                    "workbench": ["nowhere", "good"]
                })),
                false,
            )
            .await
            .unwrap();
        assert_eq!(catalog.workbench_ids(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_models_resolve_share_keys_and_containers() {
        let (catalog, _) = setup();
        catalog
            .apply_init_data(
                data(json!({
                    "catalog": [{"id": "g", "type": "group", "members": [
                        {"id": "new-id", "type": "geojson", "shareKeys": ["old-id"]}
                    ]}]
                })),
                false,
            )
            .await
            .unwrap();
        catalog
            .apply_init_data(
                data(json!({
                    "stratum": "user",
                    "models": {"old-id": {"opacity": 0.25, "knownContainerUniqueIds": ["g"]}},
                    "timeline": ["old-id"]
                })),
                false,
            )
            .await
            .unwrap();
        let model = catalog.models().get_by_id("new-id", None).unwrap();
        assert_eq!(model.stratum(&StratumId::User).unwrap().get("opacity"), Some(&json!(0.25)));
        assert!(model.known_containers().contains(&"g".to_string()));
        assert!(!catalog.models().contains("old-id"));
    }

    #[tokio::test]
    async fn test_dereferenced_data_applies_to_target() {
        let (catalog, _) = setup();
        catalog
            .apply_init_data(
                data(json!({
                    "catalog": [{"id": "ref", "type": "record-reference", "record": {
                        "id": "rec", "aspects": {"terria": {"type": "geojson", "definition": {"url": "http://data/x.json"}}}
                    }}],
                    "models": {"ref": {"dereferenced": {"opacity": 0.4}}},
                    "stratum": "user"
                })),
                false,
            )
            .await
            .unwrap();
        let reference = catalog.models().get_by_id("ref", None).unwrap();
        let target = reference.target().unwrap();
        assert_eq!(target.stratum(&StratumId::User).unwrap().get("opacity"), Some(&json!(0.4)));
    }

    #[test]
    fn test_configured_sources_are_queued() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let config = CatalogConfig {
            initialization_urls: vec!["terria".into(), "http://x/init.json".into()],
            ..CatalogConfig::default()
        };
        let catalog = Catalog::with_fetcher(config, fetcher);
        catalog.queue_configured_init_sources();
        assert_eq!(catalog.queued_init_sources(), 2);
    }
}
