//! Dereferencing a `record-reference` into live models.
//!
//! The reference's loader reads `recordId`, `url`, `record` and `override`
//! while tracked, so editing any of them re-dereferences on next access. The
//! target keeps the reference's id and is reused across refreshes as long as
//! its type is unchanged; group members are registered under their record ids
//! and reused the same way.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::record::{GroupAspect, Record, RecordMember};
use crate::catalog::Catalog;
use crate::error::{CatalogError, CatalogResult};
use crate::fetch::Fetcher;
use crate::model::json::update_model_from_json;
use crate::model::Model;
use crate::strata::{AsyncLoader, LoadFn, LoadFuture, StratumId, TraitBag};
use crate::traits::{GROUP_TYPE, RECORD_REFERENCE_TYPE};

// ---------------------------------------------------------------------------
// Load function
// ---------------------------------------------------------------------------

pub(crate) fn reference_load_fn(id: String, model: Weak<Model>) -> LoadFn<Option<Arc<Model>>> {
    Arc::new(move || -> CatalogResult<LoadFuture<Option<Arc<Model>>>> {
        let reference = model
            .upgrade()
            .ok_or_else(|| CatalogError::ModelDropped(id.clone()))?;
        let catalog = reference
            .catalog()
            .ok_or_else(|| CatalogError::dereference(&id, "reference is not part of a catalog"))?;
        let source = RecordSource::read(&reference, &catalog)?;
        let previous = reference
            .reference_loader()
            .and_then(AsyncLoader::peek)
            .flatten();
        let seq = reference.reference_loader().map(AsyncLoader::load_count);
        let catalog = Arc::downgrade(&catalog);
        let reference = Arc::downgrade(&reference);
        let id = id.clone();

        Ok(async move {
            let record = source.record(&id).await?;
            // A newer dereference owns the target now.
            let current = reference
                .upgrade()
                .and_then(|r| r.reference_loader().map(AsyncLoader::load_count));
            if current != seq {
                log::debug!("Discarding stale dereference of `{}`", id);
                return Ok(previous);
            }
            let catalog = catalog
                .upgrade()
                .ok_or_else(|| CatalogError::dereference(&id, "catalog was torn down"))?;
            let target = catalog.runtime().transaction(|| {
                let mut dereferencer = Dereferencer::new(&catalog, source.url.clone());
                let target = dereferencer.target(&id, &record, source.override_traits.as_ref(), previous)?;
                dereferencer.report(&id);
                Ok::<_, CatalogError>(target)
            })?;
            log::debug!("Dereferenced `{}` into a `{}`", id, target.type_name());
            Ok(Some(target))
        }
        .boxed())
    })
}

/// Everything the asynchronous part needs, read while tracked.
struct RecordSource {
    record_id: Option<String>,
    url: Option<String>,
    inline: Option<Value>,
    override_traits: Option<Value>,
    fetcher: Arc<dyn Fetcher>,
    records_path: String,
}

impl RecordSource {
    fn read(reference: &Model, catalog: &Catalog) -> CatalogResult<Self> {
        Ok(Self {
            record_id: reference.get_string("recordId")?,
            url: reference.get_string("url")?,
            inline: reference.get_trait("record")?,
            override_traits: reference.get_trait("override")?,
            fetcher: catalog.fetcher().clone(),
            records_path: catalog.config().records_api_path.clone(),
        })
    }

    /// The inline record when it is complete, else the fetched one.
    async fn record(&self, reference_id: &str) -> CatalogResult<Record> {
        let inline = match &self.inline {
            Some(value) => Some(self.parse(reference_id, value.clone())?),
            None => None,
        };
        match inline {
            Some(record) if record.is_dereferenced() || self.url.is_none() => Ok(record),
            _ => self.fetch(reference_id).await,
        }
    }

    fn parse(&self, reference_id: &str, mut value: Value) -> CatalogResult<Record> {
        if let (Value::Object(map), Some(record_id)) = (&mut value, &self.record_id) {
            if !map.contains_key("id") && !map.contains_key("recordId") {
                map.insert("id".into(), Value::String(record_id.clone()));
            }
        }
        serde_json::from_value(value)
            .map_err(|e| CatalogError::dereference(reference_id, format!("invalid record: {}", e)))
    }

    async fn fetch(&self, reference_id: &str) -> CatalogResult<Record> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| CatalogError::dereference(reference_id, "no `url` and no inline `record`"))?;
        let record_id = self
            .record_id
            .as_deref()
            .ok_or_else(|| CatalogError::dereference(reference_id, "no `recordId`"))?;
        let endpoint = format!(
            "{}/{}/{}?dereference=true",
            url.trim_end_matches('/'),
            self.records_path.trim_matches('/'),
            urlencoding::encode(record_id)
        );
        let document = self
            .fetcher
            .fetch_json(&endpoint)
            .await
            .map_err(|e| CatalogError::dereference(reference_id, e))?;
        self.parse(reference_id, document)
    }
}

// ---------------------------------------------------------------------------
// Cycle guard
// ---------------------------------------------------------------------------

/// Marks one id as being dereferenced for as long as it lives.
struct ResolvingGuard<'a> {
    resolving: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> ResolvingGuard<'a> {
    /// `None` if `id` is already being resolved.
    fn enter(catalog: &'a Catalog, id: &str) -> Option<Self> {
        let resolving = catalog.resolving();
        if !resolving.lock().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            resolving,
            id: id.to_string(),
        })
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.resolving.lock().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Dereferencer
// ---------------------------------------------------------------------------

/// Builds models from one record tree. Member failures are collected and
/// logged; they never fail the whole dereference.
struct Dereferencer<'a> {
    catalog: &'a Catalog,
    /// Base url handed to lazy child references.
    url: Option<String>,
    errors: Vec<CatalogError>,
}

impl<'a> Dereferencer<'a> {
    fn new(catalog: &'a Catalog, url: Option<String>) -> Self {
        Self {
            catalog,
            url,
            errors: Vec::new(),
        }
    }

    fn target(
        &mut self,
        id: &str,
        record: &Record,
        override_traits: Option<&Value>,
        previous: Option<Arc<Model>>,
    ) -> CatalogResult<Arc<Model>> {
        self.from_record(id, record, override_traits, previous)?
            .ok_or_else(|| {
                CatalogError::dereference(id, format!("record `{}` describes no supported model", record.id))
            })
    }

    fn report(&self, id: &str) {
        for error in &self.errors {
            log::warn!("While dereferencing `{}`: {}", id, error);
        }
    }

    /// A group when the record has a group aspect, a leaf when its terria
    /// aspect names a non-group type, otherwise nothing.
    fn from_record(
        &mut self,
        id: &str,
        record: &Record,
        override_traits: Option<&Value>,
        previous: Option<Arc<Model>>,
    ) -> CatalogResult<Option<Arc<Model>>> {
        let Some(_guard) = ResolvingGuard::enter(self.catalog, id) else {
            log::warn!("`{}` is already being dereferenced; keeping its last value", id);
            return Ok(previous);
        };
        match &record.aspects.group {
            Some(group) => self
                .group(id, record, group, override_traits, previous)
                .map(Some),
            None => self.leaf(id, record, override_traits, previous),
        }
    }

    fn group(
        &mut self,
        id: &str,
        record: &Record,
        group: &GroupAspect,
        override_traits: Option<&Value>,
        previous: Option<Arc<Model>>,
    ) -> CatalogResult<Arc<Model>> {
        let type_name = record.terria_type().unwrap_or(GROUP_TYPE);
        let target = self.reuse_or_create(id, type_name, previous)?;
        if !target.def().is_group() {
            return Err(CatalogError::dereference(
                id,
                format!("type `{}` cannot hold members", type_name),
            ));
        }

        let mut member_ids = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let member_override = member_override(override_traits, member.id());
            match self.member(id, member, member_override) {
                Ok(member_id) => member_ids.push(member_id),
                Err(e) => self.errors.push(e),
            }
        }

        let mut underride = TraitBag::new();
        if let Some(name) = &record.name {
            underride.insert("name".into(), json!(name));
        }
        underride.insert("members".into(), json!(member_ids));
        if let Err(e) = target.set_traits(&StratumId::Underride, &underride, true) {
            self.errors.push(e);
        }
        self.apply_record_strata(&target, record);
        self.apply_override(&target, override_traits);
        Ok(target)
    }

    fn leaf(
        &mut self,
        id: &str,
        record: &Record,
        override_traits: Option<&Value>,
        previous: Option<Arc<Model>>,
    ) -> CatalogResult<Option<Arc<Model>>> {
        let Some(type_name) = record.terria_type() else {
            return Ok(None);
        };
        // A group type without a group aspect needs the dereferenced record.
        if self.catalog.traits().get(type_name)?.is_group() {
            return Ok(None);
        }
        let target = self.reuse_or_create(id, type_name, previous)?;

        let mut underride = TraitBag::new();
        if let Some(name) = &record.name {
            underride.insert("name".into(), json!(name));
        }
        if let Err(e) = target.set_traits(&StratumId::Underride, &underride, true) {
            self.errors.push(e);
        }
        self.apply_record_strata(&target, record);
        self.apply_override(&target, override_traits);
        Ok(Some(target))
    }

    /// Build or link one group member and return its id.
    fn member(
        &mut self,
        group_id: &str,
        member: &RecordMember,
        member_override: Option<&Value>,
    ) -> CatalogResult<String> {
        let record = match member {
            RecordMember::Id(member_id) => return self.lazy_reference(member_id, None, member_override),
            RecordMember::Record(record) => record,
        };
        if self.catalog.resolving().lock().contains(&record.id) {
            log::warn!("`{}` contains itself; linking without rebuilding", record.id);
            return Ok(record.id.clone());
        }

        let existing = self.catalog.models().get_by_id(&record.id, None);
        if let (Some(existing), Some(wanted)) = (&existing, intended_type(record)) {
            if existing.type_name() != wanted {
                log::debug!(
                    "Member `{}` is registered as `{}`; keeping it instead of a `{}`",
                    record.id,
                    existing.type_name(),
                    wanted
                );
                self.apply_override(existing, member_override);
                return Ok(record.id.clone());
            }
        }

        match self.from_record(&record.id, record, member_override, existing.clone())? {
            Some(child) => {
                if existing.is_none() {
                    self.catalog.models().register(child.clone())?;
                }
                for key in record.share_keys() {
                    self.catalog.models().add_share_key(child.id(), key);
                }
                child.add_known_container(group_id);
                Ok(child.id().to_string())
            }
            None => self.lazy_reference(&record.id, record.display_name(), member_override),
        }
    }

    /// A `record-reference` standing in for a member that is not described
    /// yet. An already registered model is reused.
    fn lazy_reference(
        &mut self,
        member_id: &str,
        name: Option<&str>,
        member_override: Option<&Value>,
    ) -> CatalogResult<String> {
        if let Some(existing) = self.catalog.models().get_by_id(member_id, None) {
            self.apply_override(&existing, member_override);
            return Ok(member_id.to_string());
        }

        let reference = self.catalog.create_model(RECORD_REFERENCE_TYPE, member_id)?;
        let mut definition = TraitBag::new();
        definition.insert("recordId".into(), json!(member_id));
        if let Some(url) = &self.url {
            definition.insert("url".into(), json!(url));
        }
        if let Some(name) = name {
            definition.insert("name".into(), json!(name));
        }
        if let Some(member_override) = member_override {
            definition.insert("override".into(), member_override.clone());
        }
        reference.set_traits(&StratumId::Definition, &definition, true)?;
        self.catalog.models().register(reference)?;
        Ok(member_id.to_string())
    }

    fn reuse_or_create(
        &self,
        id: &str,
        type_name: &str,
        previous: Option<Arc<Model>>,
    ) -> CatalogResult<Arc<Model>> {
        match previous {
            Some(model) if model.type_name() == type_name => Ok(model),
            _ => self.catalog.create_model(type_name, id),
        }
    }

    /// Write each object of the terria aspect into the stratum it names.
    fn apply_record_strata(&mut self, target: &Arc<Model>, record: &Record) {
        let Some(terria) = &record.aspects.terria else {
            return;
        };
        for (name, values) in &terria.strata {
            if !values.is_object() {
                continue;
            }
            let stratum = StratumId::from(name.as_str());
            if stratum.is_loaded() {
                log::warn!("Record `{}` names unknown stratum `{}`; skipped", record.id, name);
                continue;
            }
            if let Err(e) = update_model_from_json(self.catalog, target, &stratum, values, true) {
                self.errors.push(e);
            }
        }
    }

    /// Re-apply an override. Targets built here get their override stratum
    /// replaced; other references receive it as their own `override` trait.
    fn apply_override(&mut self, model: &Arc<Model>, override_traits: Option<&Value>) {
        let result = if model.def().is_reference() {
            match override_traits {
                Some(value) => model.set_trait(&StratumId::Definition, "override", value.clone()),
                None => Ok(()),
            }
        } else {
            let own = own_override(override_traits);
            update_model_from_json(self.catalog, model, &StratumId::Override, &own, true)
        };
        if let Err(e) = result {
            self.errors.push(e);
        }
    }
}

/// The type a record would be built as, if it can be built at all.
fn intended_type(record: &Record) -> Option<&str> {
    match (&record.aspects.group, record.terria_type()) {
        (Some(_), type_name) => Some(type_name.unwrap_or(GROUP_TYPE)),
        (None, type_name) => type_name,
    }
}

/// Entry of `override.members` whose `id` matches.
fn member_override<'v>(override_traits: Option<&'v Value>, member_id: &str) -> Option<&'v Value> {
    override_traits?
        .get("members")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("id").and_then(Value::as_str) == Some(member_id))
}

/// Override values for the model itself: member entries are applied to the
/// members, never to the group's own `members` trait.
fn own_override(override_traits: Option<&Value>) -> Value {
    let mut own = match override_traits {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    for key in ["members", "id", "type"] {
        own.remove(key);
    }
    Value::Object(own)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
