//! Catalog description format: one JSON object per model with `id`, `type`
//! and trait key/values. Groups carry `members`, a list of child ids or
//! inline child descriptions.

use std::sync::Arc;

use serde_json::{json, Value};

use super::instance::Model;
use super::snapshot::ModelSnapshot;
use crate::catalog::Catalog;
use crate::error::{CatalogError, CatalogResult};
use crate::strata::{StratumId, TraitBag};

/// Keys of a description that are not trait values.
const RESERVED_KEYS: [&str; 5] = ["id", "type", "shareKeys", "knownContainerUniqueIds", "members"];

/// A parsed catalog description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDescription {
    pub id: Option<String>,
    pub type_name: Option<String>,
    pub share_keys: Vec<String>,
    pub known_containers: Vec<String>,
    /// Child ids (strings) or inline child descriptions (objects).
    pub members: Option<Vec<Value>>,
    /// Every remaining key, to be written as traits.
    pub traits: TraitBag,
}

impl ModelDescription {
    /// Split a description object into identity fields and trait values.
    pub fn parse(value: &Value) -> CatalogResult<Self> {
        let Value::Object(map) = value else {
            return Err(CatalogError::InvalidDescription(format!(
                "expected an object, got {}",
                value
            )));
        };

        let string_field = |key: &str| -> CatalogResult<Option<String>> {
            match map.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(CatalogError::InvalidDescription(format!(
                    "`{}` must be a string, got {}",
                    key, other
                ))),
            }
        };
        let string_list = |key: &str| -> CatalogResult<Vec<String>> {
            match map.get(key) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            CatalogError::InvalidDescription(format!("`{}` must list strings", key))
                        })
                    })
                    .collect(),
                Some(other) => Err(CatalogError::InvalidDescription(format!(
                    "`{}` must be an array, got {}",
                    key, other
                ))),
            }
        };

        let members = match map.get("members") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(items.clone()),
            Some(other) => {
                return Err(CatalogError::InvalidDescription(format!(
                    "`members` must be an array, got {}",
                    other
                )))
            }
        };

        let traits = map
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            id: string_field("id")?,
            type_name: string_field("type")?,
            share_keys: string_list("shareKeys")?,
            known_containers: string_list("knownContainerUniqueIds")?,
            members,
            traits,
        })
    }

    /// Display name given in the description, if any.
    pub fn name(&self) -> Option<&str> {
        self.traits.get("name").and_then(Value::as_str)
    }
}

/// Create or update the model described by `json`.
///
/// The id is taken from `id`, else derived as `{parent}/{name}`, else a
/// random uuid. An existing model is found by id or share key; its type must
/// match the description's `type` when one is given.
pub fn upsert_model_from_json(
    catalog: &Catalog,
    stratum: &StratumId,
    json: &Value,
    parent_id: Option<&str>,
    replace: bool,
) -> CatalogResult<Arc<Model>> {
    let description = ModelDescription::parse(json)?;
    let id = match (&description.id, description.name(), parent_id) {
        (Some(id), _, _) => id.clone(),
        (None, Some(name), Some(parent)) => format!("{}/{}", parent.trim_end_matches('/'), name),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let model = match catalog.models().get_by_id_or_share_key(&id, None) {
        Some(existing) => {
            if let Some(type_name) = &description.type_name {
                if type_name != existing.type_name() {
                    return Err(CatalogError::ModelTypeMismatch {
                        id,
                        expected: type_name.clone(),
                        actual: existing.type_name().to_string(),
                    });
                }
            }
            existing
        }
        None => {
            let type_name = description.type_name.as_deref().ok_or_else(|| {
                CatalogError::InvalidDescription(format!("model `{}` has no `type`", id))
            })?;
            let model = catalog.create_model(type_name, &id)?;
            catalog.models().register(model.clone())?;
            model
        }
    };

    if let Some(parent) = parent_id {
        model.add_known_container(parent);
    }
    update_model(catalog, &model, stratum, &description, replace)?;
    Ok(model)
}

/// Apply a parsed description to an existing model.
///
/// Every trait and member is attempted; failures are returned together after
/// the rest has been applied. Without `replace`, new members are appended to
/// the stratum's existing member list.
pub fn update_model(
    catalog: &Catalog,
    model: &Arc<Model>,
    stratum: &StratumId,
    description: &ModelDescription,
    replace: bool,
) -> CatalogResult<()> {
    catalog.runtime().transaction(|| {
        let mut errors = Vec::new();
        let previous_members = if replace {
            Vec::new()
        } else {
            stratum_members(model, stratum)
        };

        if let Err(e) = model.set_traits(stratum, &description.traits, replace) {
            errors.push(e);
        }
        for key in &description.share_keys {
            catalog.models().add_share_key(model.id(), key);
        }
        for container in &description.known_containers {
            model.add_known_container(container);
        }

        if let Some(members) = &description.members {
            if !model.def().is_group() {
                errors.push(CatalogError::InvalidDescription(format!(
                    "`{}` of type `{}` cannot have members",
                    model.id(),
                    model.type_name()
                )));
            } else {
                let mut ids = previous_members;
                for member in members {
                    let id = match member {
                        Value::String(id) => id.clone(),
                        Value::Object(_) => {
                            match upsert_model_from_json(catalog, stratum, member, Some(model.id()), false) {
                                Ok(child) => child.id().to_string(),
                                Err(e) => {
                                    errors.push(e);
                                    continue;
                                }
                            }
                        }
                        other => {
                            errors.push(CatalogError::InvalidDescription(format!(
                                "member of `{}` must be an id or an object, got {}",
                                model.id(),
                                other
                            )));
                            continue;
                        }
                    };
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                if let Err(e) = model.set_trait(stratum, "members", json!(ids)) {
                    errors.push(e);
                }
            }
        }

        match CatalogError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

/// Parse `json` and apply it to `model`.
pub fn update_model_from_json(
    catalog: &Catalog,
    model: &Arc<Model>,
    stratum: &StratumId,
    json: &Value,
    replace: bool,
) -> CatalogResult<()> {
    let description = ModelDescription::parse(json)?;
    update_model(catalog, model, stratum, &description, replace)
}

/// Recreate (or refresh) a model from a snapshot.
pub fn restore_snapshot(catalog: &Catalog, snapshot: &ModelSnapshot) -> CatalogResult<Arc<Model>> {
    let model = match catalog.models().get_by_id(&snapshot.id, None) {
        Some(existing) if existing.type_name() == snapshot.type_name => existing,
        Some(existing) => {
            return Err(CatalogError::ModelTypeMismatch {
                id: snapshot.id.clone(),
                expected: snapshot.type_name.clone(),
                actual: existing.type_name().to_string(),
            })
        }
        None => {
            let model = catalog.create_model(&snapshot.type_name, &snapshot.id)?;
            catalog.models().register(model.clone())?;
            model
        }
    };

    catalog.runtime().transaction(|| {
        let errors: Vec<CatalogError> = snapshot
            .strata
            .iter()
            .filter_map(|(stratum, bag)| model.set_traits(stratum, bag, true).err())
            .collect();
        for key in &snapshot.share_keys {
            catalog.models().add_share_key(model.id(), key);
        }
        match CatalogError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(model.clone()),
        }
    })
}

fn stratum_members(model: &Model, stratum: &StratumId) -> Vec<String> {
    model
        .stratum(stratum)
        .and_then(|bag| bag.get("members").and_then(Value::as_array).cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::traits::{ModelTypeDef, TraitDef};

    fn catalog() -> Arc<Catalog> {
        let catalog = Catalog::new(CatalogConfig::default());
        catalog
            .traits()
            .register(ModelTypeDef::new("csv").mappable().with_trait(TraitDef::number("opacity")));
        catalog
    }

    #[test]
    fn test_parse_splits_reserved_keys() {
        let description = ModelDescription::parse(&json!({
            "id": "a",
            "type": "csv",
            "name": "A",
            "shareKeys": ["old-a"],
            "opacity": 0.4
        }))
        .unwrap();
        assert_eq!(description.id.as_deref(), Some("a"));
        assert_eq!(description.type_name.as_deref(), Some("csv"));
        assert_eq!(description.share_keys, vec!["old-a".to_string()]);
        assert_eq!(description.traits.len(), 2);
        assert_eq!(description.name(), Some("A"));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(ModelDescription::parse(&json!([1, 2])).is_err());
        assert!(ModelDescription::parse(&json!({"id": 5})).is_err());
        assert!(ModelDescription::parse(&json!({"members": "a"})).is_err());
    }

    #[test]
    fn test_upsert_creates_and_updates() {
        let catalog = catalog();
        let created = upsert_model_from_json(
            &catalog,
            &StratumId::Definition,
            &json!({"id": "a", "type": "csv", "name": "A"}),
            None,
            false,
        )
        .unwrap();
        let updated = upsert_model_from_json(
            &catalog,
            &StratumId::User,
            &json!({"id": "a", "opacity": 0.2}),
            None,
            false,
        )
        .unwrap();
        assert!(Arc::ptr_eq(&created, &updated));
        assert_eq!(updated.get_trait("opacity").unwrap(), Some(json!(0.2)));
        assert_eq!(updated.get_trait("name").unwrap(), Some(json!("A")));
    }

    #[test]
    fn test_upsert_type_mismatch() {
        let catalog = catalog();
        upsert_model_from_json(&catalog, &StratumId::Definition, &json!({"id": "a", "type": "csv"}), None, false)
            .unwrap();
        let err = upsert_model_from_json(
            &catalog,
            &StratumId::Definition,
            &json!({"id": "a", "type": "group"}),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::ModelTypeMismatch { .. }));
    }

    #[test]
    fn test_upsert_requires_type_for_new_models() {
        let catalog = catalog();
        let err = upsert_model_from_json(&catalog, &StratumId::Definition, &json!({"id": "x"}), None, false)
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidDescription(_)));
    }

    #[test]
    fn test_inline_members_get_derived_ids() {
        let catalog = catalog();
        let group = upsert_model_from_json(
            &catalog,
            &StratumId::Definition,
            &json!({
                "id": "g",
                "type": "group",
                "members": [
                    {"type": "csv", "name": "Child"},
                    "elsewhere"
                ]
            }),
            None,
            false,
        )
        .unwrap();
        assert_eq!(
            group.get_string_list("members").unwrap(),
            vec!["g/Child".to_string(), "elsewhere".to_string()]
        );
        let child = catalog.models().get_by_id("g/Child", Some("csv")).unwrap();
        assert_eq!(child.known_containers(), vec!["g".to_string()]);
    }

    #[test]
    fn test_members_append_without_replace() {
        let catalog = catalog();
        let stratum = StratumId::Definition;
        let group = upsert_model_from_json(&catalog, &stratum, &json!({"id": "g", "type": "group", "members": ["a"]}), None, false)
            .unwrap();
        update_model_from_json(&catalog, &group, &stratum, &json!({"members": ["b", "a"]}), false).unwrap();
        assert_eq!(group.get_string_list("members").unwrap(), vec!["a".to_string(), "b".to_string()]);

        update_model_from_json(&catalog, &group, &stratum, &json!({"members": ["c"]}), true).unwrap();
        assert_eq!(group.get_string_list("members").unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn test_errors_are_collected_after_applying_the_rest() {
        let catalog = catalog();
        let err = upsert_model_from_json(
            &catalog,
            &StratumId::Definition,
            &json!({"id": "a", "type": "csv", "name": "A", "bogus": 1, "members": ["x"]}),
            None,
            false,
        )
        .unwrap_err();
        match err {
            CatalogError::Aggregate(agg) => assert_eq!(agg.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
        let model = catalog.models().get_by_id("a", None).unwrap();
        assert_eq!(model.get_trait("name").unwrap(), Some(json!("A")));
    }

    #[test]
    fn test_share_keys_from_description() {
        let catalog = catalog();
        upsert_model_from_json(
            &catalog,
            &StratumId::Definition,
            &json!({"id": "new-id", "type": "csv", "shareKeys": ["old-id"]}),
            None,
            false,
        )
        .unwrap();
        let found = catalog.models().get_by_id_or_share_key("old-id", None).unwrap();
        assert_eq!(found.id(), "new-id");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let source = catalog();
        let model = upsert_model_from_json(
            &source,
            &StratumId::Definition,
            &json!({"id": "a", "type": "csv", "name": "A", "opacity": 0.5, "shareKeys": ["old"]}),
            None,
            false,
        )
        .unwrap();
        model.set_trait(&StratumId::User, "opacity", json!(0.9)).unwrap();
        let snapshot = model.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let target = catalog();
        let restored = restore_snapshot(&target, &serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.effective_traits().unwrap(), model.effective_traits().unwrap());
        assert_eq!(target.models().get_by_id_or_share_key("old", None).unwrap().id(), "a");
    }
}
