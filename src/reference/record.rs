//! Catalog record schema consumed by references.
//!
//! ```json
//! {
//!   "id": "rec-1",
//!   "name": "Parks",
//!   "aspects": {
//!     "group":  { "members": ["rec-2", { "id": "rec-3", "aspects": { ... } }] },
//!     "terria": { "type": "csv", "definition": { "url": "..." } }
//!   }
//! }
//! ```
//!
//! `group.members` lists child records, either dereferenced (objects) or as
//! bare ids. `terria` carries the concrete type plus one object per stratum.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(alias = "recordId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub aspects: Aspects,
}

/// The aspects a reference understands. Others are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aspects {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupAspect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terria: Option<TerriaAspect>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupAspect {
    #[serde(default)]
    pub members: Vec<RecordMember>,
}

/// A group member: a dereferenced record or just its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordMember {
    Record(Box<Record>),
    Id(String),
}

impl RecordMember {
    pub fn id(&self) -> &str {
        match self {
            RecordMember::Record(record) => &record.id,
            RecordMember::Id(id) => id,
        }
    }
}

/// Concrete model type plus per-stratum trait values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerriaAspect {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(rename = "shareKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub share_keys: Vec<String>,
    /// Stratum name -> trait values.
    #[serde(flatten)]
    pub strata: BTreeMap<String, Value>,
}

impl Record {
    /// Whether every group member is itself a record, so the record can be
    /// turned into models without fetching.
    pub fn is_dereferenced(&self) -> bool {
        self.aspects.group.as_ref().map_or(true, |group| {
            group
                .members
                .iter()
                .all(|member| matches!(member, RecordMember::Record(_)))
        })
    }

    /// Model type declared by the terria aspect.
    pub fn terria_type(&self) -> Option<&str> {
        self.aspects.terria.as_ref()?.type_name.as_deref()
    }

    /// Display name: the terria definition's `name`, else the record name.
    pub fn display_name(&self) -> Option<&str> {
        self.aspects
            .terria
            .as_ref()
            .and_then(|terria| terria.strata.get("definition"))
            .and_then(|definition| definition.get("name"))
            .and_then(Value::as_str)
            .or(self.name.as_deref())
    }

    /// Share keys declared by the terria aspect.
    pub fn share_keys(&self) -> &[String] {
        self.aspects
            .terria
            .as_ref()
            .map_or(&[], |terria| terria.share_keys.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_group_record() {
        let record: Record = serde_json::from_value(json!({
            "recordId": "root",
            "name": "Root",
            "aspects": {
                "group": {"members": ["a", {"id": "b", "aspects": {"terria": {"type": "csv", "definition": {"name": "B"}}}}]},
                "access-control": {"ignored": true}
            }
        }))
        .unwrap();
        assert_eq!(record.id, "root");
        let members = &record.aspects.group.as_ref().unwrap().members;
        assert_eq!(members[0], RecordMember::Id("a".into()));
        assert_eq!(members[1].id(), "b");
        assert!(!record.is_dereferenced());
        match &members[1] {
            RecordMember::Record(b) => {
                assert_eq!(b.terria_type(), Some("csv"));
                assert_eq!(b.display_name(), Some("B"));
                assert!(b.aspects.terria.as_ref().unwrap().strata.contains_key("definition"));
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_leaf_record_is_dereferenced() {
        let record: Record = serde_json::from_value(json!({
            "id": "leaf",
            "aspects": {"terria": {"type": "csv", "shareKeys": ["old-leaf"], "user": {"opacity": 1}}}
        }))
        .unwrap();
        assert!(record.is_dereferenced());
        assert_eq!(record.share_keys(), ["old-leaf".to_string()]);
        assert_eq!(record.display_name(), None);
    }
}
