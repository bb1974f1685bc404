//! Init sources: queued configuration snapshots applied onto a catalog.
//!
//! Sources are resolved concurrently but applied strictly in queue order,
//! each one fully awaited before the next starts, so a later source's
//! settings win no matter which fetch finishes first.

pub mod apply;
pub mod share_link;
pub mod source;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CatalogError, CatalogResult};
use crate::strata::StratumId;

pub use share_link::{parse_fragment, FragmentPart};
pub use source::InitSource;

/// One configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitData {
    /// Catalog descriptions added to the root group.
    pub catalog: Vec<Value>,
    /// Stratum written by this source. Defaults to `definition`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stratum: Option<StratumId>,
    /// Per-model stratum data keyed by id (or share key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Map<String, Value>>,
    /// New workbench contents. Absent leaves the workbench unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workbench: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_camera: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_camera: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cors_domains: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previewed_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_splitter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_position: Option<f64>,
}

impl InitData {
    /// Parse an init document, attributing failures to `source_name`.
    pub fn from_value(source_name: &str, value: Value) -> CatalogResult<Self> {
        if !value.is_object() {
            return Err(CatalogError::InvalidInitData {
                source_name: source_name.to_string(),
                message: "expected a JSON object".to_string(),
            });
        }
        serde_json::from_value(value).map_err(|e| CatalogError::InvalidInitData {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })
    }

    /// The stratum this source writes.
    pub fn stratum(&self) -> StratumId {
        self.stratum.clone().unwrap_or(StratumId::Definition)
    }
}

/// Versioned payload of a share link or share service document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareData {
    pub version: String,
    #[serde(default)]
    pub init_sources: Vec<Value>,
}

impl ShareData {
    /// Parse and check the version. `0.x` payloads are rejected.
    pub fn from_value(source_name: &str, value: Value) -> CatalogResult<Self> {
        let data: ShareData = serde_json::from_value(value).map_err(|e| CatalogError::InvalidInitData {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        if data.version.starts_with("0.") {
            return Err(CatalogError::UnsupportedShareVersion(data.version));
        }
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_init_data() {
        let data = InitData::from_value(
            "test",
            json!({
                "catalog": [{"id": "a", "type": "group"}],
                "stratum": "user",
                "workbench": ["a"],
                "corsDomains": ["example.com"],
                "splitPosition": 0.3,
                "unknownKey": true
            }),
        )
        .unwrap();
        assert_eq!(data.catalog.len(), 1);
        assert_eq!(data.stratum(), StratumId::User);
        assert_eq!(data.workbench, Some(vec!["a".to_string()]));
        assert_eq!(data.split_position, Some(0.3));
        assert!(data.timeline.is_none());
        assert_eq!(InitData::default().stratum(), StratumId::Definition);
    }

    #[test]
    fn test_invalid_init_data_names_source() {
        let err = InitData::from_value("bad.json", json!({"workbench": "a"})).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInitData { ref source_name, .. } if source_name == "bad.json"));
        assert!(InitData::from_value("list", json!([1])).is_err());
    }

    #[test]
    fn test_share_data_versions() {
        let data = ShareData::from_value("start", json!({"version": "8.0.0", "initSources": ["init/a.json", {}]})).unwrap();
        assert_eq!(data.init_sources.len(), 2);
        assert_eq!(
            ShareData::from_value("start", json!({"version": "0.0.05", "initSources": []})).unwrap_err(),
            CatalogError::UnsupportedShareVersion("0.0.05".into())
        );
    }
}
