//! Saved state of one model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::strata::{StratumId, TraitBag};

/// Every plain stratum of a model plus its share keys.
///
/// Restoring a snapshot into a fresh catalog yields a model with the same
/// effective traits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub share_keys: Vec<String>,
    #[serde(default)]
    pub strata: BTreeMap<StratumId, TraitBag>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_json_shape() {
        let mut user = TraitBag::new();
        user.insert("opacity".into(), json!(0.5));
        let snapshot = ModelSnapshot {
            id: "a".into(),
            type_name: "csv".into(),
            share_keys: vec!["old-a".into()],
            strata: BTreeMap::from([(StratumId::User, user)]),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            value,
            json!({"id": "a", "type": "csv", "shareKeys": ["old-a"], "strata": {"user": {"opacity": 0.5}}})
        );
        let back: ModelSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }
}
