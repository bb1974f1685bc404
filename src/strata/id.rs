//! Stratum identifiers and their fixed priority order.
//!
//! Layers are ordered by tier, never by when they were written:
//!
//! ```text
//! Underride  <  Loaded(priority, name)  <  Definition  <  User  <  Override
//! ```
//!
//! The derived `Ord` follows variant order, so a `BTreeMap<StratumId, _>`
//! iterates bottom-to-top and `.iter().rev()` top-to-bottom.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Priority used for loader layers named in JSON without an explicit rank.
pub const DEFAULT_LOADED_PRIORITY: u32 = 100;

/// Name of the layer filled by a format adapter's metadata load.
pub const METADATA_STRATUM: &str = "metadata";

/// One named layer of trait values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StratumId {
    /// Defaults written by code; lowest priority.
    Underride,
    /// A layer produced by an asynchronous loader.
    Loaded { priority: u32, name: String },
    /// Catalog-authored values.
    Definition,
    /// The user's own edits.
    User,
    /// A reference's local edits re-applied onto its target.
    Override,
}

impl StratumId {
    /// The fixed, always-available tiers from lowest to highest priority.
    pub const FIXED: [StratumId; 4] = [
        StratumId::Underride,
        StratumId::Definition,
        StratumId::User,
        StratumId::Override,
    ];

    /// A loader layer with an explicit rank among other loader layers.
    pub fn loaded(name: impl Into<String>, priority: u32) -> Self {
        StratumId::Loaded {
            priority,
            name: name.into(),
        }
    }

    /// The layer written by metadata loads.
    pub fn metadata() -> Self {
        StratumId::loaded(METADATA_STRATUM, DEFAULT_LOADED_PRIORITY)
    }

    /// Whether this layer is owned by a loader.
    pub fn is_loaded(&self) -> bool {
        matches!(self, StratumId::Loaded { .. })
    }

    /// Name used in JSON and logs.
    pub fn name(&self) -> &str {
        match self {
            StratumId::Underride => "underride",
            StratumId::Loaded { name, .. } => name,
            StratumId::Definition => "definition",
            StratumId::User => "user",
            StratumId::Override => "override",
        }
    }
}

impl fmt::Display for StratumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StratumId {
    type Err = std::convert::Infallible;

    /// Well-known names map to their tiers; anything else is a loader layer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "underride" | "defaults" => StratumId::Underride,
            "definition" => StratumId::Definition,
            "user" => StratumId::User,
            "override" => StratumId::Override,
            other => StratumId::loaded(other, DEFAULT_LOADED_PRIORITY),
        })
    }
}

impl From<&str> for StratumId {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl Serialize for StratumId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for StratumId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(StratumId::from(name.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_tier_order() {
        let mut ids = vec![
            StratumId::Override,
            StratumId::User,
            StratumId::metadata(),
            StratumId::Definition,
            StratumId::Underride,
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                StratumId::Underride,
                StratumId::metadata(),
                StratumId::Definition,
                StratumId::User,
                StratumId::Override,
            ]
        );
    }

    #[test]
    fn test_loaded_layers_rank_by_priority() {
        let low = StratumId::loaded("zzz", 1);
        let high = StratumId::loaded("aaa", 2);
        assert!(low < high);
        assert!(high < StratumId::Definition);
    }

    #[test]
    fn test_btreemap_iterates_bottom_to_top() {
        let mut map = BTreeMap::new();
        map.insert(StratumId::User, 3);
        map.insert(StratumId::Underride, 1);
        map.insert(StratumId::Definition, 2);
        let top_down: Vec<i32> = map.values().rev().copied().collect();
        assert_eq!(top_down, vec![3, 2, 1]);
    }

    #[test]
    fn test_parse_and_serialize() {
        assert_eq!(StratumId::from("user"), StratumId::User);
        assert_eq!(StratumId::from("defaults"), StratumId::Underride);
        assert_eq!(StratumId::from("getCapabilities"), StratumId::loaded("getCapabilities", DEFAULT_LOADED_PRIORITY));
        let json = serde_json::to_string(&StratumId::Override).unwrap();
        assert_eq!(json, "\"override\"");
        let back: StratumId = serde_json::from_str("\"definition\"").unwrap();
        assert_eq!(back, StratumId::Definition);
    }
}
