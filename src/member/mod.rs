//! Catalog Member Lifecycle: the phased, memoized load contract every
//! loadable entity exposes, and the format adapters that implement it.

pub mod adapter;
pub mod lifecycle;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CatalogError, CatalogResult};

pub use adapter::{AdapterRegistry, FormatAdapter};

/// One renderable output of a mappable model. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapItem {
    /// Renderer-specific kind, e.g. `imagery` or `features`.
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl MapItem {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// A lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Metadata,
    MapItems,
    Reference,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Metadata, Phase::MapItems, Phase::Reference];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Metadata => "metadata",
            Phase::MapItems => "mapItems",
            Phase::Reference => "reference",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = CatalogError;

    fn from_str(s: &str) -> CatalogResult<Self> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CatalogError::Parse(format!("unknown load phase `{}`", s)))
    }
}

/// State of one phase of one model.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseStatus {
    /// The model has no such phase.
    NotApplicable,
    NotLoaded,
    Loading,
    Loaded { at: DateTime<Utc> },
    Failed(CatalogError),
}

impl PhaseStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PhaseStatus::Loaded { .. })
    }

    /// JSON form used by the HTTP surface.
    pub fn to_json(&self) -> Value {
        match self {
            PhaseStatus::NotApplicable => json!({"state": "notApplicable"}),
            PhaseStatus::NotLoaded => json!({"state": "notLoaded"}),
            PhaseStatus::Loading => json!({"state": "loading"}),
            PhaseStatus::Loaded { at } => json!({"state": "loaded", "at": at.to_rfc3339()}),
            PhaseStatus::Failed(error) => json!({"state": "failed", "error": error.to_string()}),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
