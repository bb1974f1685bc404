//! Observable cell keys.

use std::fmt;

use crate::strata::StratumId;

/// One observable unit of state in the dependency graph.
///
/// Computations record the cells they read; writes to a cell schedule
/// exactly the computations that read it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cell {
    /// A single trait in a single plain stratum of a model.
    Trait {
        model: String,
        stratum: StratumId,
        name: String,
    },
    /// The set of strata a model has (layers added or removed).
    Strata { model: String },
    /// The status and value of one asynchronous loader.
    Loader { owner: String, name: String },
    /// Membership of the model registry and its share keys.
    Registry,
    /// Application view state (workbench, timeline, settings, camera).
    View,
}

impl Cell {
    /// Cell for one trait of one stratum.
    pub fn trait_cell(model: &str, stratum: &StratumId, name: &str) -> Self {
        Cell::Trait {
            model: model.to_string(),
            stratum: stratum.clone(),
            name: name.to_string(),
        }
    }

    /// Cell for the strata structure of a model.
    pub fn strata(model: &str) -> Self {
        Cell::Strata {
            model: model.to_string(),
        }
    }

    /// Cell for a loader owned by `owner`.
    pub fn loader(owner: &str, name: &str) -> Self {
        Cell::Loader {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }

    /// Id of the model this cell belongs to, if any.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Cell::Trait { model, .. } | Cell::Strata { model } => Some(model),
            Cell::Loader { owner, .. } => Some(owner),
            Cell::Registry | Cell::View => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Trait {
                model,
                stratum,
                name,
            } => write!(f, "{}[{}].{}", model, stratum, name),
            Cell::Strata { model } => write!(f, "{}[*]", model),
            Cell::Loader { owner, name } => write!(f, "{}<{}>", owner, name),
            Cell::Registry => f.write_str("<registry>"),
            Cell::View => f.write_str("<view>"),
        }
    }
}
