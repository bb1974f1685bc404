//! Error types for the catalog core.
//!
//! Every fallible operation in the crate returns [`CatalogError`]. The enum is
//! `Clone` because the outcome of an in-flight load is shared between every
//! caller awaiting it and is retained on the model afterwards so UI code can
//! show an inline failure.

use std::fmt;

use thiserror::Error;

/// Errors produced by the trait model, loaders, registry and init sources.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    /// A trait name that the model's type does not declare.
    #[error("Unknown trait `{trait_name}` for model type `{model_type}`")]
    UnknownTrait {
        model_type: String,
        trait_name: String,
    },

    /// A `type` tag with no registered trait declarations.
    #[error("Unknown model type `{0}`")]
    UnknownModelType(String),

    /// A triggering accessor was called outside a reactive context.
    #[error("`{operation}` must be called inside a reactive context")]
    ReactiveContextRequired { operation: String },

    /// A value that does not match the trait's declared type.
    #[error("Invalid value for trait `{trait_name}`: {message}")]
    InvalidTraitValue { trait_name: String, message: String },

    /// Attempt to write into a stratum owned by a loader.
    #[error("Stratum `{0}` is produced by a loader and cannot be written directly")]
    ReadOnlyStratum(String),

    /// A model with this id is already registered.
    #[error("A model with id `{0}` already exists")]
    DuplicateModel(String),

    /// An existing model was addressed with a different type.
    #[error("Model `{id}` has type `{actual}`, not `{expected}`")]
    ModelTypeMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// Malformed catalog description JSON.
    #[error("Invalid model description: {0}")]
    InvalidDescription(String),

    /// A format adapter failed while loading a phase.
    #[error("Failed to load {phase} for `{model_id}`: {message}")]
    Load {
        model_id: String,
        phase: String,
        message: String,
    },

    /// Network or file access failed.
    #[error("Failed to fetch `{url}`: {message}")]
    Fetch { url: String, message: String },

    /// JSON / YAML parsing failed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A reference could not be resolved into a target model.
    #[error("Failed to dereference `{reference_id}`: {message}")]
    Dereference {
        reference_id: String,
        message: String,
    },

    /// An init source document is malformed.
    #[error("Invalid init data in `{source_name}`: {message}")]
    InvalidInitData {
        source_name: String,
        message: String,
    },

    /// A share link written by an incompatible version.
    #[error("Unsupported share data version `{0}`")]
    UnsupportedShareVersion(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The model behind a loader was dropped before the loader ran.
    #[error("Model `{0}` no longer exists")]
    ModelDropped(String),

    /// Several independent failures, collected while every sibling was attempted.
    #[error(transparent)]
    Aggregate(#[from] AggregateLoadError),
}

impl CatalogError {
    /// Combine a list of errors into at most one error.
    ///
    /// Returns `None` for an empty list, the error itself for a single entry,
    /// and a flattened [`AggregateLoadError`] otherwise.
    pub fn combine(errors: Vec<CatalogError>) -> Option<CatalogError> {
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                CatalogError::Aggregate(inner) => flat.extend(inner.errors),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(CatalogError::Aggregate(AggregateLoadError { errors: flat })),
        }
    }

    /// Wrap an adapter failure for one lifecycle phase.
    pub fn load(model_id: impl Into<String>, phase: impl Into<String>, message: impl fmt::Display) -> Self {
        CatalogError::Load {
            model_id: model_id.into(),
            phase: phase.into(),
            message: message.to_string(),
        }
    }

    /// Wrap a dereferencing failure.
    pub fn dereference(reference_id: impl Into<String>, message: impl fmt::Display) -> Self {
        CatalogError::Dereference {
            reference_id: reference_id.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error signals a programming mistake rather than bad data
    /// or a failed network request.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            CatalogError::UnknownTrait { .. } | CatalogError::ReactiveContextRequired { .. }
        )
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Parse(e.to_string())
    }
}

impl From<serde_yaml::Error> for CatalogError {
    fn from(e: serde_yaml::Error) -> Self {
        CatalogError::Parse(e.to_string())
    }
}

/// Several member failures collected during one orchestration pass.
///
/// Surfaced once, after every member has been attempted.
#[derive(Debug, Clone, PartialEq, Default, Error)]
pub struct AggregateLoadError {
    /// The individual failures, in the order they occurred.
    pub errors: Vec<CatalogError>,
}

impl AggregateLoadError {
    /// Number of collected failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred while loading", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

/// Result alias used throughout the crate.
pub type CatalogResult<T> = Result<T, CatalogError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_empty_is_none() {
        assert!(CatalogError::combine(Vec::new()).is_none());
    }

    #[test]
    fn test_combine_single_is_unwrapped() {
        let err = CatalogError::UnknownModelType("wms".to_string());
        assert_eq!(CatalogError::combine(vec![err.clone()]), Some(err));
    }

    #[test]
    fn test_combine_flattens_nested_aggregates() {
        let inner = CatalogError::combine(vec![
            CatalogError::Parse("a".into()),
            CatalogError::Parse("b".into()),
        ])
        .unwrap();
        let combined = CatalogError::combine(vec![inner, CatalogError::Parse("c".into())]).unwrap();
        match combined {
            CatalogError::Aggregate(agg) => assert_eq!(agg.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_display_lists_members() {
        let agg = AggregateLoadError {
            errors: vec![
                CatalogError::load("a", "metadata", "boom"),
                CatalogError::dereference("r", "no record"),
            ],
        };
        let text = agg.to_string();
        assert!(text.starts_with("2 errors"));
        assert!(text.contains("Failed to load metadata for `a`: boom"));
        assert!(text.contains("Failed to dereference `r`"));
    }

    #[test]
    fn test_programmer_errors() {
        assert!(CatalogError::ReactiveContextRequired {
            operation: "load_if_needed".into()
        }
        .is_programmer_error());
        assert!(!CatalogError::Parse("x".into()).is_programmer_error());
    }
}
