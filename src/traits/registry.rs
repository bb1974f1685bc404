//! Trait Registry: every known model type and its trait declarations.
//!
//! Types are registered:
//! 1. Built in (`group`, `record-reference`) via [`TraitRegistry::with_defaults`]
//! 2. From YAML files in configured directories
//! 3. Programmatically, usually by a format adapter

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use super::definition::ModelTypeDef;
use crate::error::{CatalogError, CatalogResult};

/// Type tag of the built-in group type.
pub const GROUP_TYPE: &str = "group";

/// Type tag of the built-in catalog record reference type.
pub const RECORD_REFERENCE_TYPE: &str = "record-reference";

/// Registry of model types, indexed by type tag.
#[derive(Debug, Default)]
pub struct TraitRegistry {
    types: RwLock<HashMap<String, Arc<ModelTypeDef>>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TypeFile {
    Many { types: Vec<ModelTypeDef> },
    One(ModelTypeDef),
}

impl TraitRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in types.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(ModelTypeDef::group(GROUP_TYPE));
        registry.register(ModelTypeDef::record_reference(RECORD_REFERENCE_TYPE));
        registry
    }

    /// Register a type, replacing any previous declaration of the same tag.
    pub fn register(&self, def: ModelTypeDef) -> Arc<ModelTypeDef> {
        let def = Arc::new(def);
        let previous = self
            .types
            .write()
            .insert(def.type_name().to_string(), def.clone());
        if previous.is_some() {
            log::debug!("Replaced model type `{}`", def.type_name());
        }
        def
    }

    /// Register every type in a YAML document holding either a single type or
    /// a `types:` list. Returns how many were registered.
    pub fn register_from_yaml(&self, yaml: &str) -> CatalogResult<usize> {
        let defs = match serde_yaml::from_str::<TypeFile>(yaml)? {
            TypeFile::Many { types } => types,
            TypeFile::One(def) => vec![def],
        };
        let count = defs.len();
        for def in defs {
            self.register(def);
        }
        Ok(count)
    }

    /// Load every `.yaml`/`.yml` file in `dir` (recursively). Files that fail to
    /// parse are skipped with a warning.
    pub fn load_directory(&self, dir: &Path) -> CatalogResult<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CatalogError::Config(format!("{}: {}", dir.display(), e)))?;

        let mut count = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| CatalogError::Config(format!("{}: {}", dir.display(), e)))?
                .path();
            if path.is_dir() {
                count += self.load_directory(&path)?;
            } else if path
                .extension()
                .map_or(false, |ext| ext == "yaml" || ext == "yml")
            {
                let loaded = std::fs::read_to_string(&path)
                    .map_err(|e| CatalogError::Config(e.to_string()))
                    .and_then(|content| self.register_from_yaml(&content));
                match loaded {
                    Ok(n) => count += n,
                    Err(e) => log::warn!("Failed to load model types from {}: {}", path.display(), e),
                }
            }
        }
        Ok(count)
    }

    /// Look up a type, failing with [`CatalogError::UnknownModelType`].
    pub fn get(&self, type_name: &str) -> CatalogResult<Arc<ModelTypeDef>> {
        self.types
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownModelType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.read().contains_key(type_name)
    }

    /// All registered type tags, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::definition::TraitDef;

    #[test]
    fn test_defaults() {
        let registry = TraitRegistry::with_defaults();
        assert!(registry.get(GROUP_TYPE).unwrap().is_group());
        assert!(registry.get(RECORD_REFERENCE_TYPE).unwrap().is_reference());
        assert_eq!(
            registry.get("wms").unwrap_err(),
            CatalogError::UnknownModelType("wms".into())
        );
    }

    #[test]
    fn test_register_replaces() {
        let registry = TraitRegistry::new();
        registry.register(ModelTypeDef::new("csv"));
        registry.register(ModelTypeDef::new("csv").with_trait(TraitDef::string("column")));
        assert!(registry.get("csv").unwrap().trait_def("column").is_some());
        assert_eq!(registry.type_names(), vec!["csv".to_string()]);
    }

    #[test]
    fn test_register_from_yaml_list() {
        let registry = TraitRegistry::new();
        let count = registry
            .register_from_yaml(
                r#"
types:
  - type: geojson
    mappable: true
  - type: folder
    group: true
"#,
            )
            .unwrap();
        assert_eq!(count, 2);
        assert!(registry.get("folder").unwrap().is_group());
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("csv.yaml"), "type: csv\nmappable: true\n").unwrap();
        std::fs::write(dir.path().join("broken.yml"), "type: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = TraitRegistry::new();
        assert_eq!(registry.load_directory(dir.path()).unwrap(), 1);
        assert!(registry.get("csv").unwrap().is_mappable());
        assert_eq!(registry.load_directory(&dir.path().join("missing")).unwrap(), 0);
    }
}
