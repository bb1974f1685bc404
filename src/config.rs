//! Catalog configuration.
//!
//! Loaded from a YAML or JSON file (JSON is valid YAML), then overlaid with
//! environment variables. Every field has a default, so an empty document is
//! a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult};

/// Default path of the record endpoint below a reference's `url`.
pub const DEFAULT_RECORDS_API_PATH: &str = "api/v0/registry/records";

/// Configuration of one [`Catalog`](crate::catalog::Catalog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogConfig {
    /// Init sources queued by `Catalog::queue_configured_init_sources`.
    pub initialization_urls: Vec<String>,
    /// Directories searched for init fragments named without `.json`.
    pub init_fragment_paths: Vec<String>,
    /// Base for resolving relative URLs.
    pub base_url: Option<String>,
    /// Service resolving `#share=<id>` fragments.
    pub share_service_url: Option<String>,
    pub records_api_path: String,
    /// Whether triggering accessors outside a reactive context fail fast.
    pub strict_reactive_context: bool,
    pub http_timeout_secs: u64,
    /// Directories of YAML model type declarations loaded at startup.
    pub model_type_dirs: Vec<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            initialization_urls: Vec::new(),
            init_fragment_paths: vec!["init/".to_string()],
            base_url: None,
            share_service_url: None,
            records_api_path: DEFAULT_RECORDS_API_PATH.to_string(),
            strict_reactive_context: cfg!(debug_assertions),
            http_timeout_secs: 30,
            model_type_dirs: Vec::new(),
        }
    }
}

impl CatalogConfig {
    /// Parse a YAML (or JSON) document.
    pub fn from_yaml_str(yaml: &str) -> CatalogResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| CatalogError::Config(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> CatalogResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    /// Overlay `CATALOG_BASE_URL`, `CATALOG_SHARE_SERVICE_URL` and
    /// `CATALOG_STRICT_CONTEXT`.
    pub fn apply_env_overrides(mut self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok());
        self
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("CATALOG_BASE_URL").filter(|v| !v.is_empty()) {
            self.base_url = Some(url);
        }
        if let Some(url) = var("CATALOG_SHARE_SERVICE_URL").filter(|v| !v.is_empty()) {
            self.share_service_url = Some(url);
        }
        if let Some(flag) = var("CATALOG_STRICT_CONTEXT") {
            match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.strict_reactive_context = true,
                "0" | "false" | "no" | "off" => self.strict_reactive_context = false,
                other => log::warn!("Ignoring CATALOG_STRICT_CONTEXT={}", other),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
