//! A stratum whose trait values are produced by an asynchronous loader.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::id::StratumId;
use super::loader::{AsyncLoader, LoadFn, LoadPromise};
use super::TraitBag;
use crate::error::{CatalogError, CatalogResult};
use crate::reactive::{Cell, Reactive};

/// A loader-backed layer of trait values.
///
/// Reading a trait through it is a triggering access: it registers the caller
/// as a dependent and starts a load if the cached bag is absent or stale.
/// [`is_loading`](Self::is_loading) and [`load_promise`](Self::load_promise)
/// only inspect.
pub struct LoadableStratum {
    id: StratumId,
    loader: AsyncLoader<Arc<TraitBag>>,
}

impl fmt::Debug for LoadableStratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadableStratum")
            .field("id", &self.id)
            .field("loader", &self.loader)
            .finish()
    }
}

impl LoadableStratum {
    /// Create a loadable layer owned by the model `owner`.
    pub fn new(runtime: Reactive, owner: &str, id: StratumId, load: LoadFn<Arc<TraitBag>>) -> Self {
        let cell = Cell::loader(owner, id.name());
        Self {
            id,
            loader: AsyncLoader::new(runtime, cell, load),
        }
    }

    pub fn id(&self) -> &StratumId {
        &self.id
    }

    pub fn loader(&self) -> &AsyncLoader<Arc<TraitBag>> {
        &self.loader
    }

    /// Read one trait, starting a load if needed.
    ///
    /// Returns `Ok(None)` while this stratum's own load function is running so
    /// a loader never observes its own output.
    pub fn read_trait(&self, name: &str) -> CatalogResult<Option<Value>> {
        if self.loader.is_starting() {
            return Ok(None);
        }
        self.loader
            .runtime()
            .require_context(&format!("read trait `{}` of stratum `{}`", name, self.id))?;
        self.loader.ensure_started();
        Ok(self.loader.value().and_then(|bag| bag.get(name).cloned()))
    }

    /// Cached values without loading or recording a read.
    pub fn peek(&self) -> Option<Arc<TraitBag>> {
        self.loader.peek()
    }

    pub fn load_if_needed(&self) -> CatalogResult<LoadPromise> {
        self.loader.load_if_needed()
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_loading()
    }

    pub fn load_promise(&self) -> Option<LoadPromise> {
        self.loader.load_promise()
    }

    pub fn error(&self) -> Option<CatalogError> {
        self.loader.error()
    }

    pub fn invalidate(&self) {
        self.loader.invalidate()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
