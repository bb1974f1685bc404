//! Lifecycle phases of a model: `load_metadata`, `load_map_items` and
//! `load_reference`.
//!
//! Every phase is idempotent and memoized by its loader: concurrent callers
//! share one in-flight load, and a phase that already settled with unchanged
//! inputs returns immediately. Failures are logged, retained on the model
//! and returned to the caller.

use std::sync::{Arc, Weak};

use futures::future::{join_all, FutureExt};

use super::adapter::FormatAdapter;
use super::{MapItem, Phase, PhaseStatus};
use crate::error::{CatalogError, CatalogResult};
use crate::model::Model;
use crate::strata::{AsyncLoader, LoadFn, LoadFuture, TraitBag};

// ---------------------------------------------------------------------------
// Load functions
// ---------------------------------------------------------------------------

pub(crate) fn metadata_load_fn(
    id: String,
    model: Weak<Model>,
    adapter: Arc<dyn FormatAdapter>,
) -> LoadFn<Arc<TraitBag>> {
    Arc::new(move || -> CatalogResult<LoadFuture<Arc<TraitBag>>> {
        let model = model
            .upgrade()
            .ok_or_else(|| CatalogError::ModelDropped(id.clone()))?;
        let future = adapter
            .load_metadata(&model)
            .map_err(|e| phase_error(&id, Phase::Metadata, e))?;
        let id = id.clone();
        Ok(async move {
            future
                .await
                .map(Arc::new)
                .map_err(|e| phase_error(&id, Phase::Metadata, e))
        }
        .boxed())
    })
}

pub(crate) fn map_items_load_fn(
    id: String,
    model: Weak<Model>,
    adapter: Arc<dyn FormatAdapter>,
) -> LoadFn<Arc<Vec<MapItem>>> {
    Arc::new(move || -> CatalogResult<LoadFuture<Arc<Vec<MapItem>>>> {
        let model = model
            .upgrade()
            .ok_or_else(|| CatalogError::ModelDropped(id.clone()))?;
        let future = adapter
            .load_map_items(&model)
            .map_err(|e| phase_error(&id, Phase::MapItems, e))?;
        // Metadata is awaited, not tracked: its own inputs already reach us
        // through the traits the adapter read above.
        let metadata = if adapter.metadata_required() {
            model
                .metadata_stratum()
                .map(|stratum| model.runtime().untracked(|| stratum.loader().ensure_started()))
        } else {
            None
        };
        let id = id.clone();
        Ok(async move {
            if let Some(metadata) = metadata {
                metadata.await?;
            }
            future
                .await
                .map(Arc::new)
                .map_err(|e| phase_error(&id, Phase::MapItems, e))
        }
        .boxed())
    })
}

/// Attribute an adapter failure to a phase, keeping already-attributed errors.
pub(crate) fn phase_error(model_id: &str, phase: Phase, error: CatalogError) -> CatalogError {
    match error {
        CatalogError::Load { .. }
        | CatalogError::Dereference { .. }
        | CatalogError::ModelDropped(_)
        | CatalogError::Aggregate(_) => error,
        other => CatalogError::load(model_id, phase.name(), other),
    }
}

fn status_of<T>(loader: &AsyncLoader<T>) -> PhaseStatus
where
    T: Clone + Send + Sync + 'static,
{
    if loader.is_loading() {
        return PhaseStatus::Loading;
    }
    if let Some(error) = loader.error() {
        return PhaseStatus::Failed(error);
    }
    match loader.loaded_at() {
        Some(at) => PhaseStatus::Loaded { at },
        None => PhaseStatus::NotLoaded,
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

impl Model {
    /// Load the lightweight descriptive metadata.
    pub async fn load_metadata(&self) -> CatalogResult<()> {
        let Some(stratum) = self.metadata_stratum() else {
            return Ok(());
        };
        let promise = self.runtime().observe(|| stratum.load_if_needed())?;
        self.finish_phase(Phase::Metadata, promise.await)
    }

    /// Load renderable output, after metadata when the adapter requires it.
    pub async fn load_map_items(&self) -> CatalogResult<()> {
        let Some(loader) = self.map_items_loader() else {
            return Ok(());
        };
        let promise = self.runtime().observe(|| loader.load_if_needed())?;
        self.finish_phase(Phase::MapItems, promise.await)
    }

    /// Dereference into the target model. A no-op for non-references.
    pub async fn load_reference(&self) -> CatalogResult<()> {
        let Some(loader) = self.reference_loader() else {
            return Ok(());
        };
        let promise = self.runtime().observe(|| loader.load_if_needed())?;
        self.finish_phase(Phase::Reference, promise.await)
    }

    /// Run one phase by name.
    pub async fn load_phase(&self, phase: Phase) -> CatalogResult<()> {
        match phase {
            Phase::Metadata => self.load_metadata().await,
            Phase::MapItems => self.load_map_items().await,
            Phase::Reference => self.load_reference().await,
        }
    }

    /// Load metadata, then resolve the group's member models.
    pub async fn load_members(&self) -> CatalogResult<Vec<Arc<Model>>> {
        self.load_metadata().await?;
        self.runtime().observe(|| self.member_models())
    }

    fn finish_phase(&self, phase: Phase, result: CatalogResult<()>) -> CatalogResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("Loading {} of `{}` failed: {}", phase, self.id(), e);
                Err(e)
            }
        }
    }

    /// Current state of one phase. Observed, never starts a load.
    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        let status = match phase {
            Phase::Metadata => self.metadata_stratum().map(|s| status_of(s.loader())),
            Phase::MapItems => self.map_items_loader().map(status_of),
            Phase::Reference => self.reference_loader().map(status_of),
        };
        status.unwrap_or(PhaseStatus::NotApplicable)
    }

    /// Whether any phase is loading. Observed, never starts a load.
    pub fn is_loading(&self) -> bool {
        Phase::ALL
            .iter()
            .any(|phase| self.phase_status(*phase) == PhaseStatus::Loading)
    }

    /// Last loaded map items. Observed, never starts a load.
    pub fn map_items(&self) -> Option<Arc<Vec<MapItem>>> {
        self.map_items_loader().and_then(AsyncLoader::value)
    }

    /// The dereferenced target, if resolved. Observed, never starts a load.
    pub fn target(&self) -> Option<Arc<Model>> {
        self.reference_loader().and_then(AsyncLoader::value).flatten()
    }

    /// Models listed in this group's `members` trait that are registered.
    pub fn member_models(&self) -> CatalogResult<Vec<Arc<Model>>> {
        if !self.def().is_group() {
            return Ok(Vec::new());
        }
        let Some(catalog) = self.catalog() else {
            return Ok(Vec::new());
        };
        let ids = self.get_string_list("members")?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let member = catalog.models().get_by_id_or_share_key(id, None);
                if member.is_none() {
                    log::debug!("Member `{}` of `{}` is not registered", id, self.id());
                }
                member
            })
            .collect())
    }
}

/// Run one phase for every model concurrently.
///
/// A failure never stops its siblings; all failures are returned together
/// once every model has been attempted.
pub async fn load_phase_all(models: &[Arc<Model>], phase: Phase) -> CatalogResult<()> {
    let results = join_all(models.iter().map(|model| model.load_phase(phase))).await;
    let errors = results.into_iter().filter_map(Result::err).collect();
    match CatalogError::combine(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
