//! Strata: priority-ordered layers of trait values and the loader machinery
//! behind loader-produced layers.

pub mod id;
pub mod loadable;
pub mod loader;

use serde_json::{Map, Value};

pub use id::{StratumId, DEFAULT_LOADED_PRIORITY, METADATA_STRATUM};
pub use loadable::LoadableStratum;
pub use loader::{AsyncLoader, LoadFn, LoadFuture, LoadPromise};

/// A partial set of trait values held by one stratum.
pub type TraitBag = Map<String, Value>;
