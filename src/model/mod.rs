//! Models: identity, stratum store and the catalog description format.

pub mod instance;
pub mod json;
pub mod snapshot;

pub use instance::{Layer, Model};
pub use json::ModelDescription;
pub use snapshot::ModelSnapshot;
