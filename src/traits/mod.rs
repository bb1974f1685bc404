//! Trait declarations per model type and the pure strata resolver.

pub mod definition;
pub mod registry;
pub mod resolver;

pub use definition::{Capabilities, IdProperty, MergePolicy, ModelTypeDef, TraitDef, TraitType};
pub use registry::{TraitRegistry, GROUP_TYPE, RECORD_REFERENCE_TYPE};
