//! References: models that resolve into a different, concrete target model
//! described by an external catalog record.
//!
//! A `record-reference` carries `recordId` and `url` (where to fetch the
//! record), or an inline `record`, plus an `override` object re-applied onto
//! the target and, through `override.members`, onto matching members. Call
//! [`Model::load_reference`](crate::model::Model::load_reference) and read
//! [`Model::target`](crate::model::Model::target).

pub mod dereference;
pub mod record;

pub use record::{Aspects, GroupAspect, Record, RecordMember, TerriaAspect};
