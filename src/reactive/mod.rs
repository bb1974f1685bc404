//! Explicit dependency tracking between observable cells and the
//! computations that read them.

pub mod cell;
pub mod runtime;

pub use cell::Cell;
pub use runtime::{ReactionHandle, ReactionId, Reactive};
