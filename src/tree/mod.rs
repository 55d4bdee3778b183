//! The versioned AVL tree
//!
//! - [`MutableTree`]: buffers writes and commits them as new versions
//! - [`ImmutableTree`]: read-only snapshot of one committed version
//! - [`RangeIter`] / [`MergedIter`]: ordered iteration
//! - [`Exporter`] / [`Importer`]: post-order streaming of a whole version

mod export;
mod immutable;
mod iter;
mod mutable;
mod working;

pub use export::{ExportNode, Exporter, Importer};
pub use immutable::ImmutableTree;
pub use iter::{MergedIter, RangeIter};
pub use mutable::MutableTree;
