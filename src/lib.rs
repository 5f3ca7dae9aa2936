/*!
tagsfs presents the files of a real directory tree at virtual paths
derived from their metadata, and folds renames of those virtual paths
back into the metadata they came from.

The crate is the core engine only: [`SyncSession`] is the entry point,
wiring a [`sourcefs::SourceTree`] and change monitor to a metadata
store and a path format. Mounting the result as an actual filesystem is
an adapter concern left to consumers.
*/

pub mod config;
pub mod meta_store;
pub mod path_store;
pub mod pattern;
pub mod sync;
pub mod values;

pub use config::{ConfigError, SyncConfig, SyncOptions};
pub use meta_store::{DelegateMetaStore, LinesMetaStore, MetaError, MetaStore, PathMetaStore};
pub use path_store::{PathStore, StoreError};
pub use pattern::{PathFormat, PatternError, SegmentPattern, Splitter};
pub use sync::{FilterTarget, PathFilter, PathKind, PathStat, SyncError, SyncSession};
pub use values::Values;
