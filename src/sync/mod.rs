//! The sync layer: keeps the virtual tree, the pattern compiler, and
//! the metadata back-end consistent with each other.
//!
//! A [`SyncSession`] owns the whole pipeline. Scans and monitor events
//! flow in as real-path operations and become path-store registrations;
//! renames of virtual paths flow the other way and become metadata
//! writes. All state lives behind one mutex, so every mutation is
//! totally ordered and nothing here performs its own locking below
//! that.

mod change_processor;
mod filter;
mod prop_cache;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use indexmap::IndexMap;
use thiserror::Error;

use sourcefs::{IoResultExt, MonitorEvent, SourceTree, SourceTreeMonitor};

use crate::config::SyncOptions;
use crate::meta_store::{MetaError, MetaStore};
use crate::path_store::{PathStore, StoreError};
use crate::pattern::Splitter;
use crate::values::Values;

use self::change_processor::ChangeProcessor;
use self::prop_cache::PathPropCache;

pub use self::filter::{FilterTarget, PathFilter};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store {
        #[from]
        source: StoreError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },
}

impl From<SyncError> for io::Error {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Store { source } => source.into(),
            SyncError::InvalidArgument(message) => {
                io::Error::new(io::ErrorKind::InvalidInput, message)
            }
            SyncError::Io { source } => source,
        }
    }
}

fn invalid_argument(error: impl std::fmt::Display) -> SyncError {
    SyncError::InvalidArgument(error.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
}

/// A portable stat result for one virtual path.
///
/// Files report their real file's metadata. Directories synthesize
/// theirs: size zero, the source root's permissions, and times taken as
/// the maximum over contained end points, falling back to the source
/// root when there are none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStat {
    pub kind: PathKind,
    pub size: u64,
    pub readonly: bool,
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

/// One live tag filesystem: source tree in, virtual tree out.
///
/// Construct with [`SyncSession::new`], then call [`start`] to scan the
/// source tree and begin applying monitor events. All methods serialize
/// on the internal state mutex; none of them block beyond the
/// collaborator I/O they perform.
///
/// [`start`]: SyncSession::start
pub struct SyncSession {
    /// Drains monitor events in the background. Declared before `state`
    /// so its thread is joined before the state it borrows goes away.
    change_processor: Option<ChangeProcessor>,

    state: Arc<Mutex<SyncState>>,
}

impl SyncSession {
    pub fn new(
        source: SourceTree,
        meta_store: Box<dyn MetaStore>,
        monitor: Box<dyn SourceTreeMonitor>,
        options: SyncOptions,
    ) -> Self {
        let cache = options.cache.then(PathPropCache::new);

        Self {
            change_processor: None,
            state: Arc::new(Mutex::new(SyncState {
                source,
                meta_store,
                monitor,
                options,
                store: PathStore::new(),
                cache,
            })),
        }
    }

    /// Starts the monitor, populates the virtual tree from the source
    /// root, and spawns the event-processing thread.
    ///
    /// A monitor that fails to start is fatal; everything after that is
    /// per-path and survives as log output instead.
    pub fn start(&mut self) -> Result<(), SyncError> {
        let events = {
            let mut state = self.state.lock().unwrap();
            state.monitor.start()?;
            state.add_source_dir("/")?;
            state.monitor.event_receiver()
        };

        self.change_processor = Some(ChangeProcessor::start(Arc::clone(&self.state), events));
        Ok(())
    }

    /// Stops the event-processing thread and the monitor. Also runs on
    /// drop.
    pub fn stop(&mut self) {
        self.change_processor = None;
        self.state.lock().unwrap().monitor.stop();
    }

    pub fn add_source_file(&self, real_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().add_source_file(real_path)
    }

    pub fn remove_source_file(&self, real_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().remove_source_file(real_path)
    }

    pub fn update_source_file(&self, real_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().update_source_file(real_path)
    }

    pub fn add_source_dir(&self, real_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().add_source_dir(real_path)
    }

    pub fn remove_source_dir(&self, real_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().remove_source_dir(real_path)
    }

    pub fn rename_path(&self, old_fake_path: &str, new_fake_path: &str) -> Result<(), SyncError> {
        self.state
            .lock()
            .unwrap()
            .rename_path(old_fake_path, new_fake_path)
    }

    pub fn add_directory(&self, fake_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().add_directory(fake_path)
    }

    pub fn remove_directory(&self, fake_path: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().remove_directory(fake_path)
    }

    pub fn get_entries(&self, fake_path: &str) -> Result<Vec<String>, SyncError> {
        self.state.lock().unwrap().entries(fake_path)
    }

    pub fn get_real_path(&self, fake_path: &str) -> Result<String, SyncError> {
        let state = self.state.lock().unwrap();
        Ok(state.store.get_real_path(fake_path)?.to_owned())
    }

    pub fn get_fake_paths(&self, real_path: &str) -> Result<Vec<String>, SyncError> {
        let state = self.state.lock().unwrap();
        Ok(state.store.get_fake_paths(real_path)?)
    }

    pub fn path_exists(&self, fake_path: &str) -> bool {
        self.state.lock().unwrap().store.path_exists(fake_path)
    }

    pub fn is_file(&self, fake_path: &str) -> bool {
        self.state.lock().unwrap().store.is_file(fake_path)
    }

    pub fn is_dir(&self, fake_path: &str) -> bool {
        self.state.lock().unwrap().store.is_dir(fake_path)
    }

    pub fn is_empty_dir(&self, fake_path: &str) -> bool {
        self.state.lock().unwrap().store.is_empty_dir(fake_path)
    }

    pub fn stat(&self, fake_path: &str) -> Result<PathStat, SyncError> {
        self.state.lock().unwrap().stat(fake_path)
    }

    pub fn set_times(
        &self,
        fake_path: &str,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> Result<(), SyncError> {
        self.state
            .lock()
            .unwrap()
            .set_times(fake_path, accessed, modified)
    }

    pub fn supports_threads(&self) -> bool {
        self.state.lock().unwrap().monitor.supports_threads()
    }

    pub fn supports_writes(&self) -> bool {
        self.state.lock().unwrap().monitor.supports_writes()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the session protects with its mutex.
struct SyncState {
    source: SourceTree,
    meta_store: Box<dyn MetaStore>,
    monitor: Box<dyn SourceTreeMonitor>,
    options: SyncOptions,
    store: PathStore<Vec<Splitter>>,
    cache: Option<PathPropCache>,
}

impl SyncState {
    /// Registers every virtual path implied by the file's tags.
    ///
    /// Unreadable files and symlinks are skipped without error; both
    /// checks are racy, and a later monitor event retries them. Every
    /// permutation of the file's multi-valued tags becomes a candidate
    /// fake path; candidates that duplicate an earlier one in this call
    /// or an existing registration of this file are dropped, and the
    /// rest register in order. A candidate rejected by a filter stops
    /// registration of itself and all later candidates, keeping the
    /// earlier ones. Filters run before the watch is taken, so a file
    /// whose candidates are all filtered away is never watched.
    fn add_source_file(&mut self, real_path: &str) -> Result<(), SyncError> {
        if !self.source.is_readable(real_path) {
            log::debug!("Not adding {real_path}: not readable");
            return Ok(());
        }
        if self.source.is_symlink(real_path) {
            log::debug!("Not adding {real_path}: symlink");
            return Ok(());
        }

        let absolute = self.source.absolute_path(real_path);
        let values = self.meta_store.get(&absolute);

        let registered = self
            .store
            .get_fake_paths(real_path)
            .unwrap_or_default();

        let mut candidates: Vec<(String, IndexMap<String, String>)> = Vec::new();
        for permutation in values.permutations() {
            let substitutions = permutation.to_flat();
            let fake_path = match self.options.format.fill_path(&substitutions) {
                Ok(fake_path) => fake_path,
                Err(error) => {
                    log::info!("Unrepresentable file {real_path}: {error}");
                    return Ok(());
                }
            };

            if registered.contains(&fake_path)
                || candidates.iter().any(|(existing, _)| existing == &fake_path)
            {
                continue;
            }
            candidates.push((fake_path, substitutions));
        }

        let mut survivors = Vec::new();
        for (fake_path, substitutions) in candidates {
            let accepted = self
                .options
                .filters
                .iter()
                .all(|filter| filter.accepts(real_path, &fake_path));
            if !accepted {
                log::debug!("Excluded by filter: {fake_path} (real path {real_path})");
                break;
            }
            survivors.push((fake_path, substitutions));
        }

        if survivors.is_empty() {
            return Ok(());
        }

        match self.monitor.add_source_file(&absolute) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => {
                // A file we can't monitor properly shouldn't be presented
                // at all.
                log::warn!("Not adding {real_path}: watch failed: {error}");
                return Ok(());
            }
        }

        for (fake_path, substitutions) in survivors {
            let depth = self.options.format.depth();
            let splitters = self
                .options
                .format
                .splitters(depth, &substitutions)
                .map_err(invalid_argument)?;

            match self.store.add_file(&fake_path, real_path) {
                Ok(()) => {}
                Err(StoreError::AlreadyMapped { .. }) => continue,
                Err(error) => {
                    log::warn!("Not adding {fake_path} (real path {real_path}): {error}");
                    continue;
                }
            }
            self.store.set_meta_data(&fake_path, splitters)?;
            self.prune_cache(&fake_path);

            log::debug!("Added {fake_path} (real path {real_path})");
        }

        Ok(())
    }

    /// Removes every virtual path registered for the file. A real path
    /// with no registrations is a no-op.
    fn remove_source_file(&mut self, real_path: &str) -> Result<(), SyncError> {
        let fake_paths = match self.store.get_fake_paths(real_path) {
            Ok(fake_paths) => fake_paths,
            Err(_) => return Ok(()),
        };

        for fake_path in fake_paths {
            self.store.remove(&fake_path, Some(real_path))?;
            self.prune_cache(&fake_path);
            log::debug!("Removed {fake_path} (real path {real_path})");
        }

        let absolute = self.source.absolute_path(real_path);
        if let Err(error) = self.monitor.remove_source_file(&absolute).with_not_found() {
            log::warn!("Could not drop watch on {real_path}: {error}");
        }
        Ok(())
    }

    /// Re-runs add for a file whose tags changed. New permutations gain
    /// registrations; permutations the new tags no longer produce are
    /// deliberately left in place and only go away when the file itself
    /// is removed.
    fn update_source_file(&mut self, real_path: &str) -> Result<(), SyncError> {
        self.add_source_file(real_path)
    }

    /// Recursively registers a source directory. Existing registrations
    /// under it are removed first, so a re-add starts clean. A watch
    /// failure logs and omits the directory rather than failing the
    /// scan.
    fn add_source_dir(&mut self, real_path: &str) -> Result<(), SyncError> {
        self.remove_registrations_under(real_path)?;

        let absolute = self.source.absolute_path(real_path);
        match self.monitor.add_source_dir(&absolute) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => {
                log::warn!("Not adding directory {real_path}: watch failed: {error}");
                return Ok(());
            }
        }

        let children = match self.source.children(real_path) {
            Ok(children) => children,
            Err(error) => {
                log::warn!("Not scanning {real_path}: {error}");
                return Ok(());
            }
        };

        for child in children {
            if self
                .options
                .ignore
                .is_match(child.path.trim_start_matches('/'))
            {
                log::debug!("Ignoring {}", child.path);
                continue;
            }
            if child.is_dir {
                self.add_source_dir(&child.path)?;
            } else {
                self.add_source_file(&child.path)?;
            }
        }
        Ok(())
    }

    fn remove_source_dir(&mut self, real_path: &str) -> Result<(), SyncError> {
        self.remove_registrations_under(real_path)?;

        let absolute = self.source.absolute_path(real_path);
        if let Err(error) = self.monitor.remove_source_dir(&absolute).with_not_found() {
            log::warn!("Could not drop watch on {real_path}: {error}");
        }
        Ok(())
    }

    fn remove_registrations_under(&mut self, real_path: &str) -> Result<(), SyncError> {
        for sub_path in self.store.get_real_subpaths(real_path)? {
            self.remove_source_file(&sub_path)?;
        }
        Ok(())
    }

    /// Renames a virtual path by editing the tags it was derived from.
    ///
    /// The old and new path must have the same depth, and exactly the
    /// first differing segment is treated as the edit. Directory end
    /// points under the old path move immediately. File end points do
    /// not move here at all: their stored splitter parses the old and
    /// new segment text into tag values, the values are grouped and
    /// combined per real file, and the resulting three-way merge is
    /// written through the metadata store. The virtual tree catches up
    /// when that write comes back as a modification event.
    fn rename_path(&mut self, old_fake_path: &str, new_fake_path: &str) -> Result<(), SyncError> {
        let old_segments = split_segments(old_fake_path);
        let new_segments = split_segments(new_fake_path);

        if old_segments.len() != new_segments.len() {
            return Err(SyncError::InvalidArgument(format!(
                "{old_fake_path:?} and {new_fake_path:?} have different depths"
            )));
        }
        let index = old_segments
            .iter()
            .zip(&new_segments)
            .position(|(old, new)| old != new)
            .ok_or_else(|| {
                SyncError::InvalidArgument(format!(
                    "{old_fake_path:?} and {new_fake_path:?} are the same path"
                ))
            })?;
        let old_text = old_segments[index];
        let new_text = new_segments[index];

        let mut file_end_points = Vec::new();
        let mut directory_end_points = Vec::new();
        for end_point in self.store.get_end_points(old_fake_path)? {
            if self.store.is_file(&end_point) {
                file_end_points.push(end_point);
            } else {
                directory_end_points.push(end_point);
            }
        }

        // Parse the segment edit through each end point's splitter
        // before mutating anything, so a malformed new name aborts the
        // whole rename cleanly.
        let mut old_values_by_real: IndexMap<String, Vec<Values>> = IndexMap::new();
        let mut new_values_by_real: IndexMap<String, Vec<Values>> = IndexMap::new();
        for end_point in &file_end_points {
            let splitters = self.store.get_meta_data(end_point)?;
            let splitter = splitters.get(index).ok_or_else(|| {
                SyncError::InvalidArgument(format!("{end_point:?} has no pattern at this depth"))
            })?;

            // The old segment came out of the store, so a failed parse
            // here is corrupted state, not a bad argument.
            let old_values = Values::from_flat(splitter.split(old_text).map_err(|error| {
                SyncError::Io {
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("stored pattern for {end_point:?} no longer matches: {error}"),
                    ),
                }
            })?);
            let new_values = Values::from_flat(splitter.split(new_text).map_err(invalid_argument)?);

            let real_path = self.store.get_real_path(end_point)?.to_owned();
            old_values_by_real
                .entry(real_path.clone())
                .or_default()
                .push(old_values);
            new_values_by_real.entry(real_path).or_default().push(new_values);
        }

        for end_point in directory_end_points {
            let mut segments = split_segments(&end_point)
                .into_iter()
                .map(str::to_owned)
                .collect::<Vec<_>>();
            segments[index] = new_text.to_owned();
            let new_end_point = join_segments(&segments);

            self.store.remove(&end_point, None)?;
            self.prune_cache(&end_point);
            self.add_directory(&new_end_point)?;
        }

        for (real_path, old_group) in old_values_by_real {
            let new_group = new_values_by_real.shift_remove(&real_path).unwrap_or_default();
            let combined_old = Values::combine(old_group);
            let combined_new = Values::combine(new_group);

            let absolute = self.source.absolute_path(&real_path);
            let current = self.meta_store.get(&absolute);
            let merged = Values::diff3(&current, &combined_old, &combined_new);

            log::debug!("rename: writing {merged:?} for {real_path}");
            self.meta_store.set(&absolute, &merged).map_err(|error| match error {
                MetaError::UnsettableKey(_) => invalid_argument(error),
                MetaError::Io { source } => SyncError::Io { source },
            })?;
        }

        Ok(())
    }

    /// Creates an explicit virtual directory.
    ///
    /// The path must sit above the format's leaf depth, and its final
    /// segment must be parseable by the pattern at that depth, so that
    /// files tagged into it later round-trip.
    fn add_directory(&mut self, fake_path: &str) -> Result<(), SyncError> {
        let segments = split_segments(fake_path);
        let depth = segments.len();
        if depth == 0 || depth >= self.options.format.depth() {
            return Err(SyncError::InvalidArgument(format!(
                "cannot create {fake_path:?}: a {}-level format allows directories only above its leaves",
                self.options.format.depth()
            )));
        }

        let splitters = self
            .options
            .format
            .splitters(depth, &IndexMap::new())
            .map_err(invalid_argument)?;
        splitters[depth - 1]
            .split(segments[depth - 1])
            .map_err(invalid_argument)?;

        self.store.add_directory(fake_path)?;
        self.store.set_meta_data(fake_path, splitters)?;
        self.prune_cache(fake_path);
        Ok(())
    }

    fn remove_directory(&mut self, fake_path: &str) -> Result<(), SyncError> {
        self.store.remove(fake_path, None)?;
        self.prune_cache(fake_path);
        Ok(())
    }

    fn entries(&mut self, fake_path: &str) -> Result<Vec<String>, SyncError> {
        if let Some(cache) = &self.cache {
            if let Some(entries) = cache.entries(fake_path) {
                return Ok(entries.clone());
            }
        }

        let entries = self.store.get_entries(fake_path)?;
        if let Some(cache) = &mut self.cache {
            cache.store_entries(fake_path, entries.clone());
        }
        Ok(entries)
    }

    fn stat(&mut self, fake_path: &str) -> Result<PathStat, SyncError> {
        if let Some(cache) = &self.cache {
            if let Some(stat) = cache.stat(fake_path) {
                return Ok(stat.clone());
            }
        }

        let stat = if self.store.is_file(fake_path) {
            let real_path = self.store.get_real_path(fake_path)?;
            let metadata = self.source.symlink_metadata(real_path)?;
            PathStat {
                kind: PathKind::File,
                size: metadata.len(),
                readonly: metadata.permissions().readonly(),
                accessed: metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            }
        } else if self.store.is_dir(fake_path) {
            self.directory_stat(fake_path)?
        } else {
            return Err(StoreError::FakePathNotFound(fake_path.to_owned()).into());
        };

        if let Some(cache) = &mut self.cache {
            cache.store_stat(fake_path, stat.clone());
        }
        Ok(stat)
    }

    fn directory_stat(&self, fake_path: &str) -> Result<PathStat, SyncError> {
        let root = self.source.symlink_metadata("/")?;

        let mut accessed = None;
        let mut modified = None;
        for end_point in self.store.get_end_points(fake_path)? {
            if !self.store.is_file(&end_point) {
                continue;
            }
            let real_path = self.store.get_real_path(&end_point)?;
            let metadata = match self.source.symlink_metadata(real_path) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if let Ok(time) = metadata.accessed() {
                accessed = Some(accessed.map_or(time, |known: SystemTime| known.max(time)));
            }
            if let Ok(time) = metadata.modified() {
                modified = Some(modified.map_or(time, |known: SystemTime| known.max(time)));
            }
        }

        Ok(PathStat {
            kind: PathKind::Directory,
            size: 0,
            readonly: root.permissions().readonly(),
            accessed: accessed
                .or_else(|| root.accessed().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH),
            modified: modified
                .or_else(|| root.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    /// Touches the real paths behind a fake path. Empty directories have
    /// no real file of their own and fall through to the source root;
    /// occupied directories fan out over their end points.
    fn set_times(
        &mut self,
        fake_path: &str,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> Result<(), SyncError> {
        if self.store.is_file(fake_path) {
            let real_path = self.store.get_real_path(fake_path)?.to_owned();
            self.source.set_times(&real_path, accessed, modified)?;
        } else if self.store.is_empty_dir(fake_path) {
            self.source.set_times("/", accessed, modified)?;
        } else if self.store.is_dir(fake_path) {
            for end_point in self.store.get_end_points(fake_path)? {
                self.set_times(&end_point, accessed, modified)?;
            }
            return Ok(());
        } else {
            return Err(StoreError::FakePathNotFound(fake_path.to_owned()).into());
        }

        if let Some(cache) = &mut self.cache {
            cache.prune_stat_branch(fake_path);
        }
        Ok(())
    }

    /// Applies one monitor event. Collaborator failures are logged and
    /// the path is omitted; an event must never take the session down.
    fn dispatch_event(&mut self, event: MonitorEvent) {
        let relative = match self.source.relative_path(event.path()) {
            Ok(relative) => relative,
            Err(error) => {
                log::warn!("Ignoring event for {}: {error}", event.path().display());
                return;
            }
        };

        let result = match &event {
            MonitorEvent::Added(_) => match self.source.symlink_metadata(&relative) {
                Ok(metadata) if metadata.is_dir() => self.add_source_dir(&relative),
                Ok(_) => self.add_source_file(&relative),
                // Gone again already; clear whatever bookkeeping exists.
                Err(_) => self
                    .remove_source_file(&relative)
                    .and_then(|()| self.remove_source_dir(&relative)),
            },
            MonitorEvent::Removed(_) => self
                .remove_source_file(&relative)
                .and_then(|()| self.remove_source_dir(&relative)),
            MonitorEvent::Modified(_) => self.update_source_file(&relative),
            _ => {
                log::debug!("Ignoring unhandled event {event:?}");
                return;
            }
        };

        if let Err(error) = result {
            log::error!("Failed to process {event:?}: {error}");
        }
    }

    fn prune_cache(&mut self, fake_path: &str) {
        if let Some(cache) = &mut self.cache {
            cache.prune_branch(fake_path);
        }
    }
}

fn split_segments(fake_path: &str) -> Vec<&str> {
    fake_path.split('/').filter(|s| !s.is_empty()).collect()
}

fn join_segments(segments: &[String]) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(segment);
    }
    path
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use pretty_assertions::assert_eq;

    use crate::config::SyncConfig;
    use sourcefs::{InMemoryMonitor, InMemoryMonitorHandle, NoopMonitor};

    /// Metadata store over a shared in-memory map keyed by absolute
    /// path. Keys listed in `unsettable` refuse writes the way a
    /// derived-key store would.
    #[derive(Clone, Default)]
    struct MapMetaStore {
        map: Arc<Mutex<HashMap<PathBuf, Values>>>,
        unsettable: Arc<Mutex<Vec<&'static str>>>,
    }

    impl MapMetaStore {
        fn put(&self, path: &Path, entries: &[(&str, &[&str])]) {
            let values = entries
                .iter()
                .map(|(key, list)| {
                    (
                        key.to_string(),
                        list.iter().map(|v| v.to_string()).collect(),
                    )
                })
                .collect();
            self.map.lock().unwrap().insert(path.to_path_buf(), values);
        }
    }

    impl MetaStore for MapMetaStore {
        fn get(&self, path: &Path) -> Values {
            self.map
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default()
        }

        fn set(&self, path: &Path, values: &Values) -> Result<Vec<String>, MetaError> {
            let mut applied = Vec::new();
            let mut map = self.map.lock().unwrap();
            let stored = map.entry(path.to_path_buf()).or_default();
            for (key, list) in values {
                if self.unsettable.lock().unwrap().contains(&key.as_str()) {
                    return Err(MetaError::UnsettableKey(key.clone()));
                }
                if list.is_empty() {
                    stored.remove(key);
                } else {
                    stored.insert(key.clone(), list.clone());
                }
                applied.push(key.clone());
            }
            Ok(applied)
        }
    }

    struct Fixture {
        session: SyncSession,
        meta: MapMetaStore,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(format: &str) -> Self {
            Self::with_config(SyncConfig::new(format))
        }

        fn with_config(config: SyncConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let meta = MapMetaStore::default();
            let session = SyncSession::new(
                SourceTree::new(dir.path()).unwrap(),
                Box::new(meta.clone()),
                Box::new(NoopMonitor::new()),
                config.build().unwrap(),
            );
            Self { session, meta, dir }
        }

        /// Like `with_config`, but with a monitor whose watch state the
        /// test can inspect.
        fn with_monitor(config: SyncConfig) -> (Self, InMemoryMonitorHandle) {
            let dir = tempfile::tempdir().unwrap();
            let meta = MapMetaStore::default();
            let monitor = InMemoryMonitor::new();
            let handle = monitor.handle();
            let session = SyncSession::new(
                SourceTree::new(dir.path()).unwrap(),
                Box::new(meta.clone()),
                Box::new(monitor),
                config.build().unwrap(),
            );
            (Self { session, meta, dir }, handle)
        }

        /// Creates a real file and tags it in the metadata store.
        fn tagged_file(&self, name: &str, entries: &[(&str, &[&str])]) -> String {
            let absolute = self.dir.path().join(name);
            fs_err::write(&absolute, "contents").unwrap();
            self.meta.put(&absolute, entries);
            format!("/{name}")
        }
    }

    #[test]
    fn tags_become_virtual_paths() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );

        fixture.session.add_source_file(&real).unwrap();

        assert_eq!(
            fixture.session.get_real_path("/bar/baz.ext").unwrap(),
            real
        );
        assert_eq!(
            fixture.session.get_entries("/bar").unwrap(),
            vec!["baz.ext".to_owned()]
        );
    }

    #[test]
    fn double_add_is_a_no_op() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );

        fixture.session.add_source_file(&real).unwrap();
        fixture.session.add_source_file(&real).unwrap();

        assert_eq!(
            fixture.session.get_fake_paths(&real).unwrap(),
            vec!["/bar/baz.ext".to_owned()]
        );
    }

    #[test]
    fn multi_valued_tags_expand_to_every_permutation() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["foo", "bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );

        fixture.session.add_source_file(&real).unwrap();

        assert_eq!(
            fixture.session.get_fake_paths(&real).unwrap(),
            vec!["/foo/baz.ext".to_owned(), "/bar/baz.ext".to_owned()]
        );

        fixture.session.remove_source_file(&real).unwrap();
        assert!(!fixture.session.path_exists("/foo/baz.ext"));
        assert!(!fixture.session.path_exists("/bar/baz.ext"));
        assert!(!fixture.session.path_exists("/foo"));
    }

    #[test]
    fn missing_tags_skip_the_file_without_error() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file("song", &[("a", &["bar"])]);

        fixture.session.add_source_file(&real).unwrap();

        assert!(fixture.session.get_fake_paths(&real).is_err());
        assert_eq!(
            fixture.session.get_entries("/").unwrap(),
            Vec::<String>::new()
        );
    }

    #[test]
    fn symlinks_are_skipped() {
        let fixture = Fixture::new("/%a");
        let real = fixture.tagged_file("song", &[("a", &["bar"])]);
        let link = fixture.dir.path().join("link");
        std::os::unix::fs::symlink(fixture.dir.path().join("song"), &link).unwrap();
        fixture
            .meta
            .put(&link, &[("a", &["linked"])]);

        fixture.session.add_source_file("/link").unwrap();
        fixture.session.add_source_file(&real).unwrap();

        assert!(!fixture.session.path_exists("/linked"));
        assert!(fixture.session.path_exists("/bar"));
    }

    #[test]
    fn a_rejected_candidate_stops_later_candidates_too() {
        let mut config = SyncConfig::new("/%a/%t.%e");
        config.mount_filters.push("!^/foo/".to_owned());
        let fixture = Fixture::with_config(config);
        let real = fixture.tagged_file(
            "song",
            &[("a", &["kept", "foo", "late"]), ("t", &["baz"]), ("e", &["ext"])],
        );

        fixture.session.add_source_file(&real).unwrap();

        // The first candidate registered, the filtered one and everything
        // after it did not.
        assert_eq!(
            fixture.session.get_fake_paths(&real).unwrap(),
            vec!["/kept/baz.ext".to_owned()]
        );
        assert!(!fixture.session.path_exists("/late/baz.ext"));
    }

    #[test]
    fn fully_filtered_files_are_never_watched() {
        let mut config = SyncConfig::new("/%a");
        config.mount_filters.push("!^/skip".to_owned());
        let (fixture, handle) = Fixture::with_monitor(config);
        let real = fixture.tagged_file("song", &[("a", &["skipped"])]);

        fixture.session.add_source_file(&real).unwrap();

        assert!(!fixture.session.path_exists("/skipped"));
        assert!(handle.watched_files().is_empty());
    }

    #[test]
    fn watches_follow_registrations() {
        let (fixture, handle) = Fixture::with_monitor(SyncConfig::new("/%a"));
        let real = fixture.tagged_file("song", &[("a", &["bar"])]);
        let absolute = fixture.dir.path().join("song");

        fixture.session.add_source_file(&real).unwrap();
        assert_eq!(handle.watched_files(), vec![absolute]);

        fixture.session.remove_source_file(&real).unwrap();
        assert!(handle.watched_files().is_empty());

        // A watch that is already gone drops quietly.
        fixture.session.remove_source_dir("/never-watched").unwrap();
    }

    #[test]
    fn source_filters_see_the_real_path() {
        let mut config = SyncConfig::new("/%a");
        config.source_filters.push(r"\.ogg$".to_owned());
        let fixture = Fixture::with_config(config);

        let kept = fixture.tagged_file("song.ogg", &[("a", &["kept"])]);
        let dropped = fixture.tagged_file("song.mp3", &[("a", &["dropped"])]);

        fixture.session.add_source_file(&kept).unwrap();
        fixture.session.add_source_file(&dropped).unwrap();

        assert!(fixture.session.path_exists("/kept"));
        assert!(!fixture.session.path_exists("/dropped"));
    }

    #[test]
    fn files_with_equal_tags_stack_on_one_fake_path() {
        let fixture = Fixture::new("/%a/%t.%e");
        let first = fixture.tagged_file(
            "one",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        let second = fixture.tagged_file(
            "two",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );

        fixture.session.add_source_file(&first).unwrap();
        fixture.session.add_source_file(&second).unwrap();
        assert_eq!(
            fixture.session.get_real_path("/bar/baz.ext").unwrap(),
            second
        );

        fixture.session.remove_source_file(&second).unwrap();
        assert_eq!(
            fixture.session.get_real_path("/bar/baz.ext").unwrap(),
            first
        );

        fixture.session.remove_source_file(&first).unwrap();
        assert!(!fixture.session.path_exists("/bar"));
    }

    #[test]
    fn scan_walks_the_source_tree() {
        let fixture = Fixture::new("/%a/%t.%e");
        fs_err::create_dir(fixture.dir.path().join("albums")).unwrap();
        let nested = fixture.dir.path().join("albums").join("song");
        fs_err::write(&nested, "contents").unwrap();
        fixture.meta.put(
            &nested,
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );

        fixture.session.add_source_dir("/").unwrap();

        assert_eq!(
            fixture.session.get_real_path("/bar/baz.ext").unwrap(),
            "/albums/song"
        );

        fixture.session.remove_source_dir("/albums").unwrap();
        assert!(!fixture.session.path_exists("/bar"));
    }

    #[test]
    fn ignored_globs_are_not_scanned() {
        let mut config = SyncConfig::new("/%a");
        config.ignore.push("*.bak".to_owned());
        let fixture = Fixture::with_config(config);
        fixture.tagged_file("song", &[("a", &["kept"])]);
        fixture.tagged_file("stale.bak", &[("a", &["stale"])]);

        fixture.session.add_source_dir("/").unwrap();

        assert!(fixture.session.path_exists("/kept"));
        assert!(!fixture.session.path_exists("/stale"));
    }

    #[test]
    fn renaming_a_file_writes_the_tag_change_through() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        fixture
            .session
            .rename_path("/bar/baz.ext", "/bar/qux.ext")
            .unwrap();

        let absolute = fixture.dir.path().join("song");
        let written = fixture.meta.get(&absolute);
        assert_eq!(written.get("t"), Some(&["qux".to_owned()][..]));
        assert_eq!(written.get("a"), Some(&["bar".to_owned()][..]));

        // The virtual tree is untouched until the metadata write comes
        // back as a modification event.
        assert!(fixture.session.path_exists("/bar/baz.ext"));
        fixture.session.update_source_file(&real).unwrap();
        assert!(fixture.session.path_exists("/bar/qux.ext"));
    }

    #[test]
    fn renaming_a_directory_rewrites_every_file_below_it() {
        let fixture = Fixture::new("/%a/%t.%e");
        let first = fixture.tagged_file(
            "one",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        let second = fixture.tagged_file(
            "two",
            &[("a", &["bar"]), ("t", &["qux"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&first).unwrap();
        fixture.session.add_source_file(&second).unwrap();

        fixture.session.rename_path("/bar", "/rock").unwrap();

        for name in ["one", "two"] {
            let written = fixture.meta.get(&fixture.dir.path().join(name));
            assert_eq!(written.get("a"), Some(&["rock".to_owned()][..]));
        }
    }

    #[test]
    fn renaming_a_shared_real_path_merges_the_group() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["foo", "bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        fixture.session.rename_path("/foo", "/qux").unwrap();

        let written = fixture.meta.get(&fixture.dir.path().join("song"));
        assert_eq!(
            written.get("a"),
            Some(&["bar".to_owned(), "qux".to_owned()][..])
        );
    }

    #[test]
    fn rename_depth_mismatch_is_an_argument_error() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        let result = fixture.session.rename_path("/bar/baz.ext", "/qux");
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn rename_of_a_missing_path_fails() {
        let fixture = Fixture::new("/%a");

        let result = fixture.session.rename_path("/missing", "/other");
        assert!(matches!(
            result,
            Err(SyncError::Store {
                source: StoreError::FakePathNotFound(_)
            })
        ));
    }

    #[test]
    fn rename_onto_an_unsettable_key_is_an_argument_error() {
        let fixture = Fixture::new("/%a/%t.%e");
        fixture.meta.unsettable.lock().unwrap().push("t");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        let result = fixture.session.rename_path("/bar/baz.ext", "/bar/qux.ext");
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn unparseable_new_names_are_argument_errors() {
        let fixture = Fixture::new("/const-%a/%t");
        let real = fixture.tagged_file("song", &[("a", &["x"]), ("t", &["y"])]);
        fixture.session.add_source_file(&real).unwrap();

        // "zzz" lacks the literal prefix, so the segment pattern cannot
        // take it apart.
        let result = fixture.session.rename_path("/const-x", "/zzz");
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));

        // The tree and tags are untouched.
        assert!(fixture.session.path_exists("/const-x/y"));
        assert_eq!(
            fixture.meta.get(&fixture.dir.path().join("song")).get("a"),
            Some(&["x".to_owned()][..])
        );
    }

    #[test]
    fn explicit_directories_validate_depth_and_name() {
        let fixture = Fixture::new("/%a/%t.%e");

        fixture.session.add_directory("/bar").unwrap();
        assert!(fixture.session.is_empty_dir("/bar"));

        // Leaf depth is reserved for files.
        let result = fixture.session.add_directory("/bar/baz.ext");
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));

        fixture.session.remove_directory("/bar").unwrap();
        assert!(!fixture.session.path_exists("/bar"));
    }

    #[test]
    fn explicit_directory_names_must_parse() {
        let fixture = Fixture::new("/const-%a/%t/%e");

        fixture.session.add_directory("/const-x").unwrap();

        let result = fixture.session.add_directory("/unrelated");
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn empty_directory_renames_move_immediately() {
        let fixture = Fixture::new("/%a/%t.%e");
        fixture.session.add_directory("/bar").unwrap();

        fixture.session.rename_path("/bar", "/qux").unwrap();

        assert!(fixture.session.is_empty_dir("/qux"));
        assert!(!fixture.session.path_exists("/bar"));
    }

    #[test]
    fn update_does_not_prune_stale_permutations() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["foo", "bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        let absolute = fixture.dir.path().join("song");
        fixture.meta.put(
            &absolute,
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.update_source_file(&real).unwrap();

        // The permutation the shrunken tag set no longer produces stays
        // registered until the file itself goes away.
        assert!(fixture.session.path_exists("/foo/baz.ext"));
        assert!(fixture.session.path_exists("/bar/baz.ext"));
    }

    #[test]
    fn cached_entries_are_invalidated_by_mutations() {
        let fixture = Fixture::new("/%a/%t.%e");
        let first = fixture.tagged_file(
            "one",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&first).unwrap();

        // Prime the cache.
        assert_eq!(
            fixture.session.get_entries("/bar").unwrap(),
            vec!["baz.ext".to_owned()]
        );

        let second = fixture.tagged_file(
            "two",
            &[("a", &["bar"]), ("t", &["qux"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&second).unwrap();

        assert_eq!(
            fixture.session.get_entries("/bar").unwrap(),
            vec!["baz.ext".to_owned(), "qux.ext".to_owned()]
        );
    }

    #[test]
    fn stat_reports_files_and_synthesizes_directories() {
        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        let file_stat = fixture.session.stat("/bar/baz.ext").unwrap();
        assert_eq!(file_stat.kind, PathKind::File);
        assert_eq!(file_stat.size, "contents".len() as u64);

        let dir_stat = fixture.session.stat("/bar").unwrap();
        assert_eq!(dir_stat.kind, PathKind::Directory);
        assert_eq!(dir_stat.size, 0);
        assert_eq!(dir_stat.modified, file_stat.modified);

        assert!(matches!(
            fixture.session.stat("/missing"),
            Err(SyncError::Store {
                source: StoreError::FakePathNotFound(_)
            })
        ));
    }

    #[test]
    fn set_times_touches_the_real_file() {
        use std::time::Duration;

        let fixture = Fixture::new("/%a/%t.%e");
        let real = fixture.tagged_file(
            "song",
            &[("a", &["bar"]), ("t", &["baz"]), ("e", &["ext"])],
        );
        fixture.session.add_source_file(&real).unwrap();

        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        fixture
            .session
            .set_times("/bar/baz.ext", stamp, stamp)
            .unwrap();

        let metadata = fs_err::metadata(fixture.dir.path().join("song")).unwrap();
        assert_eq!(metadata.modified().unwrap(), stamp);

        // Stat results were pruned, not served stale.
        assert_eq!(fixture.session.stat("/bar/baz.ext").unwrap().modified, stamp);
    }
}
