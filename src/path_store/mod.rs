//! The virtual tree at the center of a sync session.
//!
//! A `PathStore` maps fake paths (the paths a mounted tree presents) to
//! real paths (the files behind them) in both directions, and maintains
//! the directory structure implied by the fake paths. Directories exist
//! only while something references them: registering a file creates the
//! directories above it, and removing the last file under a directory
//! removes the directory too. The root directory `/` always exists.
//!
//! A fake path may be registered more than once. Registrations stack,
//! lookups resolve to the most recent one, and older registrations
//! reappear as newer ones are removed. Each end point (a file or an
//! empty directory) can carry a piece of metadata of type `M`.

mod entry_store;
mod mapping;

use std::io;

use thiserror::Error;

use self::entry_store::EntryStore;
use self::mapping::PathMapping;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fake path {0:?} does not exist")]
    FakePathNotFound(String),

    #[error("real path {0:?} does not exist")]
    RealPathNotFound(String),

    #[error("{0:?} is not a directory")]
    NotADirectory(String),

    #[error("{0:?} is a directory")]
    IsADirectory(String),

    #[error("{0:?} already exists")]
    PathExists(String),

    #[error("directory {0:?} is not empty")]
    DirectoryNotEmpty(String),

    #[error("{0:?} is not an end point")]
    NotAnEndPoint(String),

    #[error("no metadata exists for {0:?}")]
    NoMetaData(String),

    #[error("{fake_path:?} is already mapped to {real_path:?}")]
    AlreadyMapped { fake_path: String, real_path: String },

    #[error("invalid path {0:?}")]
    InvalidPath(String),
}

impl From<StoreError> for io::Error {
    fn from(error: StoreError) -> Self {
        let kind = match &error {
            StoreError::FakePathNotFound(_)
            | StoreError::RealPathNotFound(_)
            | StoreError::NoMetaData(_) => io::ErrorKind::NotFound,
            StoreError::NotADirectory(_) => io::ErrorKind::NotADirectory,
            StoreError::IsADirectory(_) => io::ErrorKind::IsADirectory,
            StoreError::PathExists(_) | StoreError::AlreadyMapped { .. } => {
                io::ErrorKind::AlreadyExists
            }
            StoreError::DirectoryNotEmpty(_) => io::ErrorKind::DirectoryNotEmpty,
            StoreError::NotAnEndPoint(_) | StoreError::InvalidPath(_) => {
                io::ErrorKind::InvalidInput
            }
        };
        io::Error::new(kind, error)
    }
}

pub struct PathStore<M> {
    mapping: PathMapping<M>,
    entries: EntryStore<M>,
}

impl<M> Default for PathStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> PathStore<M> {
    pub fn new() -> Self {
        Self {
            mapping: PathMapping::new(),
            entries: EntryStore::new(),
        }
    }

    /// Registers `real_path` under `fake_path`.
    ///
    /// If the fake path is already a file, the new registration stacks on
    /// top of the existing ones and becomes the one lookups resolve to.
    /// Registering the real path that is already on top fails with
    /// `AlreadyMapped`.
    pub fn add_file(&mut self, fake_path: &str, real_path: &str) -> Result<(), StoreError> {
        validate_path(fake_path)?;
        validate_path(real_path)?;
        if self.is_dir(fake_path) {
            return Err(StoreError::PathExists(fake_path.to_owned()));
        }
        self.must_have_directory_ancestors(fake_path)?;
        if let Some(frame) = self.mapping.top(fake_path) {
            if frame.real == real_path {
                return Err(StoreError::AlreadyMapped {
                    fake_path: fake_path.to_owned(),
                    real_path: real_path.to_owned(),
                });
            }
        }

        self.mapping.add(fake_path, real_path);
        self.add_chain(fake_path);
        Ok(())
    }

    /// Creates an empty directory at `fake_path`, along with any missing
    /// directories above it.
    pub fn add_directory(&mut self, fake_path: &str) -> Result<(), StoreError> {
        validate_path(fake_path)?;
        if fake_path == "/" || self.path_exists(fake_path) {
            return Err(StoreError::PathExists(fake_path.to_owned()));
        }
        self.must_have_directory_ancestors(fake_path)?;

        self.add_chain(fake_path);
        self.entries.add_directory_key(fake_path);
        Ok(())
    }

    /// Removes a file registration or an empty directory.
    ///
    /// For files, `real_path` selects which registration to drop: the
    /// first one holding that real path, or the top of the stack when
    /// `None`. Directories must be empty and take no `real_path`.
    pub fn remove(&mut self, fake_path: &str, real_path: Option<&str>) -> Result<(), StoreError> {
        validate_path(fake_path)?;
        if self.is_dir(fake_path) {
            if real_path.is_some() {
                return Err(StoreError::IsADirectory(fake_path.to_owned()));
            }
            if !self.is_empty_dir(fake_path) {
                return Err(StoreError::DirectoryNotEmpty(fake_path.to_owned()));
            }
            return self.remove_directory(fake_path);
        }
        if self.is_file(fake_path) {
            return self.remove_file(fake_path, real_path);
        }
        Err(StoreError::FakePathNotFound(fake_path.to_owned()))
    }

    /// Renames an end point. Directories must be empty; files carry only
    /// their top registration to the new name, and older registrations
    /// stay behind under the old name. Metadata does not survive a
    /// rename.
    pub fn rename(&mut self, fake_path: &str, new_fake_path: &str) -> Result<(), StoreError> {
        validate_path(fake_path)?;
        validate_path(new_fake_path)?;
        if fake_path == "/" || new_fake_path == "/" || fake_path == new_fake_path {
            return Err(StoreError::InvalidPath(new_fake_path.to_owned()));
        }
        if self.is_dir(fake_path) {
            return self.rename_directory(fake_path, new_fake_path);
        }
        if self.is_file(fake_path) {
            return self.rename_file(fake_path, new_fake_path);
        }
        Err(StoreError::FakePathNotFound(fake_path.to_owned()))
    }

    /// The real path behind `fake_path`, from its most recent
    /// registration.
    pub fn get_real_path(&self, fake_path: &str) -> Result<&str, StoreError> {
        validate_path(fake_path)?;
        match self.mapping.top(fake_path) {
            Some(frame) => Ok(frame.real.as_str()),
            None if self.is_dir(fake_path) => {
                Err(StoreError::IsADirectory(fake_path.to_owned()))
            }
            None => Err(StoreError::FakePathNotFound(fake_path.to_owned())),
        }
    }

    /// All fake paths registered for `real_path`, oldest first.
    pub fn get_fake_paths(&self, real_path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(real_path)?;
        match self.mapping.fake_paths(real_path) {
            Some(fake_paths) => Ok(fake_paths.to_vec()),
            None => Err(StoreError::RealPathNotFound(real_path.to_owned())),
        }
    }

    /// All registered real paths strictly below `real_path`, in
    /// registration order.
    pub fn get_real_subpaths(&self, real_path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(real_path)?;
        let prefix = if real_path == "/" {
            "/".to_owned()
        } else {
            format!("{}/", real_path)
        };
        Ok(self
            .mapping
            .real_paths()
            .filter(|registered| registered.starts_with(&prefix))
            .cloned()
            .collect())
    }

    /// The names in a directory, duplicates collapsed.
    pub fn get_entries(&self, fake_path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(fake_path)?;
        match self.entries.unique_entries(fake_path) {
            Some(entries) => Ok(entries),
            None if self.is_file(fake_path) => {
                Err(StoreError::NotADirectory(fake_path.to_owned()))
            }
            None => Err(StoreError::FakePathNotFound(fake_path.to_owned())),
        }
    }

    /// The end points at or below `fake_path`: the path itself for files
    /// and empty directories, otherwise every file and empty directory
    /// underneath, depth first in listing order.
    pub fn get_end_points(&self, fake_path: &str) -> Result<Vec<String>, StoreError> {
        if self.is_file(fake_path) {
            return Ok(vec![fake_path.to_owned()]);
        }
        let entries = self.get_entries(fake_path)?;
        if entries.is_empty() {
            return Ok(vec![fake_path.to_owned()]);
        }

        let mut end_points = Vec::new();
        for entry in entries {
            let child = join_child(fake_path, &entry);
            end_points.extend(self.get_end_points(&child)?);
        }
        Ok(end_points)
    }

    pub fn is_file(&self, fake_path: &str) -> bool {
        self.mapping.contains_fake_path(fake_path)
    }

    pub fn is_dir(&self, fake_path: &str) -> bool {
        self.entries.contains_directory(fake_path)
    }

    pub fn is_empty_dir(&self, fake_path: &str) -> bool {
        match self.entries.all_entries(fake_path) {
            Some(entries) => entries.is_empty(),
            None => false,
        }
    }

    pub fn path_exists(&self, fake_path: &str) -> bool {
        self.is_file(fake_path) || self.is_dir(fake_path)
    }

    /// Attaches metadata to the end point at `fake_path`, replacing any
    /// previous metadata. For files it lives on the top registration.
    pub fn set_meta_data(&mut self, fake_path: &str, meta_data: M) -> Result<(), StoreError> {
        self.must_be_end_point(fake_path)?;
        if let Some(frame) = self.mapping.top_mut(fake_path) {
            frame.meta = Some(meta_data);
        } else {
            self.entries.set_directory_meta(fake_path, meta_data);
        }
        Ok(())
    }

    pub fn get_meta_data(&self, fake_path: &str) -> Result<&M, StoreError> {
        self.must_be_end_point(fake_path)?;
        let meta_data = match self.mapping.top(fake_path) {
            Some(frame) => frame.meta.as_ref(),
            None => self.entries.directory_meta(fake_path),
        };
        meta_data.ok_or_else(|| StoreError::NoMetaData(fake_path.to_owned()))
    }

    pub fn unset_meta_data(&mut self, fake_path: &str) -> Result<(), StoreError> {
        self.must_be_end_point(fake_path)?;
        let removed = match self.mapping.top_mut(fake_path) {
            Some(frame) => frame.meta.take().is_some(),
            None => self.entries.take_directory_meta(fake_path).is_some(),
        };
        if !removed {
            return Err(StoreError::NoMetaData(fake_path.to_owned()));
        }
        Ok(())
    }

    fn must_be_end_point(&self, fake_path: &str) -> Result<(), StoreError> {
        validate_path(fake_path)?;
        if self.is_file(fake_path) || self.is_empty_dir(fake_path) {
            return Ok(());
        }
        if self.is_dir(fake_path) {
            return Err(StoreError::NotAnEndPoint(fake_path.to_owned()));
        }
        Err(StoreError::FakePathNotFound(fake_path.to_owned()))
    }

    fn must_have_directory_ancestors(&self, fake_path: &str) -> Result<(), StoreError> {
        for (directory, _) in chain_pairs(fake_path) {
            if self.is_file(&directory) {
                return Err(StoreError::NotADirectory(directory));
            }
        }
        Ok(())
    }

    fn remove_file(&mut self, fake_path: &str, real_path: Option<&str>) -> Result<(), StoreError> {
        match self.mapping.remove(fake_path, real_path) {
            Some(_) => {}
            None => match real_path {
                Some(real_path) => {
                    return Err(StoreError::RealPathNotFound(real_path.to_owned()))
                }
                None => return Err(StoreError::FakePathNotFound(fake_path.to_owned())),
            },
        }
        self.remove_chain(fake_path);
        Ok(())
    }

    fn remove_directory(&mut self, fake_path: &str) -> Result<(), StoreError> {
        if fake_path == "/" {
            return Err(StoreError::InvalidPath(fake_path.to_owned()));
        }
        self.entries.remove_directory_key(fake_path);
        self.remove_chain(fake_path);
        Ok(())
    }

    fn rename_file(&mut self, fake_path: &str, new_fake_path: &str) -> Result<(), StoreError> {
        let real_path = self.get_real_path(fake_path)?.to_owned();
        if self.is_dir(new_fake_path) {
            return Err(StoreError::PathExists(new_fake_path.to_owned()));
        }

        let (directory, entry) = split_parent(fake_path);
        let (new_directory, new_entry) = split_parent(new_fake_path);
        if directory == new_directory {
            // The entry is swapped in place so the new name keeps the old
            // name's position in the listing.
            self.entries.replace_entry(directory, entry, new_entry);
            self.mapping.remove(fake_path, Some(&real_path));
            self.mapping.add(new_fake_path, &real_path);
        } else {
            self.remove_file(fake_path, Some(&real_path))?;
            self.add_file(new_fake_path, &real_path)?;
        }
        Ok(())
    }

    fn rename_directory(&mut self, fake_path: &str, new_fake_path: &str) -> Result<(), StoreError> {
        if !self.is_empty_dir(fake_path) {
            return Err(StoreError::NotAnEndPoint(fake_path.to_owned()));
        }
        if self.path_exists(new_fake_path) {
            return Err(StoreError::PathExists(new_fake_path.to_owned()));
        }

        let (directory, entry) = split_parent(fake_path);
        let (new_directory, new_entry) = split_parent(new_fake_path);
        if directory == new_directory {
            self.entries.remove_directory_key(fake_path);
            self.entries.replace_entry(directory, entry, new_entry);
            self.entries.add_directory_key(new_fake_path);
        } else {
            self.remove_directory(fake_path)?;
            self.add_directory(new_fake_path)?;
        }
        Ok(())
    }

    /// Adds one entry occurrence for each level of `fake_path`, creating
    /// missing directories. An existing empty directory on the way is
    /// converted: its own reference chain is released, and from then on
    /// the directory lives and dies with its contents.
    fn add_chain(&mut self, fake_path: &str) {
        for (directory, entry) in chain_pairs(fake_path) {
            if !self.entries.contains_directory(&directory) {
                self.entries.add_directory_key(&directory);
            } else if directory != "/" && self.is_empty_dir(&directory) {
                self.remove_chain(&directory);
                self.entries.take_directory_meta(&directory);
            }
            self.entries.add_entry(&directory, &entry);
        }
    }

    /// Removes one entry occurrence for each level of `fake_path` and
    /// drops directories emptied by that.
    fn remove_chain(&mut self, fake_path: &str) {
        let pairs = chain_pairs(fake_path);
        for (directory, entry) in pairs.iter().rev() {
            self.entries.remove_entry(directory, entry);
        }
        for (directory, _) in &pairs {
            if directory != "/" && self.is_empty_dir(directory) {
                self.entries.remove_directory_key(directory);
            }
        }
    }
}

/// Splits a fake path into its parent directory and entry name.
fn split_parent(fake_path: &str) -> (&str, &str) {
    match fake_path.rfind('/') {
        Some(0) => ("/", &fake_path[1..]),
        Some(index) => (&fake_path[..index], &fake_path[index + 1..]),
        None => ("/", fake_path),
    }
}

fn join_child(directory: &str, entry: &str) -> String {
    if directory == "/" {
        format!("/{}", entry)
    } else {
        format!("{}/{}", directory, entry)
    }
}

/// The (directory, entry) pairs leading to `fake_path`, root first. For
/// `/a/b/c` this is `("/", "a")`, `("/a", "b")`, `("/a/b", "c")`.
fn chain_pairs(fake_path: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut path = fake_path;
    while path != "/" && !path.is_empty() {
        let (directory, entry) = split_parent(path);
        pairs.push((directory.to_owned(), entry.to_owned()));
        path = directory;
    }
    pairs.reverse();
    pairs
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(())
}
