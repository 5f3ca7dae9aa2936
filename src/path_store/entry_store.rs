//! Directory listing storage for the virtual tree.

use indexmap::IndexMap;

/// Maps each known directory to its entry names, and empty directories
/// to their metadata.
///
/// Entry lists permit duplicates on purpose: every file registration
/// appends one occurrence per ancestor level, every removal takes one
/// occurrence back out, so the number of occurrences of a name is the
/// number of registrations keeping it alive. Readers collapse the
/// duplicates through [`EntryStore::unique_entries`].
pub(super) struct EntryStore<M> {
    entries: IndexMap<String, Vec<String>>,
    directory_meta: IndexMap<String, M>,
}

impl<M> EntryStore<M> {
    pub fn new() -> Self {
        let mut entries = IndexMap::new();
        entries.insert("/".to_owned(), Vec::new());
        Self {
            entries,
            directory_meta: IndexMap::new(),
        }
    }

    pub fn contains_directory(&self, directory: &str) -> bool {
        self.entries.contains_key(directory)
    }

    pub fn add_directory_key(&mut self, directory: &str) {
        self.entries.entry(directory.to_owned()).or_default();
    }

    pub fn remove_directory_key(&mut self, directory: &str) {
        self.entries.shift_remove(directory);
        self.directory_meta.shift_remove(directory);
    }

    pub fn add_entry(&mut self, directory: &str, entry: &str) {
        if let Some(list) = self.entries.get_mut(directory) {
            list.push(entry.to_owned());
        }
    }

    /// Removes the last occurrence of `entry` from the directory's list.
    pub fn remove_entry(&mut self, directory: &str, entry: &str) {
        if let Some(list) = self.entries.get_mut(directory) {
            if let Some(index) = list.iter().rposition(|existing| existing == entry) {
                list.remove(index);
            }
        }
    }

    /// Replaces the last occurrence of `entry` in place, preserving its
    /// position in the listing.
    pub fn replace_entry(&mut self, directory: &str, entry: &str, new_entry: &str) {
        if let Some(list) = self.entries.get_mut(directory) {
            if let Some(index) = list.iter().rposition(|existing| existing == entry) {
                list[index] = new_entry.to_owned();
            }
        }
    }

    pub fn all_entries(&self, directory: &str) -> Option<&[String]> {
        self.entries.get(directory).map(Vec::as_slice)
    }

    /// The directory's entries with duplicates collapsed. Each name keeps
    /// the position of its last occurrence.
    pub fn unique_entries(&self, directory: &str) -> Option<Vec<String>> {
        let list = self.entries.get(directory)?;

        let mut unique: Vec<String> = Vec::with_capacity(list.len());
        for entry in list {
            if let Some(index) = unique.iter().position(|existing| existing == entry) {
                unique.remove(index);
            }
            unique.push(entry.clone());
        }
        Some(unique)
    }

    pub fn set_directory_meta(&mut self, directory: &str, meta_data: M) {
        self.directory_meta.insert(directory.to_owned(), meta_data);
    }

    pub fn directory_meta(&self, directory: &str) -> Option<&M> {
        self.directory_meta.get(directory)
    }

    pub fn take_directory_meta(&mut self, directory: &str) -> Option<M> {
        self.directory_meta.shift_remove(directory)
    }
}
