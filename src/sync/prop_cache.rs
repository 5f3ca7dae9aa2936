//! Cached per-path properties of the virtual tree.

use std::collections::HashMap;

use super::PathStat;

/// Caches computed directory listings and stat results by fake path.
///
/// Invalidation is coarse on purpose: any structural mutation prunes the
/// mutated path and every ancestor up to the root, which over-discards
/// but can never serve a stale answer.
#[derive(Default)]
pub struct PathPropCache {
    entries: HashMap<String, Vec<String>>,
    stats: HashMap<String, PathStat>,
}

impl PathPropCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, fake_path: &str) -> Option<&Vec<String>> {
        self.entries.get(fake_path)
    }

    pub fn store_entries(&mut self, fake_path: &str, entries: Vec<String>) {
        self.entries.insert(fake_path.to_owned(), entries);
    }

    pub fn stat(&self, fake_path: &str) -> Option<&PathStat> {
        self.stats.get(fake_path)
    }

    pub fn store_stat(&mut self, fake_path: &str, stat: PathStat) {
        self.stats.insert(fake_path.to_owned(), stat);
    }

    /// Drops everything cached for `fake_path` and its ancestors.
    pub fn prune_branch(&mut self, fake_path: &str) {
        for ancestor in branch(fake_path) {
            self.entries.remove(ancestor);
            self.stats.remove(ancestor);
        }
    }

    /// Drops only the stat results for `fake_path` and its ancestors.
    /// Used by time updates, which change no listing.
    pub fn prune_stat_branch(&mut self, fake_path: &str) {
        for ancestor in branch(fake_path) {
            self.stats.remove(ancestor);
        }
    }
}

/// The path itself and every ancestor, ending at `/`.
fn branch(fake_path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(fake_path);
    std::iter::from_fn(move || {
        let current = next?;
        next = match current.rfind('/') {
            Some(0) if current != "/" => Some("/"),
            Some(index) if index > 0 => Some(&current[..index]),
            _ => None,
        };
        Some(current)
    })
}
