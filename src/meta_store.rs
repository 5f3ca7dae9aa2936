//! Metadata back-ends.
//!
//! A `MetaStore` reads and writes the key/value pairs behind a real
//! file. Stores compose through `DelegateMetaStore`, which fans reads
//! and writes out across an ordered chain: reads merge with later
//! stores winning, writes stop handing a key onward once some store has
//! claimed it.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::values::Values;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("can't set key {0}")]
    UnsettableKey(String),

    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },
}

pub trait MetaStore: Send + 'static {
    /// Every key/value pair known for the file at `path`.
    ///
    /// Returns empty values when the file does not exist or no tags can
    /// be read from it with this store.
    fn get(&self, path: &Path) -> Values;

    /// Applies `values` to the file at `path` and returns the keys this
    /// store handled. A key with an empty value list is a deletion.
    ///
    /// Stores may claim keys without writing anything. Claimed keys are
    /// not offered to stores later in a delegate chain.
    fn set(&self, path: &Path, values: &Values) -> Result<Vec<String>, MetaError>;
}

/// Fans out to an ordered chain of stores.
pub struct DelegateMetaStore {
    stores: Vec<Box<dyn MetaStore>>,
}

impl DelegateMetaStore {
    pub fn new(stores: Vec<Box<dyn MetaStore>>) -> Self {
        Self { stores }
    }
}

impl MetaStore for DelegateMetaStore {
    fn get(&self, path: &Path) -> Values {
        let mut merged = Values::new();
        for store in &self.stores {
            for (key, values) in store.get(path) {
                merged.insert(key, values);
            }
        }
        merged
    }

    fn set(&self, path: &Path, values: &Values) -> Result<Vec<String>, MetaError> {
        let mut remaining = values.clone();
        let mut applied = Vec::new();
        for store in &self.stores {
            let keys = store.set(path, &remaining)?;
            for key in &keys {
                remaining.remove(key);
            }
            applied.extend(keys);
        }
        Ok(applied)
    }
}

/// Derives read-only keys from the real path itself: `f`/`filename`,
/// `p`/`parent`, and `e`/`extension`.
#[derive(Debug, Default)]
pub struct PathMetaStore;

impl PathMetaStore {
    const KEYS: [&'static str; 6] = ["f", "filename", "p", "parent", "e", "extension"];

    pub fn new() -> Self {
        Self
    }
}

impl MetaStore for PathMetaStore {
    fn get(&self, path: &Path) -> Values {
        let mut values = Values::new();

        let file_name = path.file_name().and_then(|name| name.to_str());
        if let Some(file_name) = file_name {
            values.insert("f", vec![file_name.to_owned()]);
            values.insert("filename", vec![file_name.to_owned()]);
        }

        let parent = path
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str());
        if let Some(parent) = parent {
            values.insert("p", vec![parent.to_owned()]);
            values.insert("parent", vec![parent.to_owned()]);
        }

        if let Some(extension) = file_name.and_then(extension_of) {
            values.insert("e", vec![extension.to_owned()]);
            values.insert("extension", vec![extension.to_owned()]);
        }

        values
    }

    /// Derived keys cannot change, but writing back the value they
    /// already have is accepted and claimed. Merged write-backs carry
    /// unchanged keys along, and those must not fail the whole write.
    fn set(&self, path: &Path, values: &Values) -> Result<Vec<String>, MetaError> {
        let derived = self.get(path);
        let mut applied = Vec::new();
        for key in Self::KEYS {
            if let Some(offered) = values.get(key) {
                if derived.get(key) != Some(offered) {
                    return Err(MetaError::UnsettableKey(key.to_owned()));
                }
                applied.push(key.to_owned());
            }
        }
        Ok(applied)
    }
}

/// The part of `file_name` after its last dot. Leading dots do not
/// start an extension, so `.hidden` has none.
fn extension_of(file_name: &str) -> Option<&str> {
    let dot = file_name.rfind('.')?;
    if file_name[..dot].chars().all(|c| c == '.') {
        return None;
    }
    let extension = &file_name[dot + 1..];
    if extension.is_empty() {
        None
    } else {
        Some(extension)
    }
}

/// Stores values as plain text lines at the top of the file.
///
/// Line `n` of the file holds the value for the `n`-th letter key, `a`
/// through `z`. Everything after the final newline is the file's own
/// payload and is carried through writes untouched. This store rewrites
/// file heads in place, so it is only suitable for testing and
/// benchmarking.
pub struct LinesMetaStore;

const LAST_LINE_KEY_INDEX: usize = 26;

impl LinesMetaStore {
    pub fn new() -> Self {
        log::warn!("LinesMetaStore rewrites file contents; do not point it at files you want to keep");
        Self
    }
}

impl Default for LinesMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore for LinesMetaStore {
    fn get(&self, path: &Path) -> Values {
        let content = match fs_err::read(path) {
            Ok(content) => content,
            Err(_) => return Values::new(),
        };
        let header_end = match content.iter().rposition(|&byte| byte == b'\n') {
            Some(index) => index,
            None => return Values::new(),
        };

        let mut values = Values::new();
        let header = &content[..header_end];
        for (index, line) in header
            .split(|&byte| byte == b'\n')
            .take(LAST_LINE_KEY_INDEX)
            .enumerate()
        {
            let line = std::str::from_utf8(line).unwrap_or("");
            if line.is_empty() {
                continue;
            }
            values.insert(line_key(index), vec![line.to_owned()]);
        }
        values
    }

    fn set(&self, path: &Path, values: &Values) -> Result<Vec<String>, MetaError> {
        let mut flat = self.get(path).to_flat();
        let mut applied = Vec::new();
        for (key, key_values) in values {
            if line_key_index(key).is_none() {
                continue;
            }
            match key_values.first() {
                Some(value) => {
                    flat.insert(key.clone(), value.clone());
                }
                None => {
                    flat.shift_remove(key.as_str());
                }
            }
            applied.push(key.clone());
        }

        let mut lines = Vec::new();
        if let Some(max_index) = flat.keys().filter_map(|key| line_key_index(key)).max() {
            for index in 0..=max_index {
                lines.push(flat.get(&line_key(index)).cloned().unwrap_or_default());
            }
        }

        let payload = match fs_err::read(path) {
            Ok(content) => {
                let start = content
                    .iter()
                    .rposition(|&byte| byte == b'\n')
                    .map(|index| index + 1)
                    .unwrap_or(0);
                content[start..].to_vec()
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(error) => return Err(error.into()),
        };

        let mut output = lines.join("\n").into_bytes();
        output.push(b'\n');
        output.extend_from_slice(&payload);
        fs_err::write(path, output)?;

        Ok(applied)
    }
}

fn line_key(index: usize) -> String {
    char::from(b'a' + index as u8).to_string()
}

fn line_key_index(key: &str) -> Option<usize> {
    let mut chars = key.chars();
    let first = chars.next()?;
    if chars.next().is_some() || !first.is_ascii_lowercase() {
        return None;
    }
    Some(first as usize - 'a' as usize)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn path_store_reads_name_parent_and_extension() {
        let values = PathMetaStore.get(Path::new("/foo/bar.baz"));

        assert_eq!(values.get("f"), Some(&["bar.baz".to_owned()][..]));
        assert_eq!(values.get("filename"), Some(&["bar.baz".to_owned()][..]));
        assert_eq!(values.get("p"), Some(&["foo".to_owned()][..]));
        assert_eq!(values.get("parent"), Some(&["foo".to_owned()][..]));
        assert_eq!(values.get("e"), Some(&["baz".to_owned()][..]));
        assert_eq!(values.get("extension"), Some(&["baz".to_owned()][..]));
    }

    #[test]
    fn path_store_omits_what_the_path_does_not_have() {
        let values = PathMetaStore.get(Path::new("/bar"));

        assert!(values.contains_key("f"));
        assert!(!values.contains_key("p"));
        assert!(!values.contains_key("e"));
    }

    #[test]
    fn extensions_follow_the_last_dot() {
        assert_eq!(extension_of("a.b.c"), Some("c"));
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("..txt"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of("plain"), None);
    }

    #[test]
    fn path_store_keys_cannot_be_set() {
        let mut values = Values::new();
        values.insert("artist", vec!["x".to_owned()]);
        values.insert("filename", vec!["boink.bonk".to_owned()]);

        let result = PathMetaStore.set(Path::new("/foo/bar.baz"), &values);
        assert!(matches!(
            result,
            Err(MetaError::UnsettableKey(key)) if key == "filename"
        ));
    }

    #[test]
    fn foreign_keys_pass_through_the_path_store() {
        let mut values = Values::new();
        values.insert("artist", vec!["x".to_owned()]);

        let applied = PathMetaStore.set(Path::new("/foo/bar.baz"), &values).unwrap();
        assert_eq!(applied, Vec::<String>::new());
    }

    #[test]
    fn unchanged_derived_keys_are_claimed_without_error() {
        let mut values = Values::new();
        values.insert("e", vec!["baz".to_owned()]);
        values.insert("artist", vec!["x".to_owned()]);

        let applied = PathMetaStore.set(Path::new("/foo/bar.baz"), &values).unwrap();
        assert_eq!(applied, vec!["e".to_owned()]);
    }

    struct ClaimingStore {
        values: Values,
        claims: Vec<&'static str>,
    }

    impl ClaimingStore {
        fn new(values: Values, claims: Vec<&'static str>) -> Self {
            Self { values, claims }
        }
    }

    impl MetaStore for ClaimingStore {
        fn get(&self, _path: &Path) -> Values {
            self.values.clone()
        }

        fn set(&self, _path: &Path, values: &Values) -> Result<Vec<String>, MetaError> {
            Ok(values
                .keys()
                .filter(|key| self.claims.contains(&key.as_str()))
                .cloned()
                .collect())
        }
    }

    #[test]
    fn delegate_reads_let_later_stores_win() {
        let mut first = Values::new();
        first.insert("a", vec!["one".to_owned()]);
        first.insert("b", vec!["two".to_owned()]);
        let mut second = Values::new();
        second.insert("b", vec!["three".to_owned()]);

        let delegate = DelegateMetaStore::new(vec![
            Box::new(ClaimingStore::new(first, vec![])),
            Box::new(ClaimingStore::new(second, vec![])),
        ]);

        let merged = delegate.get(Path::new("/file"));
        assert_eq!(merged.get("a"), Some(&["one".to_owned()][..]));
        assert_eq!(merged.get("b"), Some(&["three".to_owned()][..]));
    }

    #[test]
    fn delegate_writes_stop_offering_claimed_keys() {
        let first = ClaimingStore::new(Values::new(), vec!["a"]);
        let second = ClaimingStore::new(Values::new(), vec!["a", "b"]);
        let delegate = DelegateMetaStore::new(vec![Box::new(first), Box::new(second)]);

        let mut values = Values::new();
        values.insert("a", vec!["one".to_owned()]);
        values.insert("b", vec!["two".to_owned()]);

        let applied = delegate.set(Path::new("/file"), &values).unwrap();
        assert_eq!(applied, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn lines_store_round_trips_header_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track");
        fs_err::write(&path, "Artist\nTitle\nPAYLOAD").unwrap();

        let store = LinesMetaStore::new();
        let values = store.get(&path);
        assert_eq!(values.get("a"), Some(&["Artist".to_owned()][..]));
        assert_eq!(values.get("b"), Some(&["Title".to_owned()][..]));

        let mut update = Values::new();
        update.insert("a", vec!["Other".to_owned()]);
        let applied = store.set(&path, &update).unwrap();
        assert_eq!(applied, vec!["a".to_owned()]);

        assert_eq!(
            fs_err::read_to_string(&path).unwrap(),
            "Other\nTitle\nPAYLOAD"
        );
    }

    #[test]
    fn lines_store_deletes_keys_with_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track");
        fs_err::write(&path, "Artist\nTitle\nPAYLOAD").unwrap();

        let store = LinesMetaStore::new();
        let mut update = Values::new();
        update.insert("b", Vec::new());
        store.set(&path, &update).unwrap();

        assert_eq!(fs_err::read_to_string(&path).unwrap(), "Artist\nPAYLOAD");
        assert!(!store.get(&path).contains_key("b"));
    }

    #[test]
    fn lines_store_pads_gaps_up_to_the_highest_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track");
        fs_err::write(&path, "PAYLOAD").unwrap();

        let store = LinesMetaStore::new();
        let mut update = Values::new();
        update.insert("c", vec!["Third".to_owned()]);
        store.set(&path, &update).unwrap();

        assert_eq!(
            fs_err::read_to_string(&path).unwrap(),
            "\n\nThird\nPAYLOAD"
        );
        let values = store.get(&path);
        assert!(!values.contains_key("a"));
        assert_eq!(values.get("c"), Some(&["Third".to_owned()][..]));
    }

    #[test]
    fn lines_store_ignores_keys_outside_its_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track");
        fs_err::write(&path, "Artist\nPAYLOAD").unwrap();

        let store = LinesMetaStore::new();
        let mut update = Values::new();
        update.insert("artist", vec!["x".to_owned()]);
        let applied = store.set(&path, &update).unwrap();

        assert_eq!(applied, Vec::<String>::new());
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "Artist\nPAYLOAD");
    }

    #[test]
    fn lines_store_creates_missing_files_on_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh");

        let store = LinesMetaStore::new();
        let mut update = Values::new();
        update.insert("a", vec!["Artist".to_owned()]);
        store.set(&path, &update).unwrap();

        assert_eq!(fs_err::read_to_string(&path).unwrap(), "Artist\n");
    }
}
