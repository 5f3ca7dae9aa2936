//! Ordered multi-valued tag mappings and the merge algebra used when a
//! rename has to be folded back into file metadata.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An ordered mapping from tag keys to lists of values.
///
/// Key order is insertion order and is significant: permutations,
/// combination, and diffs all preserve it, which keeps virtual paths
/// stable across repeated scans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(IndexMap<String, Vec<String>>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mapping from single-valued entries. A `None` value marks
    /// a key known to exist with no usable value and becomes an empty
    /// list.
    pub fn from_flat(flat: IndexMap<String, Option<String>>) -> Self {
        let mut values = Self::new();
        for (key, value) in flat {
            match value {
                Some(value) => values.0.insert(key, vec![value]),
                None => values.0.insert(key, Vec::new()),
            };
        }
        values
    }

    /// Collapses to single values by taking the first value of each key.
    /// Keys with no values are dropped.
    pub fn to_flat(&self) -> IndexMap<String, String> {
        self.0
            .iter()
            .filter_map(|(key, values)| {
                values.first().map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    /// Concatenates any number of mappings. Keys keep their first-seen
    /// order, values their first-seen occurrence.
    pub fn combine<I: IntoIterator<Item = Values>>(list: I) -> Self {
        let mut combined: IndexMap<String, Vec<String>> = IndexMap::new();
        for values in list {
            for (key, list) in values.0 {
                combined.entry(key).or_default().extend(list);
            }
        }

        for list in combined.values_mut() {
            let mut seen = HashSet::new();
            list.retain(|value| seen.insert(value.clone()));
        }

        Self(combined)
    }

    /// The keys whose value *set* changed between `old` and `new`.
    ///
    /// Starts from `new` in its key order; a key deleted from `old`
    /// appears with an empty list so the change is visible downstream.
    pub fn diff2(old: &Values, new: &Values) -> Self {
        let mut diff = new.clone();
        for (key, old_values) in &old.0 {
            let unchanged = diff
                .0
                .get(key)
                .map(|new_values| value_sets_equal(old_values, new_values))
                .unwrap_or(false);

            if unchanged {
                diff.0.shift_remove(key);
            } else if !new.0.contains_key(key) {
                diff.0.insert(key.clone(), Vec::new());
            }
        }
        diff
    }

    /// Rebases the change from `old` to `new` onto `base`.
    ///
    /// For each changed key already in `base`, one occurrence of every
    /// `old` value is removed from the base values and the new values
    /// are appended, so values the change never mentioned survive.
    /// Unchanged base keys are retained verbatim, which makes rebasing
    /// a no-op change the identity.
    pub fn diff3(base: &Values, old: &Values, new: &Values) -> Self {
        let diff = Self::diff2(old, new);
        let mut merged = base.clone();

        for (key, diff_values) in diff.0 {
            match base.0.get(&key) {
                None => {
                    merged.0.insert(key, diff_values);
                }
                Some(base_values) => {
                    let mut values = base_values.clone();
                    for old_value in old.0.get(&key).into_iter().flatten() {
                        if let Some(index) = values.iter().position(|v| v == old_value) {
                            values.remove(index);
                        }
                    }
                    values.extend(diff_values);
                    merged.0.insert(key, values);
                }
            }
        }

        merged
    }

    /// Every single-valued combination of this mapping, in a fixed
    /// order: the last key varies fastest. An empty mapping yields one
    /// empty permutation; a key with no values yields none at all.
    pub fn permutations(&self) -> Vec<Values> {
        let mut rest = self.clone();
        let (last_key, last_values) = match rest.0.pop() {
            Some(entry) => entry,
            None => return vec![Values::new()],
        };

        let mut permutations = Vec::new();
        for sub in rest.permutations() {
            for value in &last_values {
                let mut permutation = sub.clone();
                permutation
                    .0
                    .insert(last_key.clone(), vec![value.clone()]);
                permutations.push(permutation);
            }
        }
        permutations
    }

    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.0.insert(key.into(), values);
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn value_sets_equal(left: &[String], right: &[String]) -> bool {
    let left: HashSet<&str> = left.iter().map(String::as_str).collect();
    let right: HashSet<&str> = right.iter().map(String::as_str).collect();
    left == right
}

impl FromIterator<(String, Vec<String>)> for Values {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Values {
    type Item = (String, Vec<String>);
    type IntoIter = indexmap::map::IntoIter<String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = indexmap::map::Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
