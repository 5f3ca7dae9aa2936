//! The path pattern mini-language.
//!
//! A format string like `/%a/%l/%t.%e` is split on `/` into segment
//! patterns. Each segment can render itself from tag substitutions
//! (`fill`) and can compile into a [`Splitter`], an anchored regex that
//! parses a concrete path segment back into tag values. Together the
//! two directions make virtual paths a faithful projection of metadata.

mod node;

use std::fmt;

use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error;

use node::{fill_nodes, parse_expression, GroupTable, Node};

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("syntax error in pattern at offset {offset}: {problem_area}")]
    Syntax {
        pattern: String,
        offset: usize,
        problem_area: String,
    },

    #[error("pattern {expression:?} has no substitution for {}", keys.join(", "))]
    Fill {
        expression: String,
        keys: Vec<String>,
    },

    #[error("regex {regex:?} did not match {input:?}")]
    Split { regex: String, input: String },

    #[error("pattern segment {pattern:?} rendered unrepresentable text {rendered:?}")]
    Unrepresentable { pattern: String, rendered: String },

    #[error(transparent)]
    Regex {
        #[from]
        source: regex::Error,
    },
}

impl PatternError {
    pub(crate) fn syntax(pattern: &str, offset: usize) -> Self {
        let mut problem_area: String = pattern[offset..].chars().take(10).collect();
        if pattern[offset..].chars().count() > 10 {
            problem_area.push_str("...");
        }

        Self::Syntax {
            pattern: pattern.to_owned(),
            offset,
            problem_area,
        }
    }
}

/// One `/`-delimited piece of a path format.
#[derive(Debug, Clone)]
pub struct SegmentPattern {
    source: String,
    nodes: Vec<Node>,
}

impl SegmentPattern {
    pub fn new(source: &str) -> Result<Self, PatternError> {
        let nodes = parse_expression(source)?;
        Ok(Self {
            source: source.to_owned(),
            nodes,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the segment from single-valued substitutions.
    pub fn fill(&self, substitutions: &IndexMap<String, String>) -> Result<String, PatternError> {
        fill_nodes(&self.nodes, substitutions).map_err(|failure| PatternError::Fill {
            expression: self.source.clone(),
            keys: failure.keys,
        })
    }

    /// Compiles the matching direction of this segment.
    ///
    /// `substitutions` are the values already known at compile time;
    /// they only steer which if/else branch is tried first, they are
    /// not substituted into the regex.
    pub fn splitter(
        &self,
        substitutions: &IndexMap<String, String>,
    ) -> Result<Splitter, PatternError> {
        let mut table = GroupTable::new();
        let mut source = String::from("^");
        for node in &self.nodes {
            node.append_regex(substitutions, &mut table, &mut source);
        }
        source.push('$');

        let regex = Regex::new(&source)?;
        Ok(Splitter {
            regex,
            source,
            groups: table.into_groups(),
        })
    }
}

impl PartialEq for SegmentPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for SegmentPattern {}

/// A compiled matcher that parses one concrete path segment back into
/// tag values.
#[derive(Clone)]
pub struct Splitter {
    regex: Regex,
    source: String,
    /// Capture group name paired with the tag key it captures. A key
    /// repeated in the pattern owns several groups.
    groups: Vec<(String, String)>,
}

impl Splitter {
    pub fn regex_str(&self) -> &str {
        &self.source
    }

    /// Matches a segment and returns the captured value per tag key, in
    /// pattern order. A key whose groups all sat in unmatched branches
    /// maps to `None`.
    ///
    /// Failure to match is an error, as is a repeated key whose
    /// occurrences captured different text.
    pub fn split(&self, segment: &str) -> Result<IndexMap<String, Option<String>>, PatternError> {
        let captures = self.regex.captures(segment).ok_or_else(|| PatternError::Split {
            regex: self.source.clone(),
            input: segment.to_owned(),
        })?;

        let mut flat: IndexMap<String, Option<String>> = IndexMap::new();
        for (group, key) in &self.groups {
            let value = captures.name(group).map(|m| m.as_str().to_owned());

            match flat.get_mut(key.as_str()) {
                None => {
                    flat.insert(key.clone(), value);
                }
                Some(existing) => match (existing.as_deref(), value) {
                    (Some(previous), Some(new)) if previous != new => {
                        return Err(PatternError::Split {
                            regex: self.source.clone(),
                            input: segment.to_owned(),
                        });
                    }
                    (None, Some(new)) => {
                        *existing = Some(new);
                    }
                    _ => {}
                },
            }
        }

        Ok(flat)
    }
}

impl PartialEq for Splitter {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Splitter {}

impl fmt::Debug for Splitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Splitter")
            .field("source", &self.source)
            .finish()
    }
}

/// A whole-path format: an absolute path template with one
/// [`SegmentPattern`] per depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFormat {
    source: String,
    segments: Vec<SegmentPattern>,
}

impl PathFormat {
    /// Parses a format string. The format must be absolute and must not
    /// end in `/`. Repeated separators collapse into one.
    pub fn new(format: &str) -> Result<Self, PatternError> {
        if !format.starts_with('/') {
            return Err(PatternError::syntax(format, 0));
        }
        if format.ends_with('/') {
            return Err(PatternError::syntax(format, format.len() - 1));
        }

        let mut segments = Vec::new();
        for part in format[1..].split('/') {
            if part.is_empty() {
                continue;
            }
            segments.push(SegmentPattern::new(part)?);
        }
        if segments.is_empty() {
            return Err(PatternError::syntax(format, 0));
        }

        Ok(Self {
            source: format.to_owned(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The number of path segments a matching fake path has.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[SegmentPattern] {
        &self.segments
    }

    /// Renders the full fake path for one set of substitutions.
    ///
    /// A segment that renders empty, or that a substitution value drags
    /// a `/` into, cannot be represented as a path and is an error.
    pub fn fill_path(
        &self,
        substitutions: &IndexMap<String, String>,
    ) -> Result<String, PatternError> {
        let mut path = String::new();
        for segment in &self.segments {
            let rendered = segment.fill(substitutions)?;
            if rendered.is_empty() || rendered.contains('/') {
                return Err(PatternError::Unrepresentable {
                    pattern: segment.source().to_owned(),
                    rendered,
                });
            }
            path.push('/');
            path.push_str(&rendered);
        }
        Ok(path)
    }

    /// Compiles splitters for the first `depth` segments, one per
    /// segment of the fake path they will be matched against.
    pub fn splitters(
        &self,
        depth: usize,
        substitutions: &IndexMap<String, String>,
    ) -> Result<Vec<Splitter>, PatternError> {
        self.segments
            .iter()
            .take(depth)
            .map(|segment| segment.splitter(substitutions))
            .collect()
    }
}
