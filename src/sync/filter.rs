//! Include/exclude rules applied when source files are registered.

use regex::Regex;

/// Which path a filter expression is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    /// The source-relative real path of the file.
    Real,
    /// The fake path a candidate registration would create.
    Fake,
}

/// One configured filter rule.
///
/// The expression is an unanchored regex; a leading `!` inverts it. A
/// candidate registration goes through only if every filter accepts it.
#[derive(Debug, Clone)]
pub struct PathFilter {
    regex: Regex,
    target: FilterTarget,
    negate: bool,
}

impl PathFilter {
    pub fn new(expression: &str, target: FilterTarget) -> Result<Self, regex::Error> {
        let (negate, expression) = match expression.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, expression),
        };

        Ok(Self {
            regex: Regex::new(expression)?,
            target,
            negate,
        })
    }

    pub fn accepts(&self, real_path: &str, fake_path: &str) -> bool {
        let candidate = match self.target {
            FilterTarget::Real => real_path,
            FilterTarget::Fake => fake_path,
        };
        self.regex.is_match(candidate) != self.negate
    }
}
