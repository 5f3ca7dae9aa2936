//! Sync session configuration.
//!
//! `SyncConfig` is the serde-facing shape, loadable from a JSON file;
//! `build` compiles it into the validated `SyncOptions` a session runs
//! with. Validation happens entirely at build time so that a bad format
//! string or filter expression fails before anything is mounted.

use std::io;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::pattern::{PathFormat, PatternError};
use crate::sync::{FilterTarget, PathFilter};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },

    #[error(transparent)]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Pattern {
        #[from]
        source: PatternError,
    },

    #[error("bad filter expression: {source}")]
    Filter {
        #[from]
        source: regex::Error,
    },

    #[error("bad ignore glob: {source}")]
    Glob {
        #[from]
        source: globset::Error,
    },
}

/// The user-facing configuration of a sync session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// The path format, like `/%a/%t.%e`.
    pub format: String,

    /// Regexes matched against the source-relative real path of each
    /// candidate registration. A leading `!` negates.
    #[serde(default)]
    pub source_filters: Vec<String>,

    /// Regexes matched against the fake path of each candidate
    /// registration. A leading `!` negates.
    #[serde(default)]
    pub mount_filters: Vec<String>,

    /// Globs for source-relative paths to skip entirely during scans.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Whether to keep a cache of computed entries and stat results.
    #[serde(default = "default_cache")]
    pub cache: bool,
}

fn default_cache() -> bool {
    true
}

impl SyncConfig {
    pub fn new(format: &str) -> Self {
        Self {
            format: format.to_owned(),
            source_filters: Vec::new(),
            mount_filters: Vec::new(),
            ignore: Vec::new(),
            cache: default_cache(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs_err::read(path.as_ref())?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Compiles and validates everything into the options a session
    /// runs with.
    pub fn build(&self) -> Result<SyncOptions, ConfigError> {
        let format = PathFormat::new(&self.format)?;

        let mut filters = Vec::new();
        for expression in &self.source_filters {
            filters.push(PathFilter::new(expression, FilterTarget::Real)?);
        }
        for expression in &self.mount_filters {
            filters.push(PathFilter::new(expression, FilterTarget::Fake)?);
        }

        let mut ignore = GlobSetBuilder::new();
        for pattern in &self.ignore {
            ignore.add(Glob::new(pattern)?);
        }
        let ignore = ignore.build()?;

        Ok(SyncOptions {
            format,
            filters,
            ignore,
            cache: self.cache,
        })
    }
}

/// A validated, compiled configuration.
pub struct SyncOptions {
    pub format: PathFormat,
    pub filters: Vec<PathFilter>,
    pub ignore: GlobSet,
    pub cache: bool,
}
