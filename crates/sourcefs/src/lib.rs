/*!
Access to the real directory tree that backs a tag filesystem, plus the
change-monitor interface used to keep a mounted view current.

sourcefs is currently an unstable minimum viable library. Its primary
consumer is tagsfs, which builds virtual paths out of file metadata.

## Current Features
* `SourceTree`, rooted path access with the conversions and probes the
  sync layer needs
* Pluggable change monitors
    * `NoopMonitor`, which accepts every watch and never reports
    * `InMemoryMonitor`, a strict bookkeeping monitor useful for testing
*/

mod in_memory;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crossbeam_channel::Receiver;
use filetime::FileTime;
use walkdir::WalkDir;

pub use in_memory::{InMemoryMonitor, InMemoryMonitorHandle};

/// Trait that transforms `io::Result<T>` into `io::Result<Option<T>>`.
///
/// `Ok(None)` takes the place of IO errors whose `io::ErrorKind` is `NotFound`.
pub trait IoResultExt<T> {
    fn with_not_found(self) -> io::Result<Option<T>>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_not_found(self) -> io::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// A change that a monitor observed under a watched path.
///
/// Paths are absolute; consumers convert them to source-relative form
/// through [`SourceTree::relative_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MonitorEvent {
    Added(PathBuf),
    Removed(PathBuf),
    Modified(PathBuf),
}

impl MonitorEvent {
    pub fn path(&self) -> &Path {
        match self {
            MonitorEvent::Added(path) => path,
            MonitorEvent::Removed(path) => path,
            MonitorEvent::Modified(path) => path,
        }
    }
}

/// Watches parts of the real filesystem and reports changes on a channel.
///
/// Implementations wrap a platform notification mechanism or, for
/// embedding and tests, no mechanism at all. Watch registration follows
/// `io::ErrorKind` conventions: a duplicate watch is `AlreadyExists`,
/// removing an unknown watch is `NotFound`, watching a file as a
/// directory is `NotADirectory`.
pub trait SourceTreeMonitor: Send + 'static {
    fn start(&mut self) -> io::Result<()>;
    fn stop(&mut self);

    fn add_source_dir(&mut self, path: &Path) -> io::Result<()>;
    fn remove_source_dir(&mut self, path: &Path) -> io::Result<()>;
    fn add_source_file(&mut self, path: &Path) -> io::Result<()>;
    fn remove_source_file(&mut self, path: &Path) -> io::Result<()>;

    fn event_receiver(&self) -> Receiver<MonitorEvent>;

    /// Whether the monitor is safe to drive from a thread other than the
    /// one that created it.
    fn supports_threads(&self) -> bool;

    /// Whether changes written through the mounted view will be picked up
    /// by this monitor. Consumers should present a read-only view when
    /// this is `false`.
    fn supports_writes(&self) -> bool;
}

/// Monitor that accepts every watch and never reports anything.
///
/// Useful when a caller wants a one-shot scan of the source tree with no
/// live updates afterward.
pub struct NoopMonitor {
    // Keeps the receiver connected; a disconnected channel would wake the
    // event loop forever.
    _sender: crossbeam_channel::Sender<MonitorEvent>,
    receiver: Receiver<MonitorEvent>,
}

impl NoopMonitor {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            _sender: sender,
            receiver,
        }
    }
}

impl Default for NoopMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTreeMonitor for NoopMonitor {
    fn start(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn add_source_dir(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn remove_source_dir(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn add_source_file(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn remove_source_file(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn event_receiver(&self) -> Receiver<MonitorEvent> {
        self.receiver.clone()
    }

    fn supports_threads(&self) -> bool {
        true
    }

    fn supports_writes(&self) -> bool {
        false
    }
}

/// One immediate child of a source directory, as reported by
/// [`SourceTree::children`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Source-relative path of the entry, with a leading `/`.
    pub path: String,
    pub is_dir: bool,
}

/// Rooted access to the real directory tree.
///
/// All paths exchanged with callers are source-relative strings with a
/// leading `/`; the root itself is `/`. Absolute paths only appear at
/// the edges, when talking to monitors or the OS filesystem.
#[derive(Debug)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    /// Creates a source tree rooted at `root`, which must be an absolute
    /// path.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref();

        if !root.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("source root must be absolute, got {}", root.display()),
            ));
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Converts an absolute path under the root into source-relative form.
    ///
    /// The root itself converts to `/`. Paths outside the root are
    /// `InvalidInput`; path components that are not valid UTF-8 are
    /// `InvalidData`.
    pub fn relative_path(&self, absolute: &Path) -> io::Result<String> {
        let suffix = absolute.strip_prefix(&self.root).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is outside the source root {}",
                    absolute.display(),
                    self.root.display()
                ),
            )
        })?;

        let mut relative = String::new();
        for component in suffix.components() {
            let name = component.as_os_str().to_str().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} is not valid UTF-8", absolute.display()),
                )
            })?;
            relative.push('/');
            relative.push_str(name);
        }

        if relative.is_empty() {
            relative.push('/');
        }

        Ok(relative)
    }

    /// Converts a source-relative path back into an absolute one.
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    /// Whether the path can actually be opened and read. Registering an
    /// unreadable file would produce virtual entries that fail every
    /// operation, so callers probe first.
    pub fn is_readable(&self, relative: &str) -> bool {
        let mut file = match fs_err::File::open(self.absolute_path(relative)) {
            Ok(file) => file,
            Err(_) => return false,
        };

        let mut probe = [0u8; 1];
        file.read(&mut probe).is_ok()
    }

    pub fn is_symlink(&self, relative: &str) -> bool {
        match fs_err::symlink_metadata(self.absolute_path(relative)) {
            Ok(metadata) => metadata.file_type().is_symlink(),
            Err(_) => false,
        }
    }

    /// Metadata for the path itself, without following symlinks.
    pub fn symlink_metadata(&self, relative: &str) -> io::Result<std::fs::Metadata> {
        fs_err::symlink_metadata(self.absolute_path(relative))
    }

    /// Sets the access and modification times of the path.
    pub fn set_times(
        &self,
        relative: &str,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> io::Result<()> {
        filetime::set_file_times(
            self.absolute_path(relative),
            FileTime::from_system_time(accessed),
            FileTime::from_system_time(modified),
        )
    }

    /// Lists the immediate children of a directory in file name order.
    ///
    /// Entries whose names are not valid UTF-8 are skipped with a warning;
    /// the virtual side of the world is UTF-8 throughout.
    pub fn children(&self, relative: &str) -> io::Result<Vec<SourceEntry>> {
        let absolute = self.absolute_path(relative);
        let mut entries = Vec::new();

        for entry in WalkDir::new(&absolute)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(io::Error::from)?;

            let name = match entry.file_name().to_str() {
                Some(name) => name,
                None => {
                    log::warn!(
                        "Skipping {}: file name is not valid UTF-8",
                        entry.path().display()
                    );
                    continue;
                }
            };

            let path = if relative == "/" {
                format!("/{name}")
            } else {
                format!("{relative}/{name}")
            };

            entries.push(SourceEntry {
                path,
                is_dir: entry.file_type().is_dir(),
            });
        }

        Ok(entries)
    }
}
