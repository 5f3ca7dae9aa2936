use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::{MonitorEvent, SourceTreeMonitor};

#[derive(Default)]
struct WatchState {
    started: bool,
    dirs: BTreeSet<PathBuf>,
    files: BTreeSet<PathBuf>,
}

/// Monitor backed by nothing but bookkeeping.
///
/// Watch registration is strict so that tests catch double adds and
/// dangling removes; events come from the matching
/// [`InMemoryMonitorHandle`], which stands in for the platform notifier.
pub struct InMemoryMonitor {
    state: Arc<Mutex<WatchState>>,
    sender: Sender<MonitorEvent>,
    receiver: Receiver<MonitorEvent>,
}

impl InMemoryMonitor {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(Mutex::new(WatchState::default())),
            sender,
            receiver,
        }
    }

    /// Returns a handle that can emit events and inspect watches after
    /// the monitor itself has been handed off.
    pub fn handle(&self) -> InMemoryMonitorHandle {
        InMemoryMonitorHandle {
            state: Arc::clone(&self.state),
            sender: self.sender.clone(),
        }
    }
}

impl Default for InMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn already_watched(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} is already watched", path.display()),
    )
}

fn not_watched(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} is not watched", path.display()),
    )
}

impl SourceTreeMonitor for InMemoryMonitor {
    fn start(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().started = false;
    }

    fn add_source_dir(&mut self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirs.insert(path.to_path_buf()) {
            return Err(already_watched(path));
        }
        Ok(())
    }

    fn remove_source_dir(&mut self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirs.remove(path) {
            return Err(not_watched(path));
        }
        Ok(())
    }

    fn add_source_file(&mut self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.files.insert(path.to_path_buf()) {
            return Err(already_watched(path));
        }
        Ok(())
    }

    fn remove_source_file(&mut self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.files.remove(path) {
            return Err(not_watched(path));
        }
        Ok(())
    }

    fn event_receiver(&self) -> Receiver<MonitorEvent> {
        self.receiver.clone()
    }

    fn supports_threads(&self) -> bool {
        true
    }

    fn supports_writes(&self) -> bool {
        true
    }
}

/// Test-side handle to an [`InMemoryMonitor`].
#[derive(Clone)]
pub struct InMemoryMonitorHandle {
    state: Arc<Mutex<WatchState>>,
    sender: Sender<MonitorEvent>,
}

impl InMemoryMonitorHandle {
    /// Delivers an event as if the platform notifier had observed it.
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().dirs.iter().cloned().collect()
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().files.iter().cloned().collect()
    }
}
