//! Bidirectional mapping between fake paths and real paths.

use indexmap::IndexMap;

/// One registration of a real path under a fake path.
///
/// Frames stack: registering the same fake path again pushes a new frame,
/// and the top frame is the one lookups see. Metadata set on the path is
/// attached to the top frame and goes away with it.
#[derive(Debug)]
pub(super) struct Frame<M> {
    pub real: String,
    pub meta: Option<M>,
}

pub(super) struct PathMapping<M> {
    forward: IndexMap<String, Vec<Frame<M>>>,
    reverse: IndexMap<String, Vec<String>>,
}

impl<M> PathMapping<M> {
    pub fn new() -> Self {
        Self {
            forward: IndexMap::new(),
            reverse: IndexMap::new(),
        }
    }

    pub fn add(&mut self, fake_path: &str, real_path: &str) {
        self.forward.entry(fake_path.to_owned()).or_default().push(Frame {
            real: real_path.to_owned(),
            meta: None,
        });
        self.reverse
            .entry(real_path.to_owned())
            .or_default()
            .push(fake_path.to_owned());
    }

    /// Removes one frame from the fake path's stack and returns it.
    ///
    /// With `real_path` given, the first frame holding that real path is
    /// removed; otherwise the top frame is popped. Returns `None` if there
    /// is no matching frame.
    pub fn remove(&mut self, fake_path: &str, real_path: Option<&str>) -> Option<Frame<M>> {
        let frames = self.forward.get_mut(fake_path)?;
        let index = match real_path {
            Some(real_path) => frames.iter().position(|frame| frame.real == real_path)?,
            None => frames.len().checked_sub(1)?,
        };
        let frame = frames.remove(index);
        if frames.is_empty() {
            self.forward.shift_remove(fake_path);
        }

        if let Some(fake_paths) = self.reverse.get_mut(&frame.real) {
            if let Some(position) = fake_paths.iter().position(|existing| existing == fake_path) {
                fake_paths.remove(position);
            }
            if fake_paths.is_empty() {
                self.reverse.shift_remove(&frame.real);
            }
        }

        Some(frame)
    }

    pub fn top(&self, fake_path: &str) -> Option<&Frame<M>> {
        self.forward.get(fake_path)?.last()
    }

    pub fn top_mut(&mut self, fake_path: &str) -> Option<&mut Frame<M>> {
        self.forward.get_mut(fake_path)?.last_mut()
    }

    pub fn contains_fake_path(&self, fake_path: &str) -> bool {
        self.forward.contains_key(fake_path)
    }

    /// The fake paths registered for a real path, oldest first.
    pub fn fake_paths(&self, real_path: &str) -> Option<&[String]> {
        self.reverse.get(real_path).map(Vec::as_slice)
    }

    /// All known real paths in registration order.
    pub fn real_paths(&self) -> impl Iterator<Item = &String> {
        self.reverse.keys()
    }
}
