//! Server-side storage for undo/redo state pushed by the client.
//!
//! The XML documents are opaque here; they are stored and handed back
//! without interpretation.

use std::fmt::Debug;

/// Keeps undo/redo documents for one client.
pub trait UndoRedoStore: Debug {
    /// Records a new undoable step. Clears the redo side.
    fn push(&mut self, label: String, xml: String);

    /// Moves one step back and returns that step's document.
    fn undo(&mut self) -> Option<String>;

    /// Moves one step forward and returns that step's document.
    fn redo(&mut self) -> Option<String>;
}

/// An [`UndoRedoStore`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryUndoStore {
    undo: Vec<(String, String)>,
    redo: Vec<(String, String)>,
}

impl InMemoryUndoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn undo_labels(&self) -> impl Iterator<Item = &str> {
        self.undo.iter().map(|(label, _)| label.as_str())
    }
}

impl UndoRedoStore for InMemoryUndoStore {
    fn push(&mut self, label: String, xml: String) {
        self.undo.push((label, xml));
        self.redo.clear();
    }

    fn undo(&mut self) -> Option<String> {
        let step = self.undo.pop()?;
        let xml = step.1.clone();
        self.redo.push(step);
        Some(xml)
    }

    fn redo(&mut self) -> Option<String> {
        let step = self.redo.pop()?;
        let xml = step.1.clone();
        self.undo.push(step);
        Some(xml)
    }
}
