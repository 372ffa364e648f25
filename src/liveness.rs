//! Teardown flag shared between a view and its in-flight async work.

use std::cell::Cell;
use std::rc::Rc;

/// Cloned into every completion and message handler. Allocated apart from
/// the view, so a handler can still read it after the view has gone.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    deleted: Rc<Cell<bool>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_deleted(&self) {
        self.deleted.set(true);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    pub fn is_alive(&self) -> bool {
        !self.is_deleted()
    }
}
