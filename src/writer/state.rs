//! Lifecycle state of a writer.

use std::fmt;

use parking_lot::RwLock;

use crate::error::{QuireError, Result};

/// Where a writer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    /// An out-of-memory error was observed. Only close and rollback are
    /// still accepted, and both discard uncommitted changes.
    Quarantined,
    /// Closed or rolled back.
    Closed,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriterState::Open => "open",
            WriterState::Quarantined => "quarantined",
            WriterState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The state plus the checks entry points run against it.
///
/// A leaf lock: nothing else is locked while it is held.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: RwLock<WriterState>,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell {
            state: RwLock::new(WriterState::Open),
        }
    }

    pub fn get(&self) -> WriterState {
        *self.state.read()
    }

    /// Fails unless open; for operations that change the index.
    pub fn ensure_open(&self) -> Result<()> {
        match self.get() {
            WriterState::Open => Ok(()),
            WriterState::Quarantined => Err(QuireError::quarantined(
                "this writer hit an out-of-memory error; it can only be closed or rolled back",
            )),
            WriterState::Closed => Err(QuireError::already_closed("this writer is closed")),
        }
    }

    /// Fails only once closed; for read-only operations.
    pub fn ensure_not_closed(&self) -> Result<()> {
        match self.get() {
            WriterState::Closed => Err(QuireError::already_closed("this writer is closed")),
            _ => Ok(()),
        }
    }

    /// Latch quarantine. A closed writer stays closed.
    pub fn quarantine(&self) {
        let mut state = self.state.write();
        if *state == WriterState::Open {
            *state = WriterState::Quarantined;
        }
    }

    pub fn close(&self) {
        *self.state.write() = WriterState::Closed;
    }

    pub fn is_quarantined(&self) -> bool {
        self.get() == WriterState::Quarantined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new();
        assert!(cell.ensure_open().is_ok());

        cell.quarantine();
        assert!(cell.is_quarantined());
        assert!(matches!(cell.ensure_open(), Err(QuireError::Quarantined(_))));
        assert!(cell.ensure_not_closed().is_ok());

        cell.close();
        cell.quarantine();
        assert_eq!(cell.get(), WriterState::Closed);
        assert!(matches!(cell.ensure_open(), Err(QuireError::AlreadyClosed(_))));
        assert_eq!(cell.get().to_string(), "closed");
    }
}
