//! Double-buffered values for two-phase (tick/tock) mutation.
//!
//! Readers only ever see `current`. Writers stage into `pending` during a
//! pass and the owner calls [`Staged::commit`] once every element has been
//! evaluated, so no element observes a partially-updated neighbour.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Staged<T> {
    current: T,
    pending: T,
}

impl<T: Clone> Staged<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: value.clone(),
            pending: value,
        }
    }

    /// The committed value.
    #[inline]
    pub fn current(&self) -> &T {
        &self.current
    }

    /// The value staged for the next commit.
    #[inline]
    pub fn pending(&self) -> &T {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut T {
        &mut self.pending
    }

    pub fn stage(&mut self, value: T) {
        self.pending = value;
    }

    /// Make the staged value current. The pending slot keeps a copy so an
    /// unstaged pass commits to the same value.
    pub fn commit(&mut self) {
        self.current = self.pending.clone();
    }

    /// Overwrite both slots.
    pub fn reset(&mut self, value: T) {
        self.current = value.clone();
        self.pending = value;
    }
}
