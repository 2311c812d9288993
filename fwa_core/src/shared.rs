//! Shared reference slots readable from the callback domain.
//!
//! The isochronous callback must observe PCM and MIDI attachments that
//! a user thread swaps in and out while packets are in flight. The slot
//! is a spinlocked `Option<Arc<T>>`: the critical section is a pointer
//! copy, so the callback side stays wait-free in practice while the
//! control side can swap at any time.

use std::sync::Arc;

use spin::Mutex;

/// A swap-in/swap-out reference shared between the control and
/// callback domains.
pub struct SharedSlot<T: ?Sized> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> SharedSlot<T> {
    /// Create an empty slot.
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Install `value`, replacing any current attachment.
    pub fn set(&self, value: Option<Arc<T>>) {
        *self.slot.lock() = value;
    }

    /// Clone out the current attachment, if any.
    #[inline]
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }

    /// Remove and return the current attachment.
    pub fn take(&self) -> Option<Arc<T>> {
        self.slot.lock().take()
    }

    /// Whether something is attached right now.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: ?Sized> Default for SharedSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
