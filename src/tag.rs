//! ## Tag allocator
//!
//! Generates the 8-bit `bTag` used to correlate a bulk-OUT transfer with its
//! reply, and (separately) the USB488 status-byte tag. Both follow the same
//! rule: start at 1, advance by 1, wrap back to 1 after hitting the bound —
//! never landing on 0, which the USBTMC spec reserves as "no tag".

use std::sync::{Arc, Mutex};

/// A monotonically-advancing tag counter, shared cheaply via `Clone`.
#[derive(Debug, Clone)]
pub struct TagAllocator {
    last: Arc<Mutex<u8>>,
    max: u8,
}

impl TagAllocator {
    /// A bulk `bTag` allocator: range `[1, 255]`.
    pub fn new() -> Self {
        Self::bounded(255)
    }

    /// An allocator bounded to `[1, max]`, e.g. `127` for the USB488
    /// status-byte tag (USB488 §4.3.1 reserves the top bit).
    pub fn bounded(max: u8) -> Self {
        TagAllocator {
            last: Arc::new(Mutex::new(0)),
            max,
        }
    }

    /// Allocate the next tag, advancing the counter.
    pub fn next(&self) -> u8 {
        let mut last = self.last.lock().unwrap();
        *last = (*last % self.max) + 1;
        *last
    }

    /// The most recently allocated tag, without advancing.
    pub fn last(&self) -> u8 {
        *self.last.lock().unwrap()
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}
