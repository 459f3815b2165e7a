//! Round-robin rotation over registered frameworks.
//!
//! Each offer round starts at the next framework in line so that one busy
//! framework cannot starve the others of offers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free round-robin cursor.
#[derive(Debug, Default)]
pub struct Rotation {
    cursor: AtomicUsize,
}

impl Rotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index to start this round at, wrapping around `len`.
    ///
    /// Returns `None` if there is nothing to rotate over.
    pub fn next_start(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % len)
    }

    /// Visit order for one round: every index once, starting at the next
    /// framework in line.
    pub fn order(&self, len: usize) -> impl Iterator<Item = usize> {
        let start = self.next_start(len).unwrap_or(0);
        (0..len).map(move |i| (start + i) % len)
    }
}
