//! Duplicate suppression for upstream MAVLink frames.
//!
//! The flight controller's link can deliver the same frame twice (broadcast
//! plus unicast, or retransmission by intermediate hops). Frames carry a
//! per-system wrapping sequence number, so a frame whose `(system_id,
//! sequence)` equals the last-seen pair for that system is a duplicate.

use std::collections::HashMap;

/// Tracks the last sequence number seen per system id.
#[derive(Debug, Default)]
pub struct SeqDedup {
    last_seq: HashMap<u8, u8>,
}

impl SeqDedup {
    /// Creates an empty dedup table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks a frame against the table and records it.
    ///
    /// Returns `true` if the frame is a duplicate of the previous frame from
    /// the same system (and leaves the table unchanged), `false` otherwise.
    pub fn check_and_insert(&mut self, system_id: u8, sequence: u8) -> bool {
        match self.last_seq.get(&system_id) {
            Some(&last) if last == sequence => true,
            _ => {
                self.last_seq.insert(system_id, sequence);
                false
            }
        }
    }

    /// Number of systems currently tracked.
    pub fn tracked_systems(&self) -> usize {
        self.last_seq.len()
    }
}
