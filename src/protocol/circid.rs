//! Circuit ID allocation
//!
//! IDs are scoped to one connection. In link protocol v4 the side that
//! opened the connection sets the most significant bit, so IDs we pick can
//! never collide with IDs the relay picks for circuits it initiates.

use std::collections::HashSet;

use rand::RngCore;

use crate::error::{CircuitError, Result};

/// High bit marks IDs chosen by the connection initiator
pub const INITIATOR_BIT: u32 = 0x8000_0000;

/// Hands out random, non-zero, unused circuit IDs for one connection
#[derive(Debug, Clone)]
pub struct CircIdAllocator {
    in_use: HashSet<u32>,
    max_attempts: usize,
}

impl CircIdAllocator {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            in_use: HashSet::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Pick a fresh ID from `rng` and mark it in use
    pub fn allocate<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> Result<u32> {
        for _ in 0..self.max_attempts {
            let id = rng.next_u32() | INITIATOR_BIT;
            if self.in_use.insert(id) {
                log::trace!("Allocated circuit ID 0x{:08x}", id);
                return Ok(id);
            }
        }
        log::warn!(
            "No free circuit ID after {} attempts ({} in use)",
            self.max_attempts,
            self.in_use.len()
        );
        Err(CircuitError::CircuitIdExhausted)
    }

    /// Return `id` to the pool; false if it was not allocated here
    pub fn release(&mut self, id: u32) -> bool {
        self.in_use.remove(&id)
    }

    pub fn is_in_use(&self, id: u32) -> bool {
        self.in_use.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}

impl Default for CircIdAllocator {
    fn default() -> Self {
        Self::new(64)
    }
}
