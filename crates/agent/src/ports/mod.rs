//! Port allocator — node-local host ports for workloads and checkpoints.
//!
//! Ports are drawn uniformly at random from a half-open range. Random
//! selection with a small retry bound is O(1) expected time while the range
//! is sparsely used and fails fast when it saturates, so callers can surface
//! exhaustion instead of blocking.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

/// How often `allocate` re-draws after hitting an already-allocated port.
const MAX_TRIES: u32 = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port found after {MAX_TRIES} tries")]
    MaxPortTriesReached,
}

/// Thread-safe allocator over the half-open range `[min, max)`.
pub struct PortAllocator {
    min: u16,
    max: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Draw a random unallocated port. Fails with [`PortError::MaxPortTriesReached`]
    /// after `MAX_TRIES` collisions.
    pub fn allocate(&self) -> Result<u16, PortError> {
        if self.min >= self.max {
            return Err(PortError::MaxPortTriesReached);
        }
        let mut allocated = self.allocated.lock();
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_TRIES {
            let port = rng.gen_range(self.min..self.max);
            if allocated.insert(port) {
                return Ok(port);
            }
        }
        Err(PortError::MaxPortTriesReached)
    }

    /// Return a port to the pool. Freeing an unallocated port is a no-op.
    pub fn free(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.lock().contains(&port)
    }
}
