//! Size-class buffer arena.
//!
//! The loop's read paths churn through short-lived buffers; the arena
//! recycles them in power-of-two size classes instead of round-tripping
//! the allocator. A single mutex guards all operations, so an `Arc<Arena>`
//! may be shared with thread-pool tasks.

use std::collections::HashMap;
use std::sync::Mutex;

/// Smallest class handed out; tiny requests round up to this.
const MIN_CLASS: usize = 64;
/// Free buffers kept per class; beyond this, released buffers are freed.
const MAX_FREE_PER_CLASS: usize = 64;

#[derive(Default)]
struct Buckets {
    classes: HashMap<usize, Vec<Vec<u8>>>,
    allocated: u64,
    recycled: u64,
}

/// Monotonic allocation counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Buffers created fresh from the allocator.
    pub allocated: u64,
    /// Requests served from a free list.
    pub recycled: u64,
}

pub struct Arena {
    buckets: Mutex<Buckets>,
}

impl Arena {
    pub fn new() -> Arena {
        Arena {
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// A zero-filled buffer of exactly `len` bytes, with capacity rounded
    /// up to the size class.
    pub fn alloc(&self, len: usize) -> Vec<u8> {
        let class = class_for(len);
        let mut buckets = self.buckets.lock().unwrap();
        let mut buf = match buckets.classes.get_mut(&class).and_then(Vec::pop) {
            Some(buf) => {
                buckets.recycled += 1;
                buf
            }
            None => {
                buckets.allocated += 1;
                Vec::with_capacity(class)
            }
        };
        drop(buckets);
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to its class's free list. Buffers whose capacity is
    /// not an exact class (because the caller grew them) are dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap < MIN_CLASS || !cap.is_power_of_two() {
            return;
        }
        buf.clear();
        let mut buckets = self.buckets.lock().unwrap();
        let free = buckets.classes.entry(cap).or_default();
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let buckets = self.buckets.lock().unwrap();
        ArenaStats {
            allocated: buckets.allocated,
            recycled: buckets.recycled,
        }
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        fmt.debug_struct("Arena")
            .field("allocated", &stats.allocated)
            .field("recycled", &stats.recycled)
            .finish()
    }
}

fn class_for(len: usize) -> usize {
    len.next_power_of_two().max(MIN_CLASS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_class() {
        let arena = Arena::new();
        let buf = arena.alloc(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 128);
    }

    #[test]
    fn recycles_released_buffers() {
        let arena = Arena::new();
        let buf = arena.alloc(1000);
        arena.release(buf);
        let _buf = arena.alloc(900);
        let stats = arena.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn odd_capacity_buffers_are_dropped() {
        let arena = Arena::new();
        let mut buf = arena.alloc(64);
        buf.reserve_exact(100);
        arena.release(buf);
        let _buf = arena.alloc(64);
        assert_eq!(arena.stats().recycled, 0);
    }
}
