use std::sync::atomic::{AtomicI32, Ordering};

use rand::Rng;

/// Dispatcher endpoint ids are allocated sequentially from this base. Channel ids are
///  drawn at random from the full positive range, so collisions between the two kinds
///  are possible in principle but vanishingly unlikely in practice.
pub const DISPATCHER_ID_BASE: i32 = 35000;


/// Process-wide counter for dispatcher endpoint ids.
///
/// Channel ids must be unpredictable (they double as a weak session token against
///  stray frames), but dispatcher ids are well-known meeting points, so these are
///  handed out sequentially and deterministically.
pub struct SequentialIdAllocator {
    next: AtomicI32,
}

impl SequentialIdAllocator {
    pub fn new() -> SequentialIdAllocator {
        SequentialIdAllocator {
            next: AtomicI32::new(DISPATCHER_ID_BASE),
        }
    }

    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequentialIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}


/// A fresh channel id: uniformly random in `[1, i32::MAX)`. Zero and negative values
///  are excluded because `-1` means "unknown" on the wire and routing treats
///  non-positive destinations as unroutable.
pub fn random_channel_id() -> i32 {
    rand::thread_rng().gen_range(1..i32::MAX)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sequential_ids_start_at_base_and_increment() {
        let allocator = SequentialIdAllocator::new();
        assert_eq!(allocator.next(), DISPATCHER_ID_BASE);
        assert_eq!(allocator.next(), DISPATCHER_ID_BASE + 1);
        assert_eq!(allocator.next(), DISPATCHER_ID_BASE + 2);
    }

    #[test]
    fn test_random_channel_ids_are_positive() {
        for _ in 0..1000 {
            assert!(random_channel_id() > 0);
        }
    }
}
