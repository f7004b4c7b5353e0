//! Stable small-integer identifiers for live threads.
//!
//! A thread claims the lowest free slot on its first call and keeps it
//! until the thread exits, at which point the slot returns to the free set
//! and may be handed to a later thread. The identifier indexes the
//! per-thread descriptor inside every open pool.

use crate::consts::MAX_THREAD_NUM;
use core::sync::atomic::{AtomicBool, Ordering};

static SLOTS: [AtomicBool; MAX_THREAD_NUM] = [const { AtomicBool::new(false) }; MAX_THREAD_NUM];

#[derive(Debug)]
struct SlotGuard {
    id: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        SLOTS[self.id].store(false, Ordering::Release);
    }
}

fn claim_slot() -> SlotGuard {
    for id in 0..MAX_THREAD_NUM {
        if SLOTS[id]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return SlotGuard { id };
        }
    }
    panic!("all {MAX_THREAD_NUM} thread-ID slots are in use");
}

thread_local! {
    static SLOT: SlotGuard = claim_slot();
}

/// The calling thread's identifier in `0..MAX_THREAD_NUM`.
///
/// Stable for the life of the thread; distinct between live threads.
pub fn thread_id() -> usize {
    SLOT.with(|slot| slot.id)
}
