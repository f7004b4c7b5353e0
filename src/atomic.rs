//! Durable single-word operations: the intermediate-state resolver, the
//! PMEM-aware read and the persistent compare-and-swap.
//!
//! These three functions carry the reader side of the protocol. Any thread
//! which observes a tagged word helps drive it to a stable, persisted value
//! before acting on it, so a value returned to a caller is guaranteed to
//! survive a crash even if the writer has not finished yet.

use crate::consts::{BACKOFF_TIME, SPIN_RETRY_NUM, WORD_SIZE};
use crate::pmem;
use crate::word::{Swappable, Word};
use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Drive `word` (the caller's copy of `*addr`) to a non-intermediate value.
///
/// Returns with `word` clean. The word in memory has either been promoted
/// to its persisted clean form or was already cleaned by a concurrent
/// thread. A word carrying a descriptor locator is left for its installer
/// to finish; this function only waits it out.
pub(crate) fn resolve_intermediate(addr: &AtomicU64, word: &mut u64) {
    while Word(*word).is_intermediate() {
        for _ in 0..SPIN_RETRY_NUM {
            hint::spin_loop();
            *word = addr.load(Ordering::Relaxed);
            if !Word(*word).is_intermediate() {
                return;
            }
        }

        let observed: u64 = *word;
        thread::sleep(BACKOFF_TIME);
        *word = addr.load(Ordering::Relaxed);
        if !Word(*word).is_intermediate() {
            return;
        }
        if Word(*word).is_descriptor() || *word != observed {
            // someone else is making progress on this word
            continue;
        }

        // dirty and unchanged: persist it, then promote it to clean. A
        // failed CAS means another reader promoted the same value first.
        pmem::persist((addr as *const AtomicU64).cast(), WORD_SIZE);
        let clean: u64 = Word(*word).clean().as_u64();
        let _ = addr.compare_exchange(*word, clean, Ordering::Relaxed, Ordering::Relaxed);
        *word = clean;
        return;
    }
}

/// Read a target word, cooperating with in-flight writers.
///
/// Every read of a word that can be a PMwCAS or [`pcas`] target must go
/// through this function; a plain load may observe a descriptor locator or
/// a not-yet-persisted value.
pub fn pload<T: Swappable>(addr: &AtomicU64, order: Ordering) -> T {
    let mut word: u64 = addr.load(order);
    resolve_intermediate(addr, &mut word);
    T::from_word(word)
}

/// Durable single-word compare-and-swap.
///
/// On success, `*addr` holds `desired` and the value has been persisted
/// before the call returns. On failure, `expected` is updated to the
/// current clean value of the word and nothing has been persisted on
/// behalf of this call.
///
/// The new value is first installed under the dirty marker so concurrent
/// readers can help persist it, then persisted, then committed clean. A
/// failure of the final commit CAS is benign: a cooperating reader already
/// promoted the word.
pub fn pcas<T: Swappable>(
    addr: &AtomicU64,
    expected: &mut T,
    desired: T,
    success: Ordering,
    failure: Ordering,
) -> bool {
    let orig_expected: u64 = Word::value(*expected).as_u64();
    let desired_word: u64 = Word::value(desired).as_u64();
    let dirty_word: u64 = Word(desired_word).dirty().as_u64();

    let mut current: u64 = orig_expected;
    while let Err(observed) =
        addr.compare_exchange_weak(current, dirty_word, Ordering::Relaxed, failure)
    {
        current = observed;
        if Word(current).is_intermediate() {
            // never report an in-flight value back to the caller
            resolve_intermediate(addr, &mut current);
        }
        if current != orig_expected {
            *expected = T::from_word(current);
            return false;
        }
    }

    pmem::persist((addr as *const AtomicU64).cast(), WORD_SIZE);
    let _ = addr.compare_exchange(dirty_word, desired_word, success, Ordering::Relaxed);
    true
}
