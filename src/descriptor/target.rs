//! One target slot inside a descriptor: the per-word half of the commit
//! protocol.

use crate::consts::{SPIN_RETRY_NUM, WORD_SIZE};
use crate::pmem;
use crate::word::Word;
use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};

/// An immutable (address, old, new) triple plus the memory order applied to
/// the visible-commit store.
///
/// The address is kept as a pool-relative locator rather than a raw
/// pointer, so a descriptor read back after a restart still knows which
/// word it was operating on. Every operation therefore takes the current
/// pool base.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PmwCasTarget {
    addr_off: u64,
    old: u64,
    new: u64,
    order: u64,
}

impl PmwCasTarget {
    pub(crate) fn new(addr_off: u64, old: u64, new: u64, order: Ordering) -> Self {
        Self {
            addr_off,
            old,
            new,
            order: store_order_code(order),
        }
    }

    /// The target word as an atomic cell under the given pool base.
    ///
    /// The caller guarantees the registered address is still mapped; for
    /// in-pool addresses the pool mapping itself guarantees it.
    fn word_ref<'a>(&self, base: *mut u8) -> &'a AtomicU64 {
        let addr: u64 = (base as u64).wrapping_add(self.addr_off);
        unsafe { &*(addr as *const AtomicU64) }
    }

    /// Try to replace the expected old value with a descriptor word.
    ///
    /// Uses relaxed ordering; the linearization of the whole operation
    /// comes from the descriptor's status persist, not from this CAS. On
    /// observing another operation's intermediate word, spins a bounded
    /// number of rounds before giving up.
    pub(crate) fn install(&self, base: *mut u8, desc_word: u64) -> bool {
        let addr: &AtomicU64 = self.word_ref(base);
        let mut spins: usize = 0;
        loop {
            let mut observed: u64 = addr.load(Ordering::Relaxed);
            if observed == self.old {
                match addr.compare_exchange(
                    self.old,
                    desc_word,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(current) => observed = current,
                }
            }
            if !Word(observed).is_intermediate() || spins >= SPIN_RETRY_NUM {
                return false;
            }
            spins += 1;
            hint::spin_loop();
        }
    }

    /// Write the target word back toward persistent media, without a fence.
    pub(crate) fn flush(&self, base: *mut u8) {
        pmem::flush((self.word_ref(base) as *const AtomicU64).cast(), WORD_SIZE);
    }

    /// Replace the embedded descriptor word with the new value.
    pub(crate) fn redo(&self, base: *mut u8) {
        let addr: &AtomicU64 = self.word_ref(base);
        addr.store(self.new, decode_store_order(self.order));
        pmem::flush((addr as *const AtomicU64).cast(), WORD_SIZE);
    }

    /// Replace the embedded descriptor word with the original value.
    pub(crate) fn undo(&self, base: *mut u8) {
        let addr: &AtomicU64 = self.word_ref(base);
        addr.store(self.old, Ordering::Relaxed);
        pmem::flush((addr as *const AtomicU64).cast(), WORD_SIZE);
    }

    /// Repair this target after a restart.
    ///
    /// A dirty word is promoted in place; a word still holding the owning
    /// descriptor's locator is rolled forward or back according to the
    /// status the descriptor crashed with. Any other value means the
    /// operation already completed on this word.
    pub(crate) fn recover(&self, base: *mut u8, succeeded: bool, desc_word: u64) {
        let addr: &AtomicU64 = self.word_ref(base);
        let word: u64 = addr.load(Ordering::Relaxed);
        if Word(word).is_dirty() {
            addr.store(Word(word).clean().as_u64(), Ordering::Relaxed);
            pmem::flush((addr as *const AtomicU64).cast(), WORD_SIZE);
        } else if word == desc_word {
            let value: u64 = if succeeded { self.new } else { self.old };
            addr.store(value, Ordering::Relaxed);
            pmem::flush((addr as *const AtomicU64).cast(), WORD_SIZE);
        }
    }
}

// Stores may not use acquire semantics, so the caller's order is narrowed
// to its store-legal part before it is recorded.
fn store_order_code(order: Ordering) -> u64 {
    match order {
        Ordering::Relaxed | Ordering::Acquire => 0,
        Ordering::Release | Ordering::AcqRel => 1,
        _ => 2,
    }
}

fn decode_store_order(code: u64) -> Ordering {
    match code {
        0 => Ordering::Relaxed,
        1 => Ordering::Release,
        _ => Ordering::SeqCst,
    }
}
