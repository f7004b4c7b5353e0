//! The PMwCAS descriptor: an on-PMEM record describing one multi-word
//! compare-and-swap, and the state machine which executes it.
//!
//! A descriptor moves through three states. `Completed` is the neutral
//! state between operations. An operation first persists `Failed` together
//! with its targets ("if we crash now, roll back"), then installs its
//! locator into every target word. Once every install has landed, the
//! persist of `Succeeded` is the commit point: a crash before it recovers
//! to the old values, a crash after it recovers to the new values. The
//! final values are then stored over the embedded locators and the
//! descriptor returns to `Completed`.

mod target;

pub(crate) use target::PmwCasTarget;

use crate::consts::{DEFAULT_CAPACITY, WORD_SIZE};
use crate::pmem;
use crate::word::Word;
use core::mem::size_of;
use core::sync::atomic::Ordering;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// The progress state of a descriptor's current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum DescStatus {
    /// No operation in progress; the neutral state between operations.
    Completed = 0,
    /// An operation is in flight; a crash now must roll it back.
    Failed = 1,
    /// Every target holds the descriptor locator; a crash now must roll
    /// the operation forward.
    Succeeded = 2,
}

impl DescStatus {
    /// The only patterns ever persisted are the three variants; anything
    /// else is the pristine zero-filled file and reads as `Completed`.
    pub(crate) fn from_word(word: u64) -> Self {
        match word {
            1 => Self::Failed,
            2 => Self::Succeeded,
            _ => Self::Completed,
        }
    }
}

/// The status and target count form the descriptor header, the minimum
/// unit persisted on every state transition.
const HEADER_SIZE: usize = 2 * WORD_SIZE;

/// An on-PMEM descriptor for one multi-word compare-and-swap of up to
/// `CAPACITY` words.
///
/// Descriptors are created once, when the pool file is created, and live
/// as long as the file. Each is owned by exactly one thread between
/// consecutive [`DescriptorPool::get`](crate::DescriptorPool::get) calls,
/// so nothing inside it needs cross-thread synchronization; correctness
/// rests solely on the single-word atomics of the target words.
#[repr(C, align(256))]
#[derive(Debug)]
pub struct PmwCasDescriptor<const CAPACITY: usize = DEFAULT_CAPACITY> {
    status: u64,
    target_count: u64,
    desc_word: u64,
    targets: [PmwCasTarget; CAPACITY],
}

impl<const CAPACITY: usize> PmwCasDescriptor<CAPACITY> {
    /// Append a target. The words are already encoded and validated.
    ///
    /// # Panics
    /// Panics when the descriptor is full; registering more than
    /// `CAPACITY` targets is a contract violation.
    pub(crate) fn add(&mut self, addr_off: u64, old: u64, new: u64, order: Ordering) {
        let index: usize = self.target_count as usize;
        assert!(
            index < CAPACITY,
            "descriptor already holds {CAPACITY} targets",
        );
        self.targets[index] = PmwCasTarget::new(addr_off, old, new, order);
        self.target_count += 1;
    }

    /// The number of registered targets.
    pub(crate) fn count(&self) -> usize {
        self.target_count as usize
    }

    /// Execute the registered targets as one atomic, durable operation.
    ///
    /// Returns true when every word was swapped from its old to its new
    /// value, false when some word no longer held its old value (in which
    /// case every word is back to its old value). Either way the
    /// descriptor is reset for the next operation.
    #[cfg_attr(feature = "tracing", instrument)]
    pub(crate) fn pmwcas(&mut self, base: *mut u8) -> bool {
        let count: usize = self.target_count as usize;
        let used: usize = HEADER_SIZE + WORD_SIZE + count * size_of::<PmwCasTarget>();

        // if we crash from here on, recovery must roll back
        self.status = DescStatus::Failed as u64;
        pmem::persist((self as *const Self).cast(), used);

        let desc_word: u64 = self.desc_word;
        let mut embedded: usize = 0;
        while embedded < count && self.targets[embedded].install(base, desc_word) {
            embedded += 1;
        }

        if embedded < count {
            // a target moved on; revert the prefix we managed to install
            for target in &self.targets[..embedded] {
                target.undo(base);
            }
            pmem::drain();

            self.status = DescStatus::Completed as u64;
            self.target_count = 0;
            return false;
        }

        // every word now holds our locator; make the locators durable so
        // a recovering run can finish on our behalf, then commit
        for target in &self.targets[..count] {
            target.flush(base);
        }
        self.status = DescStatus::Succeeded as u64;
        pmem::flush((self as *const Self).cast(), HEADER_SIZE);
        pmem::drain();

        for target in &self.targets[..count] {
            target.redo(base);
        }
        pmem::drain();

        self.status = DescStatus::Completed as u64;
        self.target_count = 0;
        true
    }

    /// Reconcile this descriptor after a restart.
    ///
    /// Recomputes the self-locator (the pool may be mapped at a new base),
    /// rolls any interrupted operation forward or back according to the
    /// persisted status, and resets to the neutral state. Idempotent.
    #[cfg_attr(feature = "tracing", instrument)]
    pub(crate) fn initialize(&mut self, off: u64, base: *mut u8) {
        self.desc_word = Word::descriptor(off).as_u64();

        let status: DescStatus = DescStatus::from_word(self.status);
        if status != DescStatus::Completed {
            let succeeded: bool = status == DescStatus::Succeeded;
            let count: usize = (self.target_count as usize).min(CAPACITY);
            let desc_word: u64 = self.desc_word;
            for target in &self.targets[..count] {
                target.recover(base, succeeded, desc_word);
            }
        }

        self.status = DescStatus::Completed as u64;
        self.target_count = 0;
        pmem::flush((self as *const Self).cast(), HEADER_SIZE + WORD_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::pload;
    use crate::consts::WORD_SIZE;
    use crate::pmem::PmemOid;
    use crate::pool::DescriptorPool;
    use core::sync::atomic::AtomicU64;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use test_log::test;
    use tracing::debug;

    const LAYOUT: &str = "descriptor-tests";

    fn pool_path(dir: &TempDir) -> PathBuf {
        dir.path().join("descriptor.pool")
    }

    /// A word in the pool's spare data area, usable as a crash-recoverable
    /// PMwCAS target.
    fn pool_word(pool: &DescriptorPool, index: usize) -> &AtomicU64 {
        let off: u64 = pool_word_offset(pool, index);
        let ptr = pool.pmem().direct(PmemOid::from_offset(off));
        unsafe { &*ptr.cast::<AtomicU64>().as_ptr() }
    }

    fn pool_word_offset(pool: &DescriptorPool, index: usize) -> u64 {
        pool.pmem().root_end() + (index * WORD_SIZE) as u64
    }

    #[test]
    fn test_pmwcas_with_zero_targets_succeeds() {
        let dir: TempDir = TempDir::new().unwrap();
        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();

        let mut desc = pool.get();
        assert!(desc.is_empty());
        assert!(desc.pmwcas());
    }

    #[test]
    #[should_panic(expected = "already holds 4 targets")]
    fn test_add_beyond_capacity_panics() {
        let dir: TempDir = TempDir::new().unwrap();
        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();

        let word: AtomicU64 = AtomicU64::new(0);
        let mut desc = pool.get();
        for i in 0..5u64 {
            desc.add(&word, i, i + 1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_pmwcas_swaps_all_registered_words() {
        let dir: TempDir = TempDir::new().unwrap();
        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();

        let words: [AtomicU64; 4] = core::array::from_fn(|i| AtomicU64::new(i as u64 + 1));

        let mut desc = pool.get();
        for (i, word) in words.iter().enumerate() {
            let old: u64 = i as u64 + 1;
            desc.add(word, old, old * 10, Ordering::Relaxed);
        }
        assert_eq!(desc.len(), 4);
        assert!(desc.pmwcas());
        assert!(desc.is_empty());

        for (i, word) in words.iter().enumerate() {
            assert_eq!(pload::<u64>(word, Ordering::Relaxed), (i as u64 + 1) * 10);
        }
    }

    #[test]
    fn test_pmwcas_failure_restores_installed_words() {
        let dir: TempDir = TempDir::new().unwrap();
        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();

        let words: [AtomicU64; 4] = core::array::from_fn(|i| AtomicU64::new(i as u64 + 1));

        let mut desc = pool.get();
        desc.add(&words[0], 1u64, 10, Ordering::Relaxed);
        desc.add(&words[1], 2u64, 20, Ordering::Relaxed);
        // the third word never held 99, so the install phase stops here
        desc.add(&words[2], 99u64, 30, Ordering::Relaxed);
        desc.add(&words[3], 4u64, 40, Ordering::Relaxed);
        assert!(!desc.pmwcas());

        for (i, word) in words.iter().enumerate() {
            assert_eq!(pload::<u64>(word, Ordering::Relaxed), i as u64 + 1);
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir: TempDir = TempDir::new().unwrap();
        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();

        let desc_ptr = pool.slot_ptr(5);
        let off: u64 = pool.pmem().oid(desc_ptr).offset();
        let base: *mut u8 = pool.pmem().base().as_ptr();

        let desc = unsafe { &mut *desc_ptr };
        desc.initialize(off, base);
        let first: (u64, u64, u64) = (desc.status, desc.target_count, desc.desc_word);

        desc.initialize(off, base);
        assert_eq!(first, (desc.status, desc.target_count, desc.desc_word));
        assert_eq!(desc.desc_word, Word::descriptor(off).as_u64());
        assert_eq!(DescStatus::from_word(desc.status), DescStatus::Completed);
    }

    #[test]
    fn test_crash_after_commit_persist_rolls_forward() {
        let dir: TempDir = TempDir::new().unwrap();
        let old: [u64; 4] = [10, 20, 30, 40];
        let new: [u64; 4] = [11, 21, 31, 41];

        {
            let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();
            for (i, value) in old.iter().enumerate() {
                pool_word(&pool, i).store(*value, Ordering::Relaxed);
            }

            // drive the operation by hand up to just after the commit
            // point, then "crash" by dropping the mapping
            let desc = unsafe { &mut *pool.slot_ptr(0) };
            let base: *mut u8 = pool.pmem().base().as_ptr();
            for i in 0..4 {
                desc.add(pool_word_offset(&pool, i), old[i], new[i], Ordering::Relaxed);
            }
            desc.status = DescStatus::Failed as u64;
            pmem::persist(
                (desc as *const PmwCasDescriptor).cast(),
                HEADER_SIZE + WORD_SIZE + 4 * size_of::<PmwCasTarget>(),
            );

            let desc_word: u64 = desc.desc_word;
            for target in &desc.targets[..4] {
                assert!(target.install(base, desc_word));
                target.flush(base);
            }
            desc.status = DescStatus::Succeeded as u64;
            pmem::persist((desc as *const PmwCasDescriptor).cast(), HEADER_SIZE);
        }

        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();
        for (i, value) in new.iter().enumerate() {
            debug!("word {i} after recovery");
            assert_eq!(pload::<u64>(pool_word(&pool, i), Ordering::Relaxed), *value);
        }
        let desc = unsafe { &*pool.slot_ptr(0) };
        assert_eq!(DescStatus::from_word(desc.status), DescStatus::Completed);
        assert_eq!(desc.target_count, 0);
    }

    #[test]
    fn test_crash_during_install_rolls_back() {
        let dir: TempDir = TempDir::new().unwrap();
        let old: [u64; 4] = [10, 20, 30, 40];
        let new: [u64; 4] = [11, 21, 31, 41];

        {
            let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();
            for (i, value) in old.iter().enumerate() {
                pool_word(&pool, i).store(*value, Ordering::Relaxed);
            }

            // crash with only two of four locators installed and the
            // persisted status still saying "roll back"
            let desc = unsafe { &mut *pool.slot_ptr(0) };
            let base: *mut u8 = pool.pmem().base().as_ptr();
            for i in 0..4 {
                desc.add(pool_word_offset(&pool, i), old[i], new[i], Ordering::Relaxed);
            }
            desc.status = DescStatus::Failed as u64;
            pmem::persist(
                (desc as *const PmwCasDescriptor).cast(),
                HEADER_SIZE + WORD_SIZE + 4 * size_of::<PmwCasTarget>(),
            );

            let desc_word: u64 = desc.desc_word;
            for target in &desc.targets[..2] {
                assert!(target.install(base, desc_word));
                target.flush(base);
            }
        }

        let pool: DescriptorPool = DescriptorPool::open(pool_path(&dir), LAYOUT).unwrap();
        for (i, value) in old.iter().enumerate() {
            assert_eq!(pload::<u64>(pool_word(&pool, i), Ordering::Relaxed), *value);
        }
        let desc = unsafe { &*pool.slot_ptr(0) };
        assert_eq!(DescStatus::from_word(desc.status), DescStatus::Completed);
    }
}
