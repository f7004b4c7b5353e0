//! The process-wide descriptor pool: PMEM-backed storage for one
//! descriptor per live thread, recovered on every open.

use crate::consts::{DEFAULT_CAPACITY, MAX_THREAD_NUM, MIN_POOL_SIZE, PMEM_LINE_SIZE};
use crate::descriptor::PmwCasDescriptor;
use crate::err::PoolError;
use crate::pmem::{self, PmemOid, PmemPool};
use crate::thread_id;
use crate::word::{Swappable, Word};
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::path::Path;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A PMEM-resident array of descriptors, one per live thread.
///
/// Opening the pool runs recovery: every descriptor left in a
/// non-neutral state by a crash is rolled forward or back before the pool
/// is handed to the caller, so every target word is back to a stable
/// pre- or post-operation value.
///
/// The pool may be shared freely between threads. It must not be opened by
/// two processes at once, and dropping it while an operation is in flight
/// is a contract violation (the in-flight operation will be rolled back or
/// forward at the next open, like a crash).
#[derive(Debug)]
pub struct DescriptorPool<const CAPACITY: usize = DEFAULT_CAPACITY> {
    pmem: PmemPool,
    descriptors: NonNull<PmwCasDescriptor<CAPACITY>>,
}

// Descriptor slots are partitioned by thread ID and the mapping itself is
// immutable while the pool is open.
unsafe impl<const CAPACITY: usize> Send for DescriptorPool<CAPACITY> {}
unsafe impl<const CAPACITY: usize> Sync for DescriptorPool<CAPACITY> {}

impl<const CAPACITY: usize> DescriptorPool<CAPACITY> {
    /// Create or open the pool file at `path` and run recovery.
    ///
    /// A new file is sized for one descriptor per possible thread plus
    /// spare data space. An existing file must carry the same `layout`
    /// name it was created with.
    #[cfg_attr(feature = "tracing", instrument(skip(path)))]
    pub fn open(path: impl AsRef<Path>, layout: &str) -> Result<Self, PoolError> {
        let path: &Path = path.as_ref();
        let desc_size: usize = size_of::<PmwCasDescriptor<CAPACITY>>();
        let root_size: usize = desc_size * (MAX_THREAD_NUM + 1);

        let mut pmem: PmemPool = if path.exists() {
            PmemPool::open(path, layout)?
        } else {
            let pool_size: usize = PMEM_LINE_SIZE + root_size + MIN_POOL_SIZE;
            PmemPool::create(path, layout, pool_size)?
        };

        let root: PmemOid = pmem.root(root_size)?;
        let root_addr: usize = pmem.direct(root).as_ptr() as usize;
        // the allocator only promises word alignment for the root; the
        // extra descriptor in root_size covers the adjustment
        let aligned: usize = (root_addr + PMEM_LINE_SIZE - 1) & !(PMEM_LINE_SIZE - 1);
        let descriptors: NonNull<PmwCasDescriptor<CAPACITY>> =
            unsafe { NonNull::new_unchecked(aligned as *mut PmwCasDescriptor<CAPACITY>) };

        let base: *mut u8 = pmem.base().as_ptr();
        for index in 0..MAX_THREAD_NUM {
            let desc: &mut PmwCasDescriptor<CAPACITY> =
                unsafe { &mut *descriptors.as_ptr().add(index) };
            let off: u64 = pmem.oid(desc as *const PmwCasDescriptor<CAPACITY>).offset();
            desc.initialize(off, base);
        }
        pmem::drain();

        Ok(Self { pmem, descriptors })
    }

    /// The calling thread's descriptor.
    ///
    /// Repeated calls from one thread return a handle to the same
    /// descriptor; live threads never share one. The handle borrows the
    /// pool and is meant to be used for one operation at a time, not
    /// stored away.
    pub fn get(&self) -> DescriptorHandle<'_, CAPACITY> {
        DescriptorHandle {
            desc: unsafe { NonNull::new_unchecked(self.slot_ptr(thread_id::thread_id())) },
            pool: self,
        }
    }

    /// The underlying pool mapping.
    ///
    /// Target words which must survive a crash belong in the spare data
    /// space past [`PmemPool::root_end`], where the descriptors' locators
    /// can find them again after a restart.
    pub fn pmem(&self) -> &PmemPool {
        &self.pmem
    }

    pub(crate) fn slot_ptr(&self, index: usize) -> *mut PmwCasDescriptor<CAPACITY> {
        debug_assert!(index < MAX_THREAD_NUM);
        unsafe { self.descriptors.as_ptr().add(index) }
    }
}

/// A borrowed, per-thread view of one descriptor.
///
/// Obtained from [`DescriptorPool::get`]; registers targets with
/// [`add`](Self::add) and commits them with [`pmwcas`](Self::pmwcas).
#[derive(Debug)]
pub struct DescriptorHandle<'a, const CAPACITY: usize = DEFAULT_CAPACITY> {
    desc: NonNull<PmwCasDescriptor<CAPACITY>>,
    pool: &'a DescriptorPool<CAPACITY>,
}

impl<const CAPACITY: usize> DescriptorHandle<'_, CAPACITY> {
    /// Register one target word: swap `old` for `new` at `addr`.
    ///
    /// `order` is applied to the store which makes `new` visible when the
    /// operation commits; every other internal access is relaxed. The word
    /// behind `addr` must stay alive until the operation completes; words
    /// inside the pool file additionally survive crashes.
    ///
    /// # Panics
    /// Panics when a value collides with the reserved tag bits or when
    /// more than `CAPACITY` targets are registered.
    pub fn add<T: Swappable>(&mut self, addr: &AtomicU64, old: T, new: T, order: Ordering) {
        let old_word: u64 = Word::value(old).as_u64();
        let new_word: u64 = Word::value(new).as_u64();
        let off: u64 = self.pool.pmem.oid(addr as *const AtomicU64).offset();
        unsafe { self.desc.as_mut() }.add(off, old_word, new_word, order);
    }

    /// Atomically and durably swap every registered word.
    ///
    /// Returns true when all words were swapped; false when some word no
    /// longer held its registered old value, in which case every word is
    /// left (or restored) untouched. The descriptor is reset either way.
    pub fn pmwcas(&mut self) -> bool {
        unsafe { self.desc.as_mut() }.pmwcas(self.pool.pmem.base().as_ptr())
    }

    /// The number of registered targets.
    pub fn len(&self) -> usize {
        unsafe { self.desc.as_ref() }.count()
    }

    /// Whether no target has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The maximum number of targets per operation.
    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    /// The descriptor's address, stable for the life of the pool.
    pub fn as_ptr(&self) -> *const PmwCasDescriptor<CAPACITY> {
        self.desc.as_ptr()
    }
}
