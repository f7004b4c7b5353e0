//! A minimal persistent-memory pool and the persistence primitives the
//! algorithm is built on.
//!
//! [`PmemPool`] maps a pool file into the address space and hands out
//! pool-relative object locators ([`PmemOid`]), so data inside the pool is
//! self-describing even when a later run maps the file at a different base
//! address. The free functions [`flush`], [`drain`] and [`persist`] are the
//! cache-line write-back and store-fence primitives of the PMEM programming
//! model; every durability guarantee in this crate reduces to them.

use crate::consts::{CACHE_LINE_SIZE, PMEM_LINE_SIZE};
use crate::err::PoolError;
use core::mem::size_of;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr::NonNull;

const POOL_MAGIC: u64 = 0x504d_5743_4153_5031; // "PMWCASP1"
const FORMAT_VERSION: u64 = 1;
const LAYOUT_BYTES: usize = 32;

/// The first PMEM line of the file is the pool header; the data area starts
/// right behind it.
const DATA_OFF: u64 = PMEM_LINE_SIZE as u64;

#[repr(C)]
struct PoolHeader {
    magic: u64,
    version: u64,
    pool_size: u64,
    root_size: u64,
    layout: [u8; LAYOUT_BYTES],
}

const _: () = assert!(size_of::<PoolHeader>() <= PMEM_LINE_SIZE);

/// A pool-relative object locator.
///
/// Locators survive re-mapping the pool at a different virtual base, which
/// raw pointers do not. The offset is computed with wrapping arithmetic, so
/// addresses outside the pool still resolve correctly within a single run;
/// they simply cannot be recovered after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmemOid {
    off: u64,
}

impl PmemOid {
    /// A locator for a known offset from the pool base.
    pub const fn from_offset(off: u64) -> Self {
        Self { off }
    }

    /// The offset from the pool base.
    pub const fn offset(self) -> u64 {
        self.off
    }
}

/// A memory-mapped pool file.
#[derive(Debug)]
pub struct PmemPool {
    map: MmapMut,
    base: NonNull<u8>,
}

// The mapping is owned by the pool and all cross-thread access inside it
// goes through single-word atomics.
unsafe impl Send for PmemPool {}
unsafe impl Sync for PmemPool {}

impl PmemPool {
    /// Create a new pool file of `size` bytes tagged with `layout`.
    ///
    /// Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, layout: &str, size: usize) -> Result<Self, PoolError> {
        let layout_bytes: [u8; LAYOUT_BYTES] = encode_layout(layout)?;
        if size < PMEM_LINE_SIZE {
            return Err(PoolError::TooSmall);
        }

        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size as u64)?;

        let pool: Self = Self::from_map(unsafe { MmapMut::map_mut(&file)? });
        let header = PoolHeader {
            magic: POOL_MAGIC,
            version: FORMAT_VERSION,
            pool_size: size as u64,
            root_size: 0,
            layout: layout_bytes,
        };
        unsafe { pool.base.as_ptr().cast::<PoolHeader>().write(header) };
        persist(pool.base.as_ptr(), size_of::<PoolHeader>());
        Ok(pool)
    }

    /// Map an existing pool file and validate its header against `layout`.
    pub fn open(path: impl AsRef<Path>, layout: &str) -> Result<Self, PoolError> {
        let layout_bytes: [u8; LAYOUT_BYTES] = encode_layout(layout)?;

        let file: File = OpenOptions::new().read(true).write(true).open(path)?;
        let map: MmapMut = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < PMEM_LINE_SIZE {
            return Err(PoolError::BadMagic);
        }

        let pool: Self = Self::from_map(map);
        let header: &PoolHeader = unsafe { &*pool.base.as_ptr().cast::<PoolHeader>() };
        if header.magic != POOL_MAGIC {
            return Err(PoolError::BadMagic);
        }
        if header.version != FORMAT_VERSION {
            return Err(PoolError::FormatVersion(header.version));
        }
        if header.layout != layout_bytes {
            return Err(PoolError::LayoutMismatch {
                existing: decode_layout(&header.layout),
                requested: layout.to_string(),
            });
        }
        if (pool.len() as u64) < header.pool_size {
            return Err(PoolError::TooSmall);
        }
        Ok(pool)
    }

    fn from_map(mut map: MmapMut) -> Self {
        let base: NonNull<u8> = unsafe { NonNull::new_unchecked(map.as_mut_ptr()) };
        Self { map, base }
    }

    /// Reserve (or re-locate, on an existing pool) the root region of `size`
    /// bytes at the start of the data area.
    pub fn root(&mut self, size: usize) -> Result<PmemOid, PoolError> {
        if DATA_OFF + size as u64 > self.len() as u64 {
            return Err(PoolError::TooSmall);
        }
        let header: &mut PoolHeader = unsafe { &mut *self.base.as_ptr().cast::<PoolHeader>() };
        if header.root_size < size as u64 {
            header.root_size = size as u64;
            persist_obj(&header.root_size);
        }
        Ok(PmemOid { off: DATA_OFF })
    }

    /// Resolve a locator to an address inside the current mapping.
    pub fn direct(&self, oid: PmemOid) -> NonNull<u8> {
        let addr: u64 = (self.base.as_ptr() as u64).wrapping_add(oid.off);
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// The locator of an address relative to the current mapping.
    pub fn oid<T>(&self, ptr: *const T) -> PmemOid {
        PmemOid {
            off: (ptr as u64).wrapping_sub(self.base.as_ptr() as u64),
        }
    }

    /// The base address of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the mapping is empty. A successfully opened pool never is.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// The end of the root region: the offset of the first byte of spare
    /// data space. Data placed here is addressable by locator and
    /// therefore crash-recoverable.
    pub fn root_end(&self) -> u64 {
        let header: &PoolHeader = unsafe { &*self.base.as_ptr().cast::<PoolHeader>() };
        DATA_OFF + header.root_size
    }
}

fn encode_layout(layout: &str) -> Result<[u8; LAYOUT_BYTES], PoolError> {
    let raw: &[u8] = layout.as_bytes();
    if raw.len() > LAYOUT_BYTES {
        return Err(PoolError::LayoutTooLong(layout.to_string()));
    }
    let mut bytes = [0u8; LAYOUT_BYTES];
    bytes[..raw.len()].copy_from_slice(raw);
    Ok(bytes)
}

fn decode_layout(bytes: &[u8; LAYOUT_BYTES]) -> String {
    let end: usize = bytes.iter().position(|byte| *byte == 0).unwrap_or(LAYOUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Write the cache lines covering `[addr, addr + len)` back toward
/// persistent media. Does not order the write-backs; follow with [`drain`].
pub fn flush(addr: *const u8, len: usize) {
    let start: usize = (addr as usize) & !(CACHE_LINE_SIZE - 1);
    let end: usize = (addr as usize).saturating_add(len);
    let mut line: usize = start;
    while line < end {
        flush_line(line as *const u8);
        line += CACHE_LINE_SIZE;
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "clflushopt"))]
#[inline]
fn flush_line(line: *const u8) {
    unsafe { core::arch::x86_64::_mm_clflushopt(line as *mut u8) };
}

#[cfg(all(target_arch = "x86_64", not(target_feature = "clflushopt")))]
#[inline]
fn flush_line(line: *const u8) {
    unsafe { core::arch::x86_64::_mm_clflush(line) };
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn flush_line(line: *const u8) {
    unsafe { core::arch::asm!("dc cvac, {0}", in(reg) line) };
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
fn flush_line(_line: *const u8) {}

/// Wait until every previously issued flush has reached persistent media.
pub fn drain() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence()
    };
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dmb ishst")
    };
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flush and drain in one step.
pub fn persist(addr: *const u8, len: usize) {
    flush(addr, len);
    drain();
}

/// Persist a whole object.
pub fn persist_obj<T>(obj: &T) {
    persist((obj as *const T).cast(), size_of::<T>());
}
