//! # PMwCAS
//!
//! A persistent multi-word compare-and-swap library. It atomically and
//! durably swaps up to a compile-time number of independent 8-byte words in
//! byte-addressable persistent memory: concurrent readers and writers see
//! either all old or all new values, and so does every run of the process
//! after a crash. Because it only requires single-width atomic
//! compare-and-swap, the algorithm is lock-free.
//!
//! # Usage
//! ## Example
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use pmwcas::{pload, DescriptorPool};
//!
//! let path = std::env::temp_dir().join(format!("pmwcas-doc-{}.pool", std::process::id()));
//! # let _ = std::fs::remove_file(&path);
//!
//! // create (or reopen and recover) the pool backing the descriptors
//! let pool: DescriptorPool = DescriptorPool::open(&path, "example").unwrap();
//!
//! let first: AtomicU64 = AtomicU64::new(1);
//! let second: AtomicU64 = AtomicU64::new(2);
//!
//! // each thread drives its own descriptor
//! let mut desc = pool.get();
//! desc.add(&first, 1u64, 10u64, Ordering::Relaxed);
//! desc.add(&second, 2u64, 20u64, Ordering::Relaxed);
//! assert!(desc.pmwcas());
//!
//! // words touched by PMwCAS must be read through `pload`
//! assert_eq!(pload::<u64>(&first, Ordering::Relaxed), 10);
//! assert_eq!(pload::<u64>(&second, Ordering::Relaxed), 20);
//! # drop(pool);
//! # let _ = std::fs::remove_file(&path);
//! ```
//!
//! ## Details
//! Begin by opening a [DescriptorPool], which maps a pool file and holds
//! one descriptor per live thread. Opening an existing pool runs recovery:
//! operations interrupted by a crash are rolled forward when their commit
//! point had been persisted and rolled back otherwise.
//!
//! [DescriptorPool::get] hands the calling thread its own descriptor.
//! Register up to `CAPACITY` target words with
//! [add](DescriptorHandle::add), then execute them as one atomic, durable
//! operation with [pmwcas](DescriptorHandle::pmwcas). The operation
//! returns false — leaving every word untouched — when some word no longer
//! holds its expected value.
//!
//! While an operation is in flight its targets transiently hold tagged
//! marker words, so any word which can be a target must be read through
//! [pload], which cooperates with in-flight writers before returning a
//! stable, persisted value. [pcas] is the matching durable single-word
//! compare-and-swap.
//!
//! # Limitations
//! ## The two most significant bits of every value must be zero
//! Target words double as carriers for the descriptor and dirty markers,
//! which occupy bits 63 and 62. The supported value domain is unsigned
//! integers below 2^62 and native pointers whose high bits are known zero;
//! out-of-domain values are rejected at registration. The [Swappable]
//! trait can be implemented for other 8-byte values which uphold the same
//! promise.
//!
//! ## Crash consistency requires in-pool targets
//! Descriptors address their targets by pool-relative locators. Words
//! living outside the pool file (for example on the heap) work correctly
//! within a single run but cannot be repaired by recovery after a crash.
//!
//! ## One process at a time
//! A pool file must not be opened by two processes concurrently, and every
//! operation must have completed when the pool is dropped.
#![warn(missing_debug_implementations, missing_docs)]

mod atomic;
pub mod consts;
mod descriptor;
mod err;
pub mod pmem;
mod pool;
mod thread_id;
mod word;

pub use atomic::{pcas, pload};
pub use descriptor::PmwCasDescriptor;
pub use err::PoolError;
pub use pool::{DescriptorHandle, DescriptorPool};
pub use thread_id::thread_id;
pub use word::{Swappable, Word};
