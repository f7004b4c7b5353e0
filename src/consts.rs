//! Tuning parameters and platform assumptions shared by every module.

use core::time::Duration;

/// Assumes that the length of one word is 8 bytes.
pub const WORD_SIZE: usize = 8;

/// Assumes that the size of one cache line is 64 bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Assumes that the size of one PMEM read/write unit is 256 bytes.
pub const PMEM_LINE_SIZE: usize = 256;

/// The maximum number of spin rounds before an operation backs off or gives
/// up on a word stuck in an intermediate state.
pub const SPIN_RETRY_NUM: usize = 10;

/// How long a reader sleeps after exhausting its spin budget.
pub const BACKOFF_TIME: Duration = Duration::from_micros(10);

/// The maximum number of live threads which can hold a descriptor at the
/// same time. Bounds both the thread-ID manager and the size of the
/// descriptor array inside a pool file.
pub const MAX_THREAD_NUM: usize = 256;

/// The default number of target words per descriptor.
pub const DEFAULT_CAPACITY: usize = 4;

/// The minimum amount of spare data space mapped into every pool file
/// beyond the descriptor array.
pub const MIN_POOL_SIZE: usize = 8 * 1024 * 1024;
