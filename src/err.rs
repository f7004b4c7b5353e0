use displaydoc::Display;
use std::error::Error;
use std::io;

/// Errors surfaced while creating or opening a descriptor pool file.
///
/// Pool construction is the only part of the public API which reports
/// errors; the hot-path operations return domain booleans and treat
/// contract violations as fatal.
#[derive(Debug, Display)]
pub enum PoolError {
    /// could not create or map the pool file: {0}
    Io(io::Error),

    /// the file is not a descriptor pool (bad magic number)
    BadMagic,

    /// the pool uses format version {0}, which this build does not support
    FormatVersion(u64),

    /** the pool was created with layout "{existing}" but was opened with
       layout "{requested}"
    */
    LayoutMismatch {
        /// The layout name recorded in the pool header.
        existing: String,
        /// The layout name the caller asked for.
        requested: String,
    },

    /// the layout name "{0}" is longer than the pool header can record
    LayoutTooLong(String),

    /// the pool file is too small to hold the requested root region
    TooSmall,
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<io::Error> for PoolError {
    fn from(cause: io::Error) -> Self {
        Self::Io(cause)
    }
}
