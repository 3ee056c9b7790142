use thiserror::Error;

/// Errors produced while reading or mapping a PE32+ image.
///
/// `MissingDependency` and `UnresolvedSymbol` are only returned under
/// [`FailurePolicy::Strict`](crate::FailurePolicy::Strict); the lenient policy records them in the
/// [`MapReport`](crate::MapReport) and keeps going.
#[derive(Debug, Error)]
pub enum Error {
    /// Header signature, machine type or optional-header magic is wrong, or the header is
    /// truncated. Raised before anything is allocated.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A structure inside an otherwise valid image points outside its bounds.
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    #[error("failed to load dependency {module}: {reason}")]
    MissingDependency { module: String, reason: String },

    #[error("unresolved import {module}!{symbol}")]
    UnresolvedSymbol { module: String, symbol: String },

    /// The image has no relocation directory and is not loaded at its preferred base.
    #[error("image has no relocations and cannot move from 0x{preferred:X} to 0x{actual:X}")]
    NotRelocatable { preferred: u64, actual: u64 },

    #[error("failed to allocate 0x{size:X} bytes for the mapped image")]
    AllocationFailure { size: usize },

    /// Changing page protection (or committing pages) failed on the host.
    #[error("memory operation failed: {0}")]
    Memory(String),
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! invalid_image {
    ($($arg:tt)*) => {
        crate::Error::InvalidImage(format!($($arg)*))
    };
}

macro_rules! corrupt_image {
    ($($arg:tt)*) => {
        crate::Error::CorruptImage(format!($($arg)*))
    };
}

pub(crate) use corrupt_image;
pub(crate) use invalid_image;
