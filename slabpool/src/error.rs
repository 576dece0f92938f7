use std::{alloc::LayoutError, collections::TryReserveError, error::Error, fmt::Display};

/// Reasons a slab operation can fail to produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// The underlying memory allocator could not satisfy a request
    OutOfMemory,
    /// The requested object size and alignment do not form a valid layout
    /// (alignment not a power of two, or the size overflows)
    BadLayout,
}

impl Display for SlabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlabError::OutOfMemory => write!(f, "out of memory"),
            SlabError::BadLayout => write!(f, "invalid object size or alignment"),
        }
    }
}

impl Error for SlabError {}

impl From<TryReserveError> for SlabError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<LayoutError> for SlabError {
    fn from(_: LayoutError) -> Self {
        Self::BadLayout
    }
}
