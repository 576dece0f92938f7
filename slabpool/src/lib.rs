//! Fixed-size object pools ("slabs")
//!
//! See [allocator] for the pool itself and [shared] for a thread-safe wrapper.

pub mod allocator;
pub mod error;
mod loom_testing;
pub mod shared;
pub mod util;

pub use allocator::{
    direct::DirectSlab, Slab, SlabId, SlabInitFn, SlabRoot, SlabStats, SlotRef, DEFAULT_ALIGN,
};
pub use error::SlabError;
pub use shared::SharedSlabRoot;
