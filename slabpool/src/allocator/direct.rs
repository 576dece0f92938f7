//! Degraded slab that makes one allocation per object
//!
//! Same interface as a regular slab, but nothing is pooled: every `alloc`
//! goes straight to the global allocator and every `free` releases the
//! memory right away. This makes use-after-free and leaks visible to
//! external memory checkers.

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    ptr::NonNull,
    slice,
};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{error::SlabError, util::UsizePtr};

use super::{SlabInitFn, SlabName, SlabStats, DEFAULT_ALIGN};

pub struct DirectSlab {
    name: SlabName,
    layout: Layout,
    init_func: Option<SlabInitFn>,
    /// Addresses of all objects currently handed out
    live: FxHashSet<usize>,
}

impl Debug for DirectSlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectSlab")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("live", &self.live.len())
            .finish()
    }
}

impl DirectSlab {
    /// `align` of 0 means [DEFAULT_ALIGN]
    ///
    /// Objects are exactly `obj_size` bytes (at least 1), no rounding is applied.
    pub fn new(
        name: &str,
        obj_size: usize,
        align: usize,
        init_func: Option<SlabInitFn>,
    ) -> Result<Self, SlabError> {
        let align = if align == 0 { DEFAULT_ALIGN } else { align };
        let layout = Layout::from_size_align(obj_size.max(1), align)?;
        Ok(Self {
            name: SlabName::new(name),
            layout,
            init_func,
            live: FxHashSet::default(),
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn alloc(&mut self) -> Result<NonNull<u8>, SlabError> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::direct::alloc", slab = self.name());
        let _span_enter = trace_span.enter();

        self.live.try_reserve(1)?;
        // safety: layout size is at least 1
        let ptr = match NonNull::new(unsafe { alloc::alloc_zeroed(self.layout) }) {
            Some(ptr) => ptr,
            None => {
                tracing::event!(Level::WARN, slab = self.name(), "direct allocation failed");
                return Err(SlabError::OutOfMemory);
            }
        };
        self.live.insert(ptr.as_ptr() as usize);

        if let Some(init_func) = self.init_func {
            // safety: fresh allocation of layout.size() bytes that nobody else knows about yet
            init_func(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), self.layout.size()) });
        }

        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));
        Ok(ptr)
    }

    /// Release an object immediately
    ///
    /// Pointers that were not handed out by this slab (or were already freed)
    /// are ignored, and trip an assertion in debug builds.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::direct::free", slab = self.name());
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));

        if self.live.remove(&(ptr.as_ptr() as usize)) {
            // safety: we allocated this with self.layout and it hasn't been freed yet
            unsafe { alloc::dealloc(ptr.as_ptr(), self.layout) };
        } else {
            debug_assert!(false, "Object does not belong to this slab or was already freed!");
        }
    }

    /// Nothing is ever cached, so this is the same as [active_count](Self::active_count)
    pub fn total_count(&self) -> usize {
        self.live.len()
    }

    pub fn free_count(&self) -> usize {
        0
    }

    pub fn active_count(&self) -> usize {
        self.live.len()
    }

    pub fn stats(&self) -> SlabStats<'_> {
        SlabStats {
            name: self.name(),
            slot_size: self.layout.size(),
            free_count: self.free_count(),
            total_count: self.total_count(),
        }
    }
}

impl Drop for DirectSlab {
    fn drop(&mut self) {
        for addr in self.live.drain() {
            // safety: every address in live came from alloc_zeroed with self.layout
            unsafe { alloc::dealloc(addr as *mut u8, self.layout) };
        }
    }
}
