//! Fixed-size object slab allocator
//!
//! Each [Slab] hands out same-sized, same-aligned slots carved out of
//! coarse backing allocations ("fragments"). Fragments are only ever
//! released as a whole, when the owning slab is destroyed.
//!
//! Free slots are tracked in an explicit stack of slot indices, which lives
//! outside of the slot memory. Nothing is ever written into a slot by the
//! allocator except the zero-fill (or the initializer) on allocation, so the
//! contents of a slot survive being freed.
//!
//! Slab metadata is itself allocated from a slab, the "header" slab, which is
//! created lazily by the owning [SlabRoot]. The header slab's own metadata
//! lives directly inside the [SlabRoot]; every other slab's metadata lives in
//! one of the header slab's slots.
//!
//! Nothing here is synchronized. A [SlabRoot] can be moved between threads,
//! but all mutation requires `&mut`. See [crate::shared] for a locked wrapper.

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    mem::{align_of, size_of},
    ptr::{self, addr_of, NonNull},
    slice,
};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{
    error::SlabError,
    util::{debug_hexdump, UsizePtr},
};

pub mod direct;

/// Size of the name buffer of a slab, including one byte reserved for a terminator
pub const SLAB_NAME_MAX: usize = 32;
/// Slot alignment used when no custom alignment is requested
pub const DEFAULT_ALIGN: usize = align_of::<usize>();
/// Name of the slab that slab metadata is allocated from
pub const HEADER_SLAB_NAME: &str = "slab_header";
/// A small slab tries to fill this many bytes when it grows
const GROW_TARGET_BYTES: usize = 16 * 1024;
/// Never grow by fewer than this many slots
const GROW_MIN_COUNT: usize = 50;

/// Per-object initializer, called with the full slot on every allocation
///
/// The slot contains either zeroes (if it is fresh) or whatever the
/// previous occupant left behind when it was freed.
pub type SlabInitFn = fn(&mut [u8]);

/// Compute the layout of a single slot
///
/// An `align` of 0 selects [DEFAULT_ALIGN]. Zero-sized objects still get
/// one alignment unit so that every slot has a distinct address.
fn slot_layout(obj_size: usize, align: usize) -> Result<Layout, SlabError> {
    let align = if align == 0 { DEFAULT_ALIGN } else { align };
    Ok(Layout::from_size_align(obj_size.max(1), align)?.pad_to_align())
}

/// Short, bounded-length slab name
///
/// Names longer than `SLAB_NAME_MAX - 1` bytes are truncated
/// (on a character boundary).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabName {
    buf: [u8; SLAB_NAME_MAX],
    len: u8,
}

impl SlabName {
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(SLAB_NAME_MAX - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut buf = [0; SLAB_NAME_MAX];
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // only ever filled from a &str cut at a char boundary
        std::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

impl Debug for SlabName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self.as_str(), f)
    }
}

/// Location of a slot: which fragment, and which slot within it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct SlotIdx {
    frag: usize,
    idx: usize,
}

/// Handle to one allocated slot
///
/// This is both the key used to give the slot back and the way to get at
/// its memory. The allocator never creates references to slot memory while
/// the slot is handed out, so it is fine to access it through
/// [as_ptr](Self::as_ptr) from unsafe code for as long as the slot is not freed
/// and its slab is not destroyed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    ptr: NonNull<u8>,
    at: SlotIdx,
}
// safety: this is only an address plus indices, all accesses through it are unsafe anyways
unsafe impl Send for SlotRef {}
unsafe impl Sync for SlotRef {}

impl SlotRef {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Pointer to the slot, cast to `T`
    ///
    /// Only aligned for `T` if the slab alignment is at least `align_of::<T>()`
    #[inline]
    pub fn cast<T>(&self) -> NonNull<T> {
        self.ptr.cast()
    }
}

impl Debug for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRef")
            .field("ptr", &UsizePtr::from(self.ptr))
            .field("frag", &self.at.frag)
            .field("idx", &self.at.idx)
            .finish()
    }
}

/// One backing allocation, subdivided into `count` slots
///
/// Memory is obtained zeroed and is released only when the fragment is dropped.
struct SlabFrag {
    area: NonNull<u8>,
    layout: Layout,
    count: usize,
}
// safety: the fragment exclusively owns its memory
unsafe impl Send for SlabFrag {}

impl SlabFrag {
    /// Allocate a fragment for `count` slots of `slot_layout`
    ///
    /// Returns `None` if the memory could not be obtained
    /// (including if the total size overflows).
    fn new(count: usize, slot_layout: Layout) -> Option<Self> {
        debug_assert!(count > 0);
        let size = count.checked_mul(slot_layout.size())?;
        let layout = Layout::from_size_align(size, slot_layout.align()).ok()?;
        // safety: layout is nonzero-sized because both count and slot size are nonzero
        let area = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self {
            area,
            layout,
            count,
        })
    }

    #[inline]
    fn slot_ptr(&self, idx: usize, slot_size: usize) -> NonNull<u8> {
        assert!(idx < self.count);
        // safety: idx is in bounds, so the offset stays within our allocation
        unsafe { NonNull::new_unchecked(self.area.as_ptr().add(idx * slot_size)) }
    }
}

impl Drop for SlabFrag {
    fn drop(&mut self) {
        tracing::event!(
            Level::TRACE,
            ptr = ?UsizePtr::from(self.area),
            size = self.layout.size(),
            "release fragment"
        );
        // safety: allocated in new with exactly this layout
        unsafe { alloc::dealloc(self.area.as_ptr(), self.layout) };
    }
}

/// Snapshot of one slab's counters, as passed to [SlabRoot::for_each_pool]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabStats<'a> {
    pub name: &'a str,
    pub slot_size: usize,
    pub free_count: usize,
    pub total_count: usize,
}

/// Handle to a slab owned by a [SlabRoot]
///
/// Refers to the header slot holding the slab's metadata. The generation
/// tells apart successive slabs that happen to reuse the same header slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlabId {
    slot: SlotRef,
    generation: u64,
}

/// Store for objects of one size
pub struct Slab {
    /// Cleared (together with everything else) when the slab is destroyed
    live: bool,
    generation: u64,
    name: SlabName,
    /// Size and alignment of every slot
    slot_layout: Layout,
    /// Number of slots ever carved out, never decreases
    total_count: usize,
    /// Stack of free slots, most recently freed on top
    ///
    /// Capacity is kept at least `total_count` so that freeing never allocates
    free_list: Vec<SlotIdx>,
    frags: Vec<SlabFrag>,
    init_func: Option<SlabInitFn>,
    /// Registry links (unused by the header slab)
    prev: Option<SlabId>,
    next: Option<SlabId>,
}

impl Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("@addr", &(self as *const _))
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("slot_layout", &self.slot_layout)
            .field("total_count", &self.total_count)
            .field("free_count", &self.free_list.len())
            .field("frags", &self.frags.len())
            .field("prev", &self.prev)
            .field("next", &self.next)
            .finish()
    }
}

impl Slab {
    fn new(name: &str, slot_layout: Layout, init_func: Option<SlabInitFn>, generation: u64) -> Self {
        Self {
            live: true,
            generation,
            name: SlabName::new(name),
            slot_layout,
            total_count: 0,
            free_list: Vec::new(),
            frags: Vec::new(),
            init_func,
            prev: None,
            next: None,
        }
    }

    /// The slab whose slots hold [Slab] metadata
    fn new_header() -> Self {
        Self::new(
            HEADER_SLAB_NAME,
            Layout::new::<Slab>().pad_to_align(),
            None,
            0,
        )
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Size of every slot, after rounding up to the alignment
    pub fn slot_size(&self) -> usize {
        self.slot_layout.size()
    }

    pub fn slot_align(&self) -> usize {
        self.slot_layout.align()
    }

    /// Total number of slots ever carved out for this slab
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// Number of slots currently free
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Number of slots currently handed out
    pub fn active_count(&self) -> usize {
        self.total_count.saturating_sub(self.free_list.len())
    }

    pub fn stats(&self) -> SlabStats<'_> {
        SlabStats {
            name: self.name(),
            slot_size: self.slot_size(),
            free_count: self.free_count(),
            total_count: self.total_count,
        }
    }

    /// How many slots the next growth adds
    fn grow_count(&self) -> usize {
        let mut count = self.total_count;
        if count < GROW_MIN_COUNT {
            count = GROW_TARGET_BYTES / self.slot_size();
        }
        if count < GROW_MIN_COUNT {
            count = GROW_MIN_COUNT;
        }
        count
    }

    /// Add one new fragment and put all of its slots on the free list
    ///
    /// Leaves the slab untouched on failure
    fn grow(&mut self) -> Result<(), SlabError> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::grow", slab = self.name());
        let _span_enter = trace_span.enter();

        let count = self.grow_count();

        self.frags.try_reserve(1)?;
        let want_free_cap = self
            .total_count
            .checked_add(count)
            .ok_or(SlabError::OutOfMemory)?;
        self.free_list
            .try_reserve(want_free_cap.saturating_sub(self.free_list.len()))?;
        let frag = SlabFrag::new(count, self.slot_layout).ok_or(SlabError::OutOfMemory)?;

        tracing::event!(
            Level::DEBUG,
            slab = self.name(),
            count,
            ptr = ?UsizePtr::from(frag.area),
            "grow"
        );

        // pushed in reverse so that a fresh fragment is handed out in address order
        let frag_i = self.frags.len();
        self.free_list
            .extend((0..count).rev().map(|idx| SlotIdx { frag: frag_i, idx }));
        self.frags.push(frag);
        self.total_count += count;

        Ok(())
    }

    #[inline]
    fn slot_ref(&self, at: SlotIdx) -> SlotRef {
        SlotRef {
            ptr: self.frags[at.frag].slot_ptr(at.idx, self.slot_size()),
            at,
        }
    }

    /// Whether `slot` is a slot of one of this slab's fragments
    fn owns(&self, slot: SlotRef) -> bool {
        match self.frags.get(slot.at.frag) {
            Some(frag) => {
                slot.at.idx < frag.count && frag.slot_ptr(slot.at.idx, self.slot_size()) == slot.ptr
            }
            None => false,
        }
    }

    /// Get a free slot, growing at most once
    ///
    /// The slot is passed through the initializer if there is one,
    /// and is zero-filled otherwise.
    fn alloc(&mut self) -> Result<SlotRef, SlabError> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::alloc", slab = self.name());
        let _span_enter = trace_span.enter();

        let at = match self.free_list.pop() {
            Some(at) => at,
            None => {
                if let Err(e) = self.grow() {
                    tracing::event!(Level::WARN, slab = self.name(), "slab could not grow: {}", e);
                    return Err(e);
                }
                self.free_list.pop().ok_or(SlabError::OutOfMemory)?
            }
        };

        let slot = self.slot_ref(at);
        // safety: the slot lies within one of our fragments, and it was on the free list,
        // so nobody else is supposed to be looking at it
        let bytes = unsafe { slice::from_raw_parts_mut(slot.as_ptr(), self.slot_size()) };
        match self.init_func {
            Some(init_func) => init_func(bytes),
            None => bytes.fill(0),
        }

        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot.ptr));
        Ok(slot)
    }

    /// Put a slot back on top of the free list
    ///
    /// The slot must have come from this slab and must not already be free.
    /// Neither is checked outside of debug builds; violating this hands the
    /// same slot out twice, but never touches memory outside of this slab.
    fn free(&mut self, slot: SlotRef) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::free", slab = self.name());
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot.ptr));

        debug_assert!(self.owns(slot), "Slot does not belong to this slab!");
        self.free_list.push(slot.at);
    }

    /// Walk all fragments and the free list, returning addresses of all
    /// slots that are currently handed out
    ///
    /// Panics if the free list is inconsistent
    fn debug_check(&self) -> FxHashSet<usize> {
        let slot_size = self.slot_size();
        let mut outstanding = FxHashSet::default();
        let mut carved = 0;
        for frag in &self.frags {
            for idx in 0..frag.count {
                outstanding.insert(frag.slot_ptr(idx, slot_size).as_ptr() as usize);
            }
            carved += frag.count;
        }
        assert_eq!(carved, self.total_count);

        for at in &self.free_list {
            let frag = match self.frags.get(at.frag) {
                Some(frag) if at.idx < frag.count => frag,
                _ => panic!("Free slot {:?} is not inside any fragment!", at),
            };
            let addr = frag.slot_ptr(at.idx, slot_size).as_ptr() as usize;
            if !outstanding.remove(&addr) {
                panic!("Slot 0x{:x} found in free list multiple times!", addr);
            }
        }

        outstanding
    }
}

/// Owner of all slabs: the registry of live slabs and the header slab
///
/// Dropping the root releases every slab it still owns.
///
/// ```
/// use slabpool::allocator::SlabRoot;
///
/// let mut root = SlabRoot::new();
/// let widgets = root.create("widget", 24, 0, None).unwrap();
///
/// let w = root.alloc(widgets).unwrap();
/// // safety: slots are at least 24 bytes and aligned for a usize
/// unsafe { w.cast::<usize>().as_ptr().write(42) };
/// root.free(widgets, w);
///
/// assert_eq!(root.get(widgets).active_count(), 0);
/// root.destroy(Some(widgets));
/// ```
pub struct SlabRoot {
    /// Slab that every other slab's metadata is allocated from
    ///
    /// Created on first use
    headers: Option<Slab>,
    /// Registry of live slabs, oldest first
    first: Option<SlabId>,
    last: Option<SlabId>,
    next_generation: u64,
}

impl Debug for SlabRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields = f.debug_struct("SlabRoot");
        fields.field("headers", &self.headers);
        let mut cur = self.first;
        let mut i = 0;
        while let Some(id) = cur {
            let slab = self.get(id);
            fields.field(&format!("slabs[{}]", i), slab);
            cur = slab.next;
            i += 1;
        }
        fields.finish()
    }
}

impl Default for SlabRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabRoot {
    pub const fn new() -> Self {
        Self {
            headers: None,
            first: None,
            last: None,
            next_generation: 1,
        }
    }

    /// Make a new, empty slab and add it to the registry
    ///
    /// `align` of 0 means [DEFAULT_ALIGN], otherwise it must be a power of two.
    /// If `init_func` is `None`, slots are zero-filled on every allocation.
    pub fn create(
        &mut self,
        name: &str,
        obj_size: usize,
        align: usize,
        init_func: Option<SlabInitFn>,
    ) -> Result<SlabId, SlabError> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::create", slab = name);
        let _span_enter = trace_span.enter();

        let slot_layout = slot_layout(obj_size, align)?;

        let headers = self.headers.get_or_insert_with(Slab::new_header);
        let header_slot = headers.alloc()?;
        // header slots are sized and aligned for a Slab
        debug_assert!(header_slot.as_ptr() as usize % align_of::<Slab>() == 0);

        let id = SlabId {
            slot: header_slot,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        let mut slab = Slab::new(name, slot_layout, init_func, id.generation);
        slab.prev = self.last;
        // safety: freshly allocated header slot, aligned and big enough for a Slab,
        // and holding no live Slab (it was zero-filled just now)
        unsafe { ptr::write(header_slot.cast::<Slab>().as_ptr(), slab) };

        match self.last {
            Some(last) => self.get_mut(last).next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);

        tracing::event!(
            Level::TRACE,
            meta = ?UsizePtr::from(header_slot.ptr),
            slot_size = slot_layout.size(),
            generation = id.generation
        );
        Ok(id)
    }

    /// Locate the metadata of a slab, panicking if `id` is not a live slab of this root
    fn meta_ptr(&self, id: SlabId) -> *mut Slab {
        let headers = match &self.headers {
            Some(headers) => headers,
            None => panic!("SlabId used with a SlabRoot that has no slabs!"),
        };
        if !headers.owns(id.slot) {
            panic!("SlabId does not belong to this SlabRoot!");
        }

        let p = id.slot.cast::<Slab>().as_ptr();
        // safety: p is an aligned header slot inside a live fragment.
        // a slot either holds a live Slab or is all zeroes, which reads as !live.
        // only individual fields are read here, never the whole (possibly zeroed) Slab
        let (live, generation) = unsafe { (addr_of!((*p).live).read(), addr_of!((*p).generation).read()) };
        if !live || generation != id.generation {
            panic!("Use of destroyed slab {:?}!", id);
        }
        p
    }

    /// Read-only access to a slab
    pub fn get(&self, id: SlabId) -> &Slab {
        // safety: meta_ptr checked that this slot holds a live Slab
        unsafe { &*self.meta_ptr(id) }
    }

    fn get_mut(&mut self, id: SlabId) -> &mut Slab {
        // safety: meta_ptr checked that this slot holds a live Slab,
        // and we hold &mut self so nobody else can be looking at it
        unsafe { &mut *self.meta_ptr(id) }
    }

    /// Release all memory of a slab and remove it from the registry
    ///
    /// `None` is a no-op. Slots handed out from the slab become dangling,
    /// and `id` must not be used again.
    pub fn destroy(&mut self, id: Option<SlabId>) {
        let Some(id) = id else {
            return;
        };
        let trace_span = tracing::span!(Level::TRACE, "allocator::destroy", generation = id.generation);
        let _span_enter = trace_span.enter();

        let p = self.meta_ptr(id);
        let (prev, next) = {
            let slab = self.get(id);
            tracing::event!(
                Level::TRACE,
                slab = slab.name(),
                frags = slab.frags.len(),
                total_count = slab.total_count
            );
            (slab.prev, slab.next)
        };

        match prev {
            Some(prev) => self.get_mut(prev).next = next,
            None => self.first = next,
        }
        match next {
            Some(next) => self.get_mut(next).prev = prev,
            None => self.last = prev,
        }

        // safety: p holds a live Slab (checked by meta_ptr) which is dropped exactly once here.
        // afterwards the slot is all zeroes, which meta_ptr recognizes as destroyed
        unsafe {
            ptr::drop_in_place(p);
            ptr::write_bytes(p as *mut u8, 0, size_of::<Slab>());
        }

        if let Some(headers) = &mut self.headers {
            headers.free(id.slot);
        }
    }

    /// Get one slot from a slab
    pub fn alloc(&mut self, id: SlabId) -> Result<SlotRef, SlabError> {
        self.get_mut(id).alloc()
    }

    /// Give a slot back to the slab it came from
    ///
    /// The slot's contents are left as they are. Freeing a slot twice,
    /// or into the wrong slab, is a caller bug (only caught in debug builds).
    pub fn free(&mut self, id: SlabId, slot: SlotRef) {
        self.get_mut(id).free(slot)
    }

    pub fn total_count(&self, id: SlabId) -> usize {
        self.get(id).total_count()
    }

    pub fn free_count(&self, id: SlabId) -> usize {
        self.get(id).free_count()
    }

    pub fn active_count(&self, id: SlabId) -> usize {
        self.get(id).active_count()
    }

    /// Call `f` once for every live slab, in creation order
    ///
    /// The header slab is created before any other slab, so it always comes first.
    pub fn for_each_pool<F: FnMut(&SlabStats<'_>)>(&self, mut f: F) {
        if let Some(headers) = &self.headers {
            f(&headers.stats());
        }
        let mut cur = self.first;
        while let Some(id) = cur {
            let slab = self.get(id);
            f(&slab.stats());
            cur = slab.next;
        }
    }

    /// Number of live slabs, not counting the header slab
    pub fn pool_count(&self) -> usize {
        self.headers.as_ref().map_or(0, Slab::active_count)
    }

    /// Counters of the header slab, if it has been created yet
    pub fn header_stats(&self) -> Option<SlabStats<'_>> {
        self.headers.as_ref().map(Slab::stats)
    }

    /// Check the consistency of a slab's free list
    ///
    /// Returns the addresses of all slots currently handed out.
    /// Panics if a free slot is listed twice or is not inside the slab.
    pub fn debug_check(&self, id: SlabId) -> FxHashSet<usize> {
        self.get(id).debug_check()
    }

    /// Hexdump of a slot's contents
    ///
    /// # Safety
    ///
    /// `slot` must currently be allocated from `id`, and must not be
    /// concurrently written through a pointer obtained from it
    pub unsafe fn debug_dump_slot(&self, id: SlabId, slot: SlotRef) -> String {
        let slab = self.get(id);
        debug_assert!(slab.owns(slot));
        let bytes = slice::from_raw_parts(slot.as_ptr() as *const u8, slab.slot_size());
        debug_hexdump(bytes).unwrap_or_default()
    }
}

impl Drop for SlabRoot {
    fn drop(&mut self) {
        while let Some(id) = self.first {
            self.destroy(Some(id));
        }
        // the header slab (and with it all header fragments) goes away with self.headers
    }
}
