//! Best-fit heap allocator over a boundary-tagged block heap.
//!
//! A [`Heap`] serves variable-size allocations from one contiguous region
//! that grows upward through [`MemoryRegion`]. Free blocks are indexed by a
//! red-black tree embedded in their own payload bytes ([`FreeIndex`]), so
//! lookup, insert and remove are O(log n) and allocated memory carries no
//! list metadata at all.
//!
//! Layout of the managed region: an alignment pad word, an allocated 8-byte
//! prologue pair, the live blocks, and a zero-size allocated epilogue header
//! that moves up on every extension. The sentinels let coalescing inspect
//! both neighbors of any block unconditionally.
//!
//! Single mutator by contract: none of the operations lock, and a `Heap` is
//! deliberately not `Send`. Callers that want sharing serialize externally.

use std::ptr::{self, NonNull};

use crate::block::{self, DSIZE, MINBLOCKSIZE, WSIZE};
use crate::system::{MemoryRegion, OS_PAGE_SIZE};
use crate::tree::FreeIndex;

/// Configuration for a [`Heap`].
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Reservation cap for the managed region; growth is refused past it.
    pub max_heap: usize,
    /// Growth quantum. Extensions request at least this many bytes to
    /// amortize provider calls.
    pub chunk_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_heap: 536_870_912, // 512 MB
            chunk_size: 4096,
        }
    }
}

impl HeapSettings {
    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if !self.chunk_size.is_multiple_of(DSIZE) {
            return Err("chunk_size must be a multiple of the alignment unit");
        }
        if self.chunk_size < MINBLOCKSIZE {
            return Err("chunk_size must hold at least one block");
        }
        if !self.max_heap.is_multiple_of(OS_PAGE_SIZE) {
            return Err("max_heap must be page aligned");
        }
        if self.max_heap < self.chunk_size + 4 * WSIZE {
            return Err("max_heap cannot hold the initial chunk");
        }
        Ok(())
    }
}

/// A best-fit allocator with an in-place red-black free index.
#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    region: MemoryRegion,
    index: FreeIndex,
    /// Payload pointer of the prologue block.
    base: *mut u8,
}

impl Heap {
    /// Builds a heap: maps the region, writes the sentinels, and seeds one
    /// chunk-sized free block.
    pub fn new(settings: HeapSettings) -> Result<Self, &'static str> {
        settings.validate()?;
        let region = MemoryRegion::new(settings.max_heap)?;
        let mut heap = Self {
            settings,
            region,
            index: FreeIndex::new(),
            base: ptr::null_mut(),
        };

        let start = heap
            .region
            .extend(4 * WSIZE)
            .ok_or("provider refused the sentinel words")?
            .as_ptr();
        // SAFETY: the 16 bytes just mapped hold the pad word, the prologue
        // pair and the epilogue header.
        unsafe {
            block::put(start, 0); // alignment pad
            block::put(start.add(WSIZE), block::pack(DSIZE, true));
            block::put(start.add(2 * WSIZE), block::pack(DSIZE, true));
            block::put(start.add(3 * WSIZE), block::pack(0, true));
            heap.base = start.add(2 * WSIZE);
        }

        let words = heap.settings.chunk_size / WSIZE;
        // SAFETY: sentinels are in place and the index is empty
        if unsafe { heap.extend_heap(words) }.is_none() {
            return Err("provider refused the initial chunk");
        }
        tracing::debug!(
            max_heap = heap.settings.max_heap,
            chunk_size = heap.settings.chunk_size,
            "heap created"
        );
        Ok(heap)
    }

    /// Serves `size` payload bytes from the best-fitting free block,
    /// extending the region when nothing fits.
    ///
    /// Returns an 8-byte aligned payload pointer, or `None` when `size` is
    /// zero, the rounded size overflows, or the provider refuses growth. A
    /// refusal leaves the heap exactly as it was.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size)?;

        // SAFETY: every indexed block is a valid free block
        unsafe {
            if let Some(bp) = self.index.best_fit(asize) {
                self.place(bp.as_ptr(), asize);
                return Some(bp);
            }

            // No fit; grow by at least one chunk. The new range coalesces
            // with a free tail, so the returned block always fits.
            let extend = asize.max(self.settings.chunk_size);
            let bp = self.extend_heap(extend / WSIZE)?;
            self.place(bp, asize);
            NonNull::new(bp)
        }
    }

    /// Returns the block at `bp` to the free index, merging it with any
    /// free neighbor. A null `bp` is a no-op.
    ///
    /// # Safety
    /// `bp` must be null or a payload pointer obtained from
    /// [`Heap::allocate`]/[`Heap::reallocate`] on this heap and not freed
    /// since. Anything else is undefined behavior; the heap does not check.
    pub unsafe fn free(&mut self, bp: *mut u8) {
        if bp.is_null() {
            return;
        }
        // SAFETY: caller passes a live allocated block of this heap
        unsafe {
            let word = block::pack(block::block_size(bp), false);
            block::put(block::header(bp), word);
            block::put(block::footer(bp), word);
            self.coalesce(bp);
        }
    }

    /// Resizes the allocation at `ptr` to `size` payload bytes.
    ///
    /// `size == 0` frees and returns `None`; a null `ptr` allocates.
    /// Shrinking stays in place (releasing a tail block when one fits);
    /// growth absorbs a free right neighbor when that suffices, and only
    /// otherwise moves the payload. On a failed move the old block is left
    /// untouched and `None` is returned.
    ///
    /// # Safety
    /// Same contract as [`Heap::free`].
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            // SAFETY: forwarded to the caller
            unsafe { self.free(ptr) };
            return None;
        }
        if ptr.is_null() {
            return self.allocate(size);
        }
        let asize = adjusted_size(size)?;

        // SAFETY: caller passes a live allocated block of this heap
        unsafe {
            let csize = block::block_size(ptr);
            // Payload capacity of the current block; only the move path's
            // copy length cares about it.
            let old_payload = csize - DSIZE;

            if asize <= csize {
                // Shrink in place, releasing the tail when it can stand as
                // a block of its own.
                if csize - asize >= MINBLOCKSIZE {
                    block::write_tags(ptr, asize, true);
                    let rest = block::next_block(ptr);
                    block::write_tags(rest, csize - asize, false);
                    self.coalesce(rest);
                }
                return NonNull::new(ptr);
            }

            let next = block::next_block(ptr);
            if !block::is_allocated(next)
                && csize + block::block_size(next) >= asize
            {
                // Grow in place by absorbing the free right neighbor.
                self.index.remove(next);
                let merged = csize + block::block_size(next);
                block::write_tags(ptr, merged, true);
                if merged - asize >= MINBLOCKSIZE {
                    block::write_tags(ptr, asize, true);
                    let rest = block::next_block(ptr);
                    block::write_tags(rest, merged - asize, false);
                    // The absorbed neighbor's right neighbor is allocated,
                    // so the remainder has nothing to merge with.
                    self.index.insert(rest);
                }
                return NonNull::new(ptr);
            }

            // Move. Allocation first: if it fails the old block survives.
            let new = self.allocate(size)?;
            ptr::copy_nonoverlapping(ptr, new.as_ptr(), size.min(old_payload));
            self.free(ptr);
            Some(new)
        }
    }

    /// First byte of the managed region.
    #[must_use]
    pub fn heap_low(&self) -> *mut u8 {
        self.region.heap_low()
    }

    /// One past the last managed byte (the epilogue payload position).
    #[must_use]
    pub fn heap_high(&self) -> *mut u8 {
        self.region.heap_high()
    }

    /// Grows the region by `words` 4-byte words (rounded up to keep 8-byte
    /// alignment), lays a free block over the new range and coalesces it
    /// with a free tail. Returns the resulting free block's payload.
    unsafe fn extend_heap(&mut self, words: usize) -> Option<*mut u8> {
        let size = if words % 2 == 1 {
            (words + 1) * WSIZE
        } else {
            words * WSIZE
        };
        let bp = self.region.extend(size)?.as_ptr();
        tracing::trace!(bytes = size, "region extended");

        // The provider hands back the old break: the word below it is the
        // old epilogue header, which becomes the new block's header.
        // SAFETY: the new range plus that word are ours
        unsafe {
            block::write_tags(bp, size, false);
            block::put(
                block::header(block::next_block(bp)),
                block::pack(0, true),
            );
            Some(self.coalesce(bp))
        }
    }

    /// Merges the free block at `bp` with whichever physical neighbors are
    /// free and (re)inserts the result. Neighbors leave the index *before*
    /// any size arithmetic so the tree never holds a stale key.
    unsafe fn coalesce(&mut self, bp: *mut u8) -> *mut u8 {
        // SAFETY: bp is a free block inside the sentinel-bounded region, so
        // both neighbor tags exist
        unsafe {
            let prev_alloc = block::read_alloc(bp.sub(DSIZE));
            let next = block::next_block(bp);
            let next_alloc = block::is_allocated(next);
            let mut bp = bp;
            let mut size = block::block_size(bp);

            match (prev_alloc, next_alloc) {
                (true, true) => {}
                (true, false) => {
                    self.index.remove(next);
                    size += block::block_size(next);
                    block::write_tags(bp, size, false);
                }
                (false, true) => {
                    let prev = block::prev_block(bp);
                    self.index.remove(prev);
                    size += block::block_size(prev);
                    bp = prev;
                    block::write_tags(bp, size, false);
                }
                (false, false) => {
                    let prev = block::prev_block(bp);
                    self.index.remove(prev);
                    self.index.remove(next);
                    size += block::block_size(prev) + block::block_size(next);
                    bp = prev;
                    block::write_tags(bp, size, false);
                }
            }

            self.index.insert(bp);
            bp
        }
    }

    /// Carves an allocated block of `asize` bytes out of the free block at
    /// `bp`, splitting off the remainder when it can stand on its own.
    unsafe fn place(&mut self, bp: *mut u8, asize: usize) {
        // SAFETY: bp is an indexed free block of at least asize bytes
        unsafe {
            let csize = block::block_size(bp);
            debug_assert!(csize >= asize);
            self.index.remove(bp);

            if csize - asize >= MINBLOCKSIZE {
                block::write_tags(bp, asize, true);
                let rest = block::next_block(bp);
                block::write_tags(rest, csize - asize, false);
                self.index.insert(rest);
            } else {
                block::write_tags(bp, csize, true);
            }
        }
    }
}

/// Rounds a payload request up to a legal block size: payload plus both
/// tags, 8-byte aligned, never below the minimum block. `None` on overflow
/// or when the result cannot be expressed in a tag word.
#[inline]
fn adjusted_size(size: usize) -> Option<usize> {
    let asize = if size <= DSIZE {
        2 * DSIZE
    } else {
        DSIZE * (size.checked_add(DSIZE + DSIZE - 1)? / DSIZE)
    };
    let asize = asize.max(MINBLOCKSIZE);
    (asize <= u32::MAX as usize).then_some(asize)
}

// ── Tests ─────────────────────────────────────────────────────────────
