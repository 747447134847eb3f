//! Block layout and boundary tags.
//!
//! Every block starts with a 4-byte header and ends with an identical 4-byte
//! footer, both packing `size | alloc` into one word. Sizes are multiples of
//! 8, so the low three bits are free and bit 0 carries the allocated flag.
//! The rest of the crate passes around *payload* pointers ("bp"): the byte
//! just past the header, always 8-byte aligned.
//!
//! The duplicate footer is what makes [`prev_block`] O(1): the previous
//! block's footer sits immediately below the current header, so both
//! neighbors of any block can be inspected without walking the heap.

/// Header/footer width in bytes.
pub(crate) const WSIZE: usize = 4;
/// Payload alignment unit; block sizes are multiples of this.
pub(crate) const DSIZE: usize = 8;
/// Smallest legal block: header + footer + the 32-byte in-place index node,
/// rounded up to the alignment unit.
pub(crate) const MINBLOCKSIZE: usize = 6 * DSIZE;

/// Packs a block size and its allocated flag into one tag word.
#[inline(always)]
pub(crate) fn pack(size: usize, alloc: bool) -> u32 {
    debug_assert!(size <= u32::MAX as usize, "block size overflows the tag");
    debug_assert!(size & (DSIZE - 1) == 0, "block size must be 8-aligned");
    size as u32 | alloc as u32
}

/// Reads a raw tag word.
///
/// # Safety
/// `p` must point at a valid header or footer word inside the managed
/// region. Tag words are always 4-byte aligned.
#[inline(always)]
pub(crate) unsafe fn get(p: *const u8) -> u32 {
    // SAFETY: caller guarantees a valid, aligned tag word
    unsafe { (p as *const u32).read() }
}

/// Writes a raw tag word.
///
/// # Safety
/// Same contract as [`get`], and the word must stay consistent with the
/// block layout around it.
#[inline(always)]
pub(crate) unsafe fn put(p: *mut u8, word: u32) {
    // SAFETY: caller guarantees a valid, aligned tag word
    unsafe { (p as *mut u32).write(word) }
}

/// Size field of the tag at `p`.
///
/// # Safety
/// Same contract as [`get`].
#[inline(always)]
pub(crate) unsafe fn read_size(p: *const u8) -> usize {
    // SAFETY: forwarded to the caller
    (unsafe { get(p) } & !0x7) as usize
}

/// Allocated bit of the tag at `p`.
///
/// # Safety
/// Same contract as [`get`].
#[inline(always)]
pub(crate) unsafe fn read_alloc(p: *const u8) -> bool {
    // SAFETY: forwarded to the caller
    (unsafe { get(p) } & 0x1) != 0
}

/// Header address of the block whose payload starts at `bp`.
///
/// # Safety
/// `bp` must be a payload pointer of a block inside the managed region.
#[inline(always)]
pub(crate) unsafe fn header(bp: *mut u8) -> *mut u8 {
    // SAFETY: the header is the word just below the payload
    unsafe { bp.sub(WSIZE) }
}

/// Footer address of the block at `bp`, derived from its current header.
///
/// # Safety
/// Same contract as [`header`]; the header size must be valid.
#[inline(always)]
pub(crate) unsafe fn footer(bp: *mut u8) -> *mut u8 {
    // SAFETY: footer sits `size` bytes past the header, minus one word
    unsafe { bp.add(read_size(header(bp))).sub(DSIZE) }
}

/// Total size of the block at `bp`, read from its header.
///
/// # Safety
/// Same contract as [`header`].
#[inline(always)]
pub(crate) unsafe fn block_size(bp: *mut u8) -> usize {
    // SAFETY: forwarded to the caller
    unsafe { read_size(header(bp)) }
}

/// Allocated flag of the block at `bp`, read from its header.
///
/// # Safety
/// Same contract as [`header`].
#[inline(always)]
pub(crate) unsafe fn is_allocated(bp: *mut u8) -> bool {
    // SAFETY: forwarded to the caller
    unsafe { read_alloc(header(bp)) }
}

/// Payload pointer of the physically next block.
///
/// # Safety
/// Same contract as [`header`]. Walking past the epilogue is the caller's
/// bug; the epilogue's zero size makes `next_block` a fixed point there.
#[inline(always)]
pub(crate) unsafe fn next_block(bp: *mut u8) -> *mut u8 {
    // SAFETY: this block's header gives the distance to the next payload
    unsafe { bp.add(read_size(bp.sub(WSIZE))) }
}

/// Payload pointer of the physically previous block.
///
/// # Safety
/// Same contract as [`header`]. The prologue bounds the walk on the left;
/// callers never step below it because its allocated bit stops coalescing.
#[inline(always)]
pub(crate) unsafe fn prev_block(bp: *mut u8) -> *mut u8 {
    // SAFETY: the previous footer is the word pair just below our header
    unsafe { bp.sub(read_size(bp.sub(DSIZE))) }
}

/// Writes both tags of the block at `bp`.
///
/// The footer position is derived from `size`, not from whatever the header
/// held before, so a single call retags a block whose size is changing.
///
/// # Safety
/// `[bp - 4, bp + size - 4)` must lie inside the managed region and belong
/// to this block.
#[inline(always)]
pub(crate) unsafe fn write_tags(bp: *mut u8, size: usize, alloc: bool) {
    let word = pack(size, alloc);
    // SAFETY: caller guarantees the whole block range
    unsafe {
        put(header(bp), word);
        put(bp.add(size).sub(DSIZE), word);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-aligned backing storage for hand-built blocks.
    fn buffer(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    #[test]
    fn pack_roundtrip() {
        let word = pack(4096, true);
        assert_eq!(word & !0x7, 4096);
        assert_eq!(word & 0x1, 1);
        let word = pack(48, false);
        assert_eq!(word & !0x7, 48);
        assert_eq!(word & 0x1, 0);
    }

    #[test]
    fn tags_and_navigation() {
        let mut buf = buffer(64);
        let base = buf.as_mut_ptr() as *mut u8;

        // Two adjacent blocks; block starts sit at offset 4 mod 8 so that
        // payloads land on 8-byte boundaries.
        unsafe {
            let a = base.add(4 + WSIZE);
            let b = a.add(48);
            write_tags(a, 48, true);
            write_tags(b, 64, false);

            assert_eq!(block_size(a), 48);
            assert!(is_allocated(a));
            assert_eq!(block_size(b), 64);
            assert!(!is_allocated(b));

            assert_eq!(next_block(a), b);
            assert_eq!(prev_block(b), a);
            assert_eq!(get(header(a)), get(footer(a)));
            assert_eq!(get(header(b)), get(footer(b)));
        }
    }

    #[test]
    fn retag_moves_footer() {
        let mut buf = buffer(64);
        let base = buf.as_mut_ptr() as *mut u8;

        unsafe {
            let a = base.add(4 + WSIZE);
            write_tags(a, 128, false);
            // Shrinking the block must place the footer at the new end, not
            // where the old header pointed.
            write_tags(a, 48, true);
            assert_eq!(block_size(a), 48);
            assert_eq!(get(header(a)), get(footer(a)));
        }
    }
}
