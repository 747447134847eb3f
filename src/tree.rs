//! Free-block index.
//!
//! A red-black tree keyed by block size whose nodes are stored *inside* the
//! payload bytes of the free blocks themselves, so indexing free memory
//! costs zero bytes of allocated memory. A free block's payload and its tree
//! node are two views of the same storage; [`node`] is the single choke
//! point where the reinterpretation happens.
//!
//! The shared leaf sentinel (`nil`) is boxed outside the managed region. It
//! is BLACK, its children are itself, and its parent field is scratch space:
//! deletion fixup transiently parks a parent pointer there, which is fine
//! with a single mutator and at most one fixup in flight.

use std::ptr::{self, NonNull};

use crate::block;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Color {
    Black = 0,
    Red = 1,
}

/// In-place view of a free block's payload.
///
/// Field order is the on-heap layout: parent, left, right at payload offsets
/// 0/8/16, color byte at 24 (padded out to 32).
#[repr(C)]
#[derive(Debug)]
struct Node {
    parent: *mut u8,
    left: *mut u8,
    right: *mut u8,
    color: Color,
}

// The node (plus both boundary tags) must fit the smallest legal block.
const _: () = assert!(size_of::<Node>() + block::DSIZE <= block::MINBLOCKSIZE);

/// Reinterprets a free-block payload as a tree node.
#[inline(always)]
fn node(bp: *mut u8) -> *mut Node {
    bp.cast()
}

/// Size-keyed index over all free blocks.
///
/// Keys are read on demand from the block headers, so a block's tags must
/// never change while it is linked into the tree: callers remove first,
/// retag, then re-insert.
#[derive(Debug)]
pub(crate) struct FreeIndex {
    pub(crate) root: *mut u8,
    pub(crate) nil: *mut u8,
}

impl FreeIndex {
    pub(crate) fn new() -> Self {
        let nil = Box::into_raw(Box::new(Node {
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            color: Color::Black,
        })) as *mut u8;
        // SAFETY: freshly leaked box, uniquely owned here
        unsafe {
            (*node(nil)).parent = nil;
            (*node(nil)).left = nil;
            (*node(nil)).right = nil;
        }
        Self { root: nil, nil }
    }

    /// Links the free block at `bp` into the index.
    ///
    /// Equal keys descend right; a best-fit tie resolves to whichever of
    /// the equal blocks the descent reaches first.
    ///
    /// # Safety
    /// `bp` must be the payload of a free block with valid tags, at least
    /// [`block::MINBLOCKSIZE`] bytes, not currently in the index.
    pub(crate) unsafe fn insert(&mut self, bp: *mut u8) {
        let nil = self.nil;
        // SAFETY: the payload of a free block is ours to use as a node
        unsafe {
            (*node(bp)).parent = nil;
            (*node(bp)).left = nil;
            (*node(bp)).right = nil;
            (*node(bp)).color = Color::Red;

            let size = block::block_size(bp);
            let mut parent = nil;
            let mut cursor = self.root;
            while cursor != nil {
                parent = cursor;
                cursor = if size < block::block_size(cursor) {
                    (*node(cursor)).left
                } else {
                    (*node(cursor)).right
                };
            }

            (*node(bp)).parent = parent;
            if parent == nil {
                self.root = bp;
            } else if size < block::block_size(parent) {
                (*node(parent)).left = bp;
            } else {
                (*node(parent)).right = bp;
            }

            self.insert_fixup(bp);
        }
    }

    unsafe fn insert_fixup(&mut self, mut x: *mut u8) {
        // SAFETY: all touched pointers are live nodes or the sentinel
        unsafe {
            while x != self.root && (*node((*node(x)).parent)).color == Color::Red {
                let parent = (*node(x)).parent;
                let grand = (*node(parent)).parent;
                if parent == (*node(grand)).left {
                    let uncle = (*node(grand)).right;
                    if (*node(uncle)).color == Color::Red {
                        (*node(parent)).color = Color::Black;
                        (*node(uncle)).color = Color::Black;
                        (*node(grand)).color = Color::Red;
                        x = grand;
                    } else {
                        if x == (*node(parent)).right {
                            x = parent;
                            self.rotate_left(x);
                        }
                        let parent = (*node(x)).parent;
                        let grand = (*node(parent)).parent;
                        (*node(parent)).color = Color::Black;
                        (*node(grand)).color = Color::Red;
                        self.rotate_right(grand);
                    }
                } else {
                    let uncle = (*node(grand)).left;
                    if (*node(uncle)).color == Color::Red {
                        (*node(parent)).color = Color::Black;
                        (*node(uncle)).color = Color::Black;
                        (*node(grand)).color = Color::Red;
                        x = grand;
                    } else {
                        if x == (*node(parent)).left {
                            x = parent;
                            self.rotate_right(x);
                        }
                        let parent = (*node(x)).parent;
                        let grand = (*node(parent)).parent;
                        (*node(parent)).color = Color::Black;
                        (*node(grand)).color = Color::Red;
                        self.rotate_left(grand);
                    }
                }
            }
            (*node(self.root)).color = Color::Black;
        }
    }

    /// Unlinks the free block at `bp` from the index.
    ///
    /// # Safety
    /// `bp` must currently be linked into this index.
    pub(crate) unsafe fn remove(&mut self, bp: *mut u8) {
        let nil = self.nil;
        // SAFETY: node fields of linked blocks are valid until unlinked
        unsafe {
            let mut y = bp;
            let mut y_color = (*node(y)).color;
            let x;

            if (*node(bp)).left == nil {
                x = (*node(bp)).right;
                self.transplant(bp, (*node(bp)).right);
            } else if (*node(bp)).right == nil {
                x = (*node(bp)).left;
                self.transplant(bp, (*node(bp)).left);
            } else {
                y = Self::minimum(nil, (*node(bp)).right);
                y_color = (*node(y)).color;
                x = (*node(y)).right;
                if (*node(y)).parent == bp {
                    // x may be the sentinel; fixup reads this parent back.
                    (*node(x)).parent = y;
                } else {
                    self.transplant(y, (*node(y)).right);
                    (*node(y)).right = (*node(bp)).right;
                    (*node((*node(y)).right)).parent = y;
                }
                self.transplant(bp, y);
                (*node(y)).left = (*node(bp)).left;
                (*node((*node(y)).left)).parent = y;
                (*node(y)).color = (*node(bp)).color;
            }

            if y_color == Color::Black {
                self.remove_fixup(x);
            }
        }
    }

    unsafe fn remove_fixup(&mut self, mut x: *mut u8) {
        // SAFETY: x is a live node or the sentinel carrying a parked parent
        unsafe {
            while x != self.root && (*node(x)).color == Color::Black {
                let parent = (*node(x)).parent;
                if x == (*node(parent)).left {
                    let mut w = (*node(parent)).right;
                    if (*node(w)).color == Color::Red {
                        (*node(w)).color = Color::Black;
                        (*node(parent)).color = Color::Red;
                        self.rotate_left(parent);
                        w = (*node((*node(x)).parent)).right;
                    }
                    if (*node((*node(w)).left)).color == Color::Black
                        && (*node((*node(w)).right)).color == Color::Black
                    {
                        (*node(w)).color = Color::Red;
                        x = (*node(x)).parent;
                    } else {
                        if (*node((*node(w)).right)).color == Color::Black {
                            (*node((*node(w)).left)).color = Color::Black;
                            (*node(w)).color = Color::Red;
                            self.rotate_right(w);
                            w = (*node((*node(x)).parent)).right;
                        }
                        let parent = (*node(x)).parent;
                        (*node(w)).color = (*node(parent)).color;
                        (*node(parent)).color = Color::Black;
                        (*node((*node(w)).right)).color = Color::Black;
                        self.rotate_left(parent);
                        x = self.root;
                    }
                } else {
                    let mut w = (*node(parent)).left;
                    if (*node(w)).color == Color::Red {
                        (*node(w)).color = Color::Black;
                        (*node(parent)).color = Color::Red;
                        self.rotate_right(parent);
                        w = (*node((*node(x)).parent)).left;
                    }
                    if (*node((*node(w)).right)).color == Color::Black
                        && (*node((*node(w)).left)).color == Color::Black
                    {
                        (*node(w)).color = Color::Red;
                        x = (*node(x)).parent;
                    } else {
                        if (*node((*node(w)).left)).color == Color::Black {
                            (*node((*node(w)).right)).color = Color::Black;
                            (*node(w)).color = Color::Red;
                            self.rotate_left(w);
                            w = (*node((*node(x)).parent)).left;
                        }
                        let parent = (*node(x)).parent;
                        (*node(w)).color = (*node(parent)).color;
                        (*node(parent)).color = Color::Black;
                        (*node((*node(w)).left)).color = Color::Black;
                        self.rotate_right(parent);
                        x = self.root;
                    }
                }
            }
            (*node(x)).color = Color::Black;
        }
    }

    /// Best fit: the smallest linked block whose size is at least `asize`.
    ///
    /// Descends left after every candidate to tighten the fit, right when
    /// the current subtree root is too small. O(log n).
    ///
    /// # Safety
    /// All linked blocks must still carry valid tags.
    pub(crate) unsafe fn best_fit(&self, asize: usize) -> Option<NonNull<u8>> {
        let mut best: *mut u8 = ptr::null_mut();
        let mut cursor = self.root;
        // SAFETY: the descent only touches linked nodes and the sentinel
        unsafe {
            while cursor != self.nil {
                let csize = block::block_size(cursor);
                if csize >= asize {
                    if best.is_null() || csize < block::block_size(best) {
                        best = cursor;
                    }
                    cursor = (*node(cursor)).left;
                } else {
                    cursor = (*node(cursor)).right;
                }
            }
        }
        NonNull::new(best)
    }

    unsafe fn rotate_left(&mut self, x: *mut u8) {
        // SAFETY: rotation touches x, its right child, and their links only
        unsafe {
            let y = (*node(x)).right;
            (*node(x)).right = (*node(y)).left;
            if (*node(y)).left != self.nil {
                (*node((*node(y)).left)).parent = x;
            }
            (*node(y)).parent = (*node(x)).parent;
            if (*node(x)).parent == self.nil {
                self.root = y;
            } else if x == (*node((*node(x)).parent)).left {
                (*node((*node(x)).parent)).left = y;
            } else {
                (*node((*node(x)).parent)).right = y;
            }
            (*node(y)).left = x;
            (*node(x)).parent = y;
        }
    }

    unsafe fn rotate_right(&mut self, x: *mut u8) {
        // SAFETY: mirror image of rotate_left
        unsafe {
            let y = (*node(x)).left;
            (*node(x)).left = (*node(y)).right;
            if (*node(y)).right != self.nil {
                (*node((*node(y)).right)).parent = x;
            }
            (*node(y)).parent = (*node(x)).parent;
            if (*node(x)).parent == self.nil {
                self.root = y;
            } else if x == (*node((*node(x)).parent)).right {
                (*node((*node(x)).parent)).right = y;
            } else {
                (*node((*node(x)).parent)).left = y;
            }
            (*node(y)).right = x;
            (*node(x)).parent = y;
        }
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v`.
    unsafe fn transplant(&mut self, u: *mut u8, v: *mut u8) {
        // SAFETY: u is linked; v may be the sentinel (its parent is scratch)
        unsafe {
            if (*node(u)).parent == self.nil {
                self.root = v;
            } else if u == (*node((*node(u)).parent)).left {
                (*node((*node(u)).parent)).left = v;
            } else {
                (*node((*node(u)).parent)).right = v;
            }
            (*node(v)).parent = (*node(u)).parent;
        }
    }

    unsafe fn minimum(nil: *mut u8, mut x: *mut u8) -> *mut u8 {
        // SAFETY: left spine of a linked subtree
        unsafe {
            while (*node(x)).left != nil {
                x = (*node(x)).left;
            }
        }
        x
    }
}

impl Drop for FreeIndex {
    fn drop(&mut self) {
        // SAFETY: nil came from Box::into_raw in new() and is never freed
        // elsewhere; the tree nodes themselves live in heap payloads.
        unsafe { drop(Box::from_raw(self.nil as *mut Node)) };
    }
}

// ── Test-only structural checks ───────────────────────────────────────

#[cfg(test)]
impl FreeIndex {
    /// In-order payload pointers of every linked block.
    pub(crate) unsafe fn collect_nodes(&self) -> Vec<*mut u8> {
        let mut out = Vec::new();
        unsafe { self.collect_into(self.root, &mut out) };
        out
    }

    unsafe fn collect_into(&self, n: *mut u8, out: &mut Vec<*mut u8>) {
        if n == self.nil {
            return;
        }
        unsafe {
            self.collect_into((*node(n)).left, out);
            out.push(n);
            self.collect_into((*node(n)).right, out);
        }
    }

    /// Asserts every red-black and ordering invariant of the whole tree.
    pub(crate) unsafe fn assert_red_black(&self) {
        unsafe {
            assert_eq!((*node(self.nil)).color, Color::Black, "nil turned red");
            assert_eq!((*node(self.nil)).left, self.nil);
            assert_eq!((*node(self.nil)).right, self.nil);
            assert_eq!(
                (*node(self.root)).color,
                Color::Black,
                "root must be black"
            );
            self.check_subtree(self.root);
        }
    }

    /// Returns the black-height of the subtree at `n`, asserting on the way
    /// down: no red-red edge, ordered keys, consistent parent links.
    unsafe fn check_subtree(&self, n: *mut u8) -> usize {
        if n == self.nil {
            return 1;
        }
        unsafe {
            let left = (*node(n)).left;
            let right = (*node(n)).right;

            if (*node(n)).color == Color::Red {
                assert_eq!((*node(left)).color, Color::Black, "red-red edge");
                assert_eq!((*node(right)).color, Color::Black, "red-red edge");
            }
            if left != self.nil {
                assert_eq!((*node(left)).parent, n, "broken parent link");
                assert!(block::block_size(left) <= block::block_size(n));
            }
            if right != self.nil {
                assert_eq!((*node(right)).parent, n, "broken parent link");
                assert!(block::block_size(right) >= block::block_size(n));
            }

            let lh = self.check_subtree(left);
            let rh = self.check_subtree(right);
            assert_eq!(lh, rh, "black-height mismatch");
            lh + ((*node(n)).color == Color::Black) as usize
        }
    }
}
