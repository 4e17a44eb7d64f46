//! Power-of-two sub-allocator inside a fixed-size arena (spec §4.2).
//!
//! Each [`BuddyArena`] owns one boxed byte slab of size `2^total_exp` and a
//! free-tree stored as an implicit array, the classic "buddy2" layout: node
//! `i`'s value is the size (in minimum-block units) of the largest free run
//! within its subtree, `0` marking the exact node an allocation claimed. A
//! block's exponent is never stored next to the block; `free` recovers it
//! by walking the tree up from the leaf until it finds the node that was
//! zeroed at allocation time, exactly as spec §4.2 requires.
//!
//! [`BuddyAllocator`] owns a sorted-by-address `Vec<BuddyArena>` (an LP's
//! `mm_state` in spec terms) so a host pointer maps to its arena in
//! `O(log N)`, and creates additional arenas on demand when every existing
//! one is full.

use std::alloc::Layout;

/// Minimum block exponent: every arena's smallest allocatable unit is
/// `2^MIN_BLOCK_EXP` bytes, matching spec's 8-byte alignment guarantee.
pub const MIN_BLOCK_EXP: u32 = 3;

struct BuddyTree {
    /// `longest[i]` = size, in leaf units, of the largest free run in the
    /// subtree rooted at `i`; `0` at the exact node an allocation claimed.
    longest: Vec<u32>,
    num_leaves: u32,
}

fn left(i: usize) -> usize {
    2 * i + 1
}
fn right(i: usize) -> usize {
    2 * i + 2
}
fn parent(i: usize) -> usize {
    (i + 1) / 2 - 1
}

impl BuddyTree {
    fn new(num_leaves: u32) -> Self {
        debug_assert!(num_leaves.is_power_of_two());
        let node_count = (2 * num_leaves - 1) as usize;
        let mut longest = vec![0u32; node_count];
        let mut node_size = num_leaves;
        for i in 0..node_count {
            if (i + 1).is_power_of_two() {
                node_size /= 2;
            }
            longest[i] = node_size;
        }
        BuddyTree { longest, num_leaves }
    }

    /// Allocate `leaves` (a power of two) leaf units; returns the leaf
    /// offset of the claimed block, or `None` if nothing fits.
    fn alloc(&mut self, leaves: u32) -> Option<u32> {
        if self.longest.is_empty() || self.longest[0] < leaves {
            return None;
        }
        let mut index = 0usize;
        let mut node_size = self.num_leaves;
        while node_size != leaves {
            index = if self.longest[left(index)] >= leaves {
                left(index)
            } else {
                right(index)
            };
            node_size /= 2;
        }
        self.longest[index] = 0;
        let offset = (index as u32 + 1) * node_size - self.num_leaves;
        while index != 0 {
            index = parent(index);
            self.longest[index] = self.longest[left(index)].max(self.longest[right(index)]);
        }
        Some(offset)
    }

    /// Free the block that owns leaf offset `offset`; returns its size in
    /// leaf units, recovered from the tree rather than a stored header.
    fn free(&mut self, offset: u32) -> u32 {
        let mut node_size = 1u32;
        let mut index = (offset + self.num_leaves - 1) as usize;
        while index != 0 && self.longest[index] != 0 {
            index = parent(index);
            node_size *= 2;
        }
        self.longest[index] = node_size;
        while index != 0 {
            index = parent(index);
            node_size *= 2;
            let l = self.longest[left(index)];
            let r = self.longest[right(index)];
            self.longest[index] = if l + r == node_size { node_size } else { l.max(r) };
        }
        node_size
    }

    /// Size, in leaf units, of the block owning `offset`, without freeing
    /// it. Used by `realloc_best_effort` to size an in-place grow/shrink.
    fn block_size(&self, offset: u32) -> u32 {
        let mut node_size = 1u32;
        let mut index = (offset + self.num_leaves - 1) as usize;
        while index != 0 && self.longest[index] != 0 {
            index = parent(index);
            node_size *= 2;
        }
        node_size
    }
}

/// A fixed-size `2^total_exp`-byte slab with its own free-tree.
pub struct BuddyArena {
    storage: Box<[u8]>,
    base: usize,
    total_exp: u32,
    tree: BuddyTree,
    pub live_bytes: usize,
}

impl BuddyArena {
    pub fn new(total_exp: u32) -> Self {
        assert!(total_exp >= MIN_BLOCK_EXP, "arena smaller than the minimum block");
        let size = 1usize << total_exp;
        let layout = Layout::from_size_align(size, 8).expect("arena layout");
        let storage = unsafe {
            let ptr = std::alloc::alloc_zeroed(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Vec::from_raw_parts(ptr, size, size).into_boxed_slice()
        };
        let base = storage.as_ptr() as usize;
        let num_leaves = 1u32 << (total_exp - MIN_BLOCK_EXP);
        BuddyArena {
            storage,
            base,
            total_exp,
            tree: BuddyTree::new(num_leaves),
            live_bytes: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn end(&self) -> usize {
        self.base + self.storage.len()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn leaves_for(&self, exp: u32) -> u32 {
        1u32 << (exp - MIN_BLOCK_EXP)
    }

    /// `malloc(exp)` from spec §4.2: 8-byte-aligned block of `2^exp` bytes
    /// or `None` if this arena cannot satisfy the request.
    pub fn malloc(&mut self, exp: u32) -> Option<usize> {
        if exp > self.total_exp {
            return None;
        }
        let leaves = self.leaves_for(exp.max(MIN_BLOCK_EXP));
        let offset = self.tree.alloc(leaves)?;
        let byte_offset = (offset as usize) << MIN_BLOCK_EXP;
        self.live_bytes += 1usize << exp;
        Some(self.base + byte_offset)
    }

    /// Free the block at `addr`, returning the number of bytes reclaimed.
    pub fn free(&mut self, addr: usize) -> usize {
        let byte_offset = addr - self.base;
        let leaf_offset = (byte_offset >> MIN_BLOCK_EXP) as u32;
        let leaves = self.tree.free(leaf_offset);
        let bytes = (leaves as usize) << MIN_BLOCK_EXP;
        self.live_bytes -= bytes;
        bytes
    }

    fn block_bytes(&self, addr: usize) -> usize {
        let byte_offset = addr - self.base;
        let leaf_offset = (byte_offset >> MIN_BLOCK_EXP) as u32;
        (self.tree.block_size(leaf_offset) as usize) << MIN_BLOCK_EXP
    }

    /// Raw bytes of the live block starting at `addr`, for checkpointing.
    pub fn live_slice(&self, addr: usize, len: usize) -> &[u8] {
        let start = addr - self.base;
        &self.storage[start..start + len]
    }

    pub fn write_at(&mut self, addr: usize, bytes: &[u8]) {
        let start = addr - self.base;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Whole-slab bytes, for checkpointing. Includes free space: the
    /// checkpoint restores content and allocation state together so that
    /// pointers handed out before the checkpoint stay valid afterward.
    pub fn whole_slab(&self) -> &[u8] {
        &self.storage
    }

    pub fn total_exp(&self) -> u32 {
        self.total_exp
    }

    /// Free-tree state, for checkpointing alongside `whole_slab`.
    pub fn tree_snapshot(&self) -> Vec<u32> {
        self.tree.longest.clone()
    }

    /// Overwrite this arena's bytes and free-tree state in place, keeping
    /// its address stable. `bytes.len()` must equal the arena's slab size.
    pub fn restore_in_place(&mut self, bytes: &[u8], tree_longest: &[u32], live_bytes: usize) {
        debug_assert_eq!(bytes.len(), self.storage.len());
        debug_assert_eq!(tree_longest.len(), self.tree.longest.len());
        self.storage.copy_from_slice(bytes);
        self.tree.longest.copy_from_slice(tree_longest);
        self.live_bytes = live_bytes;
    }
}

/// Outcome of [`BuddyAllocator::realloc_best_effort`].
pub struct ReallocOutcome {
    /// `true` if the block was grown or shrunk in place.
    pub handled: bool,
    /// Signed change in size, in bytes, when `handled` is true.
    pub variation: isize,
    /// The block's size before the call, so the caller can `memcpy` on a
    /// miss.
    pub original: usize,
}

/// Owns every arena for one LP's rollback-safe heap. Arenas are kept
/// sorted by base address so a pointer maps back to its owner in
/// `O(log N)`, and so `malloc` can scan "in descending address order" per
/// spec's locality-of-reuse tie-break.
pub struct BuddyAllocator {
    arenas: Vec<BuddyArena>,
    total_exp: u32,
}

impl BuddyAllocator {
    pub fn new(total_exp: u32) -> Self {
        BuddyAllocator {
            arenas: vec![BuddyArena::new(total_exp)],
            total_exp,
        }
    }

    pub fn total_exp(&self) -> u32 {
        self.total_exp
    }

    pub fn arenas(&self) -> &[BuddyArena] {
        &self.arenas
    }

    pub fn arenas_mut(&mut self) -> &mut [BuddyArena] {
        &mut self.arenas
    }

    fn insert_sorted(&mut self, arena: BuddyArena) {
        let pos = self.arenas.partition_point(|a| a.base() < arena.base());
        self.arenas.insert(pos, arena);
    }

    /// Drop every arena, leaving the allocator empty. Used by checkpoint
    /// restore to discard arenas that have no counterpart in the snapshot
    /// being restored.
    pub fn clear_arenas(&mut self) {
        self.arenas.clear();
    }

    /// Append a freshly constructed arena without going through
    /// address-sorted insertion. Used by checkpoint restore when rebuilding
    /// the arena set positionally to match the snapshot.
    pub fn push_fresh_arena(&mut self, arena: BuddyArena) {
        self.arenas.push(arena);
    }

    /// Drop every arena past `len`. Used by checkpoint restore to discard
    /// arenas created after the snapshot being restored.
    pub fn truncate_arenas(&mut self, len: usize) {
        self.arenas.truncate(len);
    }

    fn owner_index(&self, addr: usize) -> Option<usize> {
        let pos = self.arenas.partition_point(|a| a.base() <= addr);
        if pos == 0 {
            return None;
        }
        let idx = pos - 1;
        if self.arenas[idx].contains(addr) {
            Some(idx)
        } else {
            None
        }
    }

    /// `malloc(exp)`: a single block larger than one arena (`exp >
    /// total_exp`) is reported to the model as `None`/ENOMEM rather than
    /// triggering a fatal abort, per spec §7.
    pub fn malloc(&mut self, exp: u32) -> Option<usize> {
        if exp > self.total_exp {
            return None;
        }
        for arena in self.arenas.iter_mut().rev() {
            if let Some(addr) = arena.malloc(exp) {
                return Some(addr);
            }
        }
        let mut fresh = BuddyArena::new(self.total_exp);
        let addr = fresh.malloc(exp);
        self.insert_sorted(fresh);
        addr
    }

    pub fn free(&mut self, addr: usize) -> usize {
        let idx = self.owner_index(addr).expect("free of pointer outside any arena");
        self.arenas[idx].free(addr)
    }

    /// `realloc_best_effort` from spec §4.2: try an in-place resize first,
    /// and otherwise report the original size so the caller copies.
    pub fn realloc_best_effort(&mut self, addr: usize, new_exp: u32) -> ReallocOutcome {
        let idx = self.owner_index(addr).expect("realloc of pointer outside any arena");
        let arena = &mut self.arenas[idx];
        let current_bytes = arena.block_bytes(addr);
        let current_exp = current_bytes.trailing_zeros();
        if new_exp == current_exp {
            return ReallocOutcome {
                handled: true,
                variation: 0,
                original: current_bytes,
            };
        }
        if new_exp < current_exp {
            // Shrink in place: free the block and re-claim the smaller
            // size; since nothing else can have allocated in between on
            // this single-threaded arena, the address is stable.
            arena.free(addr);
            let shrunk = arena.malloc(new_exp).expect("shrink must fit where the original block fit");
            debug_assert_eq!(shrunk, addr);
            return ReallocOutcome {
                handled: true,
                variation: (1isize << new_exp) - (1isize << current_exp),
                original: current_bytes,
            };
        }
        // Grow: only handled in place if freeing and reclaiming still
        // yields the same address at the larger size (i.e. no neighboring
        // live block stood in the way).
        arena.free(addr);
        if let Some(grown) = arena.malloc(new_exp) {
            if grown == addr {
                return ReallocOutcome {
                    handled: true,
                    variation: (1isize << new_exp) - (1isize << current_exp),
                    original: current_bytes,
                };
            }
            arena.free(grown);
        }
        let restored = arena.malloc(current_exp).expect("re-claim of just-freed block must succeed");
        debug_assert_eq!(restored, addr);
        ReallocOutcome {
            handled: false,
            variation: 0,
            original: current_bytes,
        }
    }

    /// Sum of every arena's live bytes, the running `full_ckpt_size` that
    /// sizes a full checkpoint buffer (spec §4.3).
    pub fn full_ckpt_size(&self) -> usize {
        self.arenas.iter().map(|a| a.live_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_then_free_restores_free_tree() {
        let mut arena = BuddyArena::new(10); // 1KiB arena
        let before: Vec<u32> = arena.tree.longest.clone();
        let p = arena.malloc(5).unwrap();
        assert_ne!(arena.tree.longest, before);
        arena.free(p);
        assert_eq!(arena.tree.longest, before);
    }

    #[test]
    fn allocations_are_disjoint_and_aligned() {
        let mut arena = BuddyArena::new(10);
        let a = arena.malloc(4).unwrap();
        let b = arena.malloc(4).unwrap();
        assert_ne!(a, b);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
    }

    #[test]
    fn oversized_request_reports_none_not_panic() {
        let mut allocator = BuddyAllocator::new(10);
        assert!(allocator.malloc(20).is_none());
    }

    #[test]
    fn exhausted_arena_grows_a_fresh_one() {
        let mut allocator = BuddyAllocator::new(5); // 32 bytes, 4 min blocks
        let mut ptrs = Vec::new();
        for _ in 0..4 {
            ptrs.push(allocator.malloc(MIN_BLOCK_EXP).unwrap());
        }
        assert_eq!(allocator.arenas().len(), 1);
        let next = allocator.malloc(MIN_BLOCK_EXP).unwrap();
        assert_eq!(allocator.arenas().len(), 2);
        assert!(!ptrs.contains(&next));
    }

    #[test]
    fn realloc_shrink_is_handled_in_place() {
        let mut allocator = BuddyAllocator::new(10);
        let p = allocator.malloc(6).unwrap();
        let outcome = allocator.realloc_best_effort(p, 4);
        assert!(outcome.handled);
        assert_eq!(outcome.original, 1 << 6);
    }
}
