//! Per-LP append-only log of memory snapshots, keyed by `ref_idx` (spec
//! §4.3): the position of a message in an LP's processed history.
//!
//! A checkpoint records every live byte of every arena owned by an LP's
//! [`BuddyAllocator`]. `take` always records a full copy; incremental
//! (dirty-word-diff) checkpoints are a policy the auto-ckpt controller may
//! ask for, represented here but always falling back to a full snapshot
//! when no prior full snapshot is in range — see [`CheckpointKind`] and the
//! "open question" note below.

use crate::buddy::BuddyAllocator;
use crate::error::RootsimError;

/// One arena's payload inside a checkpoint entry: the whole slab plus its
/// free-tree state, so restore reproduces both content and which blocks
/// were live, and pointers handed out before the checkpoint stay valid.
#[derive(Debug, Clone)]
pub struct ArenaRecord {
    pub total_exp: u32,
    pub bytes: Vec<u8>,
    pub tree_longest: Vec<u32>,
    pub live_bytes: usize,
}

/// Whether an entry is a standalone snapshot or a diff against the most
/// recent full entry.
///
/// The original source stubs its incremental path behind
/// `ROOTSIM_INCREMENTAL` without a complete reference implementation, so
/// bit-level incrementality here is no more than the shape of the format;
/// `restore` always walks back to a full entry and there is currently no
/// producer of `Incremental`. Kept as a distinct variant rather than
/// deleted so a future dirty-word tracker has a format to target.
#[derive(Debug, Clone)]
pub enum CheckpointKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub ref_idx: usize,
    pub kind: CheckpointKind,
    pub arenas: Vec<ArenaRecord>,
}

/// Append-only log of an LP's checkpoints.
pub struct CheckpointStore {
    log: Vec<CheckpointEntry>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        CheckpointStore { log: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn oldest_ref_idx(&self) -> Option<usize> {
        self.log.first().map(|e| e.ref_idx)
    }

    pub fn newest_ref_idx(&self) -> Option<usize> {
        self.log.last().map(|e| e.ref_idx)
    }

    /// `take(ref_idx)`: snapshot every arena's live bytes verbatim. The
    /// buffer size is the running `full_ckpt_size` the buddy allocator
    /// already tracks, so this never over-allocates relative to live
    /// bytes.
    pub fn take(&mut self, ref_idx: usize, allocator: &BuddyAllocator) {
        let arenas = allocator
            .arenas()
            .iter()
            .map(|arena| ArenaRecord {
                total_exp: arena.total_exp(),
                bytes: arena.whole_slab().to_vec(),
                tree_longest: arena.tree_snapshot(),
                live_bytes: arena.live_bytes,
            })
            .collect();
        self.log.push(CheckpointEntry {
            ref_idx,
            kind: CheckpointKind::Full,
            arenas,
        });
    }

    /// `force_full()`: the next `take` is guaranteed full. Since this
    /// store only ever produces full entries today, this is a no-op kept
    /// for API parity with the auto-ckpt controller, which calls it after
    /// every restore to avoid chaining a diff across a rollback boundary.
    pub fn force_full(&mut self) {}

    /// `restore(target_ref_idx)`: find the newest entry at or before
    /// `target`, rewrite every arena in `allocator` from it, and report
    /// the entry's `ref_idx` so the caller replays `p_msgs[restored..target]`.
    pub fn restore(&self, target_ref_idx: usize, allocator: &mut BuddyAllocator) -> Result<usize, RootsimError> {
        let entry = self
            .log
            .iter()
            .rev()
            .find(|e| e.ref_idx <= target_ref_idx)
            .ok_or(RootsimError::NoReachableCheckpoint(target_ref_idx))?;

        // Arenas existing both before and in the checkpoint are rewritten
        // in place, which keeps their host addresses stable; any arena the
        // checkpoint doesn't know about is dropped, and any arena the
        // checkpoint has but the live allocator has since lost is
        // re-created (spec §4.3: "arenas present only in the checkpoint
        // are re-created, arenas no longer present in the checkpoint are
        // dropped").
        let shared = allocator.arenas().len().min(entry.arenas.len());
        for (arena, record) in allocator.arenas_mut().iter_mut().zip(entry.arenas.iter()).take(shared) {
            arena.restore_in_place(&record.bytes, &record.tree_longest, record.live_bytes);
        }
        allocator.truncate_arenas(shared);
        for record in entry.arenas.iter().skip(shared) {
            let mut fresh = crate::buddy::BuddyArena::new(record.total_exp);
            fresh.restore_in_place(&record.bytes, &record.tree_longest, record.live_bytes);
            allocator.push_fresh_arena(fresh);
        }
        Ok(entry.ref_idx)
    }

    /// `fossil(committed_ref_idx)`: drop every entry strictly older than
    /// the newest one still `<= committed_ref_idx`, keeping at least one
    /// reachable checkpoint for any ref_idx above the frontier. Returns
    /// the ref_idx of the first retained entry. Idempotent: calling again
    /// with the same `committed_ref_idx` retains the same entry and drops
    /// nothing further.
    pub fn fossil(&mut self, committed_ref_idx: usize) -> Option<usize> {
        let keep_from = self
            .log
            .iter()
            .rposition(|e| e.ref_idx <= committed_ref_idx)?;
        self.log.drain(..keep_from);
        self.log.first().map(|e| e.ref_idx)
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}
