//! A single backing allocation sub-divided into ranges.
//!
//! An [`Arena`] hands out aligned byte ranges from one backing allocation.
//! Fresh ranges are bump-allocated from a cursor. Returned ranges go on a
//! free list and are reused first-fit, whole: a 512-byte free range that
//! serves a 256-byte request is granted in full, and the remainder stays
//! unusable until the range comes back.
//!
//! Fragmentation is cleared only when the arena drains completely. When the
//! last outstanding range is freed, the free list and the ledger are dropped
//! and the cursor rewinds to zero.
//!
//! # Thread Safety
//!
//! `Arena` is NOT thread-safe. It is owned by a [`SizeClassPool`], which
//! serializes all access behind its lock.
//!
//! [`SizeClassPool`]: super::SizeClassPool

use crate::backend::MappedPtr;
use crate::types::{MemoryFlags, ResourceKind};

use super::align_up;

/// A byte range inside one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    /// Byte offset into the arena.
    pub offset: u64,
    /// Size of the range in bytes.
    pub size: u64,
}

impl Range {
    /// Create a new range.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Get the end offset (offset + size).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether two ranges share at least one byte.
    pub fn overlaps(&self, other: &Range) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// One backing allocation and the ranges carved from it.
#[derive(Debug)]
pub struct Arena<M> {
    memory: M,
    mapped: Option<MappedPtr>,
    kind: ResourceKind,
    flags: MemoryFlags,
    capacity: u64,
    alignment: u64,
    cursor: u64,
    /// Returned ranges, in the order they came back.
    free_list: Vec<Range>,
    /// Every range carved since the last reset.
    ledger: Vec<Range>,
    generation: u64,
}

impl<M> Arena<M> {
    /// Wrap a backing allocation of `capacity` bytes.
    pub fn new(
        memory: M,
        mapped: Option<MappedPtr>,
        kind: ResourceKind,
        flags: MemoryFlags,
        capacity: u64,
        alignment: u64,
        generation: u64,
    ) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            memory,
            mapped,
            kind,
            flags,
            capacity,
            alignment,
            cursor: 0,
            free_list: Vec::new(),
            ledger: Vec::new(),
            generation,
        }
    }

    /// Raw backing memory handle.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// CPU mapping of the whole arena, if host-visible.
    pub fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    /// Resource kind the arena serves.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Memory flags of the backing allocation.
    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current bump offset.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Reset counter; changes every time the arena drains.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ranges waiting on the free list.
    pub fn free_ranges(&self) -> &[Range] {
        &self.free_list
    }

    /// Number of ranges carved since the last reset.
    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    /// Number of ranges currently handed out.
    pub fn live_count(&self) -> usize {
        self.ledger.len() - self.free_list.len()
    }

    /// Whether no range is handed out.
    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    /// Whether the arena can serve requests of this kind and flags.
    pub fn is_compatible(&self, kind: ResourceKind, flags: MemoryFlags) -> bool {
        self.kind == kind && self.flags == flags
    }

    /// Whether `range` was carved from this arena since the last reset.
    pub fn owns(&self, range: &Range) -> bool {
        self.ledger.contains(range)
    }

    /// Whether `range` is currently on the free list.
    pub fn is_free(&self, range: &Range) -> bool {
        self.free_list.contains(range)
    }

    /// Allocate `size` bytes.
    ///
    /// Returns `None` when the arena is exhausted; the owning pool then
    /// creates another arena. A reused free range is returned whole, so the
    /// granted range may be larger than the aligned request.
    pub fn alloc(&mut self, size: u64) -> Option<Range> {
        let aligned = align_up(size, self.alignment)?;
        if aligned > self.capacity {
            return None;
        }

        if let Some(index) = self.free_list.iter().position(|r| r.size >= aligned) {
            return Some(self.free_list.remove(index));
        }

        let offset = align_up(self.cursor, self.alignment)?;
        let end = offset.checked_add(aligned)?;
        if end > self.capacity {
            return None;
        }

        let range = Range::new(offset, aligned);
        self.cursor = end;
        self.ledger.push(range);
        Some(range)
    }

    /// Return a range to the arena.
    ///
    /// Returns `true` if this was the last outstanding range and the arena
    /// was reset. `next_generation` becomes the arena's generation on reset.
    ///
    /// # Panics
    ///
    /// Panics if the range was never carved from this arena.
    pub fn free(&mut self, range: Range, next_generation: u64) -> bool {
        assert!(
            self.ledger.len() > self.free_list.len(),
            "arena ledger ({}) is smaller than its free list ({})",
            self.ledger.len(),
            self.free_list.len()
        );
        assert!(
            self.owns(&range),
            "range {:?} was not carved from this arena",
            range
        );
        debug_assert!(!self.is_free(&range), "double free of range {:?}", range);

        if self.ledger.len() == self.free_list.len() + 1 {
            self.reset(next_generation);
            return true;
        }

        self.free_list.push(range);
        false
    }

    fn reset(&mut self, generation: u64) {
        self.free_list.clear();
        self.ledger.clear();
        self.cursor = 0;
        self.generation = generation;
    }

    /// Consume the arena, returning its backing memory.
    pub fn into_memory(self) -> M {
        self.memory
    }
}
