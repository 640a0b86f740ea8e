//! Size-class routed arena pool.
//!
//! [`SizeClassPool`] owns every [`Arena`] and keeps one arena list per size
//! class. Arenas live in a single table and are referred to by [`ArenaId`]
//! (table index plus generation), so a handle never points at arena memory
//! directly. Arenas are only destroyed by [`SizeClassPool::teardown`].

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{GpuBackend, MappedPtr};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::profile_scope;
use crate::types::{MemoryFlags, ResourceKind};

use super::arena::{Arena, Range};
use super::size_class::SizeClassTable;

/// Source of process-unique pool ids.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an arena and the reset cycle a range was carved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId {
    /// Id of the pool that owns the arena.
    pub pool: u64,
    /// Index into the pool's arena table.
    pub index: u32,
    /// Arena generation at allocation time.
    pub generation: u64,
}

/// A range of pooled memory owned by the caller.
///
/// The handle is not `Clone`: freeing it consumes it. The memory itself stays
/// owned by the arena it was carved from.
#[derive(Debug)]
pub struct AllocationHandle<M> {
    arena: ArenaId,
    range: Range,
    requested_size: u64,
    memory: M,
    mapped: Option<MappedPtr>,
    kind: ResourceKind,
    flags: MemoryFlags,
}

impl<M> AllocationHandle<M> {
    /// Arena the range belongs to.
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// The granted range.
    pub fn range(&self) -> Range {
        self.range
    }

    /// Byte offset into the backing allocation.
    pub fn offset(&self) -> u64 {
        self.range.offset
    }

    /// Usable size in bytes.
    ///
    /// This is the whole granted range, which may exceed the request when a
    /// larger free range was reused.
    pub fn size(&self) -> u64 {
        self.range.size
    }

    /// Size originally requested.
    pub fn requested_size(&self) -> u64 {
        self.requested_size
    }

    /// Raw backing memory handle.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Resource kind of the backing arena.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Memory flags of the backing arena.
    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// CPU pointer to the first byte of the range, for host-visible memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.map(MappedPtr::as_ptr)
    }

    /// The mapped range as a byte slice.
    ///
    /// # Safety
    ///
    /// The GPU must not be accessing the range, and the handle must not have
    /// outlived the pool's teardown.
    pub unsafe fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped_ptr()?;
        // SAFETY: the range lies inside the mapped arena and the handle has
        // exclusive ownership of it; the caller upholds GPU and lifetime rules.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.range.size as usize) })
    }
}

#[derive(Debug)]
struct PoolInner<M> {
    arenas: Vec<Arena<M>>,
    /// Arena table indices, per size class.
    classes: Vec<Vec<usize>>,
    /// Next generation to hand out; only ever grows.
    next_generation: u64,
}

impl<M> PoolInner<M> {
    fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

/// Thread-safe pool of arenas grouped by size class.
pub struct SizeClassPool<B: GpuBackend> {
    id: u64,
    backend: Arc<B>,
    table: SizeClassTable,
    label: String,
    inner: Mutex<PoolInner<B::Memory>>,
}

impl<B: GpuBackend> SizeClassPool<B> {
    /// Create an empty pool. Arenas are created on first demand.
    pub fn new(backend: Arc<B>, config: &PoolConfig) -> Self {
        let table = SizeClassTable::new(config.size_classes.clone(), config.alignment);
        let classes = vec![Vec::new(); table.len()];
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            table,
            label: config.label().to_string(),
            inner: Mutex::new(PoolInner {
                arenas: Vec::new(),
                classes,
                next_generation: 0,
            }),
        }
    }

    /// Process-unique id of this pool, carried by every handle it issues.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The size class routing table.
    pub fn table(&self) -> &SizeClassTable {
        &self.table
    }

    /// Allocate `size` bytes of `kind`/`flags` memory.
    ///
    /// Never waits on the GPU. If no existing arena of the routed class has
    /// room, a new backing allocation is created.
    pub fn alloc(
        &self,
        kind: ResourceKind,
        flags: MemoryFlags,
        size: u64,
    ) -> PoolResult<AllocationHandle<B::Memory>> {
        profile_scope!("gpu_pool_alloc");

        let (class_index, aligned) = self.table.route(size)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for &index in &inner.classes[class_index] {
            let arena = &mut inner.arenas[index];
            if !arena.is_compatible(kind, flags) {
                continue;
            }
            if let Some(range) = arena.alloc(aligned) {
                log::trace!(
                    "{}: allocated {} bytes at {} from arena {} (class {})",
                    self.label,
                    range.size,
                    range.offset,
                    index,
                    class_index
                );
                return Ok(make_handle(self.id, index, arena, range, size));
            }
        }

        let index = inner.arenas.len();
        let arena_index = u32::try_from(index).map_err(|_| {
            PoolError::Internal(format!("arena table exceeded {} entries", u32::MAX))
        })?;

        let capacity = self.table.class(class_index).arena_capacity(aligned);
        let backing = self
            .backend
            .create_backing_allocation(kind, flags, capacity)?;
        let generation = inner.take_generation();

        let mut arena = Arena::new(
            backing.memory,
            backing.mapped,
            kind,
            flags,
            capacity,
            self.table.alignment(),
            generation,
        );
        let Some(range) = arena.alloc(aligned) else {
            self.backend.destroy_backing_allocation(arena.into_memory());
            return Err(PoolError::Internal(format!(
                "fresh arena of {capacity} bytes cannot hold {aligned} bytes"
            )));
        };

        log::debug!(
            "{}: created arena {} ({:?}, {:?}, {} bytes) for class {}",
            self.label,
            arena_index,
            kind,
            flags,
            capacity,
            class_index
        );

        let handle = make_handle(self.id, index, &arena, range, size);
        inner.arenas.push(arena);
        inner.classes[class_index].push(index);
        Ok(handle)
    }

    /// Check that `handle` still refers to a live range of this pool.
    pub fn validate(&self, handle: &AllocationHandle<B::Memory>) -> PoolResult<()> {
        let id = handle.arena;
        if id.pool != self.id {
            return Err(PoolError::StaleHandle(format!(
                "handle was issued by pool {}, not pool {}",
                id.pool, self.id
            )));
        }

        let inner = self.inner.lock();
        let arena = inner.arenas.get(id.index as usize).ok_or_else(|| {
            PoolError::StaleHandle(format!("arena {} does not exist", id.index))
        })?;

        if arena.generation() != id.generation {
            return Err(PoolError::StaleHandle(format!(
                "arena {} is at generation {}, handle was issued in generation {}",
                id.index,
                arena.generation(),
                id.generation
            )));
        }

        if !arena.owns(&handle.range) {
            return Err(PoolError::StaleHandle(format!(
                "range {:?} was not carved from arena {}",
                handle.range, id.index
            )));
        }

        if arena.is_free(&handle.range) {
            return Err(PoolError::StaleHandle(format!(
                "range {:?} of arena {} is already free",
                handle.range, id.index
            )));
        }

        Ok(())
    }

    /// Return a range to its arena immediately.
    ///
    /// The GPU must no longer reference the range. Callers normally go through
    /// the deferred reclaim queue instead.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by another pool, or if its arena does
    /// not exist or does not own the range.
    pub fn free(&self, handle: AllocationHandle<B::Memory>) {
        assert_eq!(
            handle.arena.pool, self.id,
            "free of a handle issued by another pool"
        );
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = handle.arena;
        let generation = inner.next_generation;

        let arena = inner
            .arenas
            .get_mut(id.index as usize)
            .unwrap_or_else(|| panic!("free into unknown arena {}", id.index));
        debug_assert_eq!(
            arena.generation(),
            id.generation,
            "free of a range from a previous arena generation"
        );

        if arena.free(handle.range, generation) {
            inner.next_generation += 1;
            log::debug!(
                "{}: arena {} drained, reset to generation {}",
                self.label,
                id.index,
                generation
            );
        } else {
            log::trace!(
                "{}: range {:?} returned to arena {}",
                self.label,
                handle.range,
                id.index
            );
        }
    }

    /// Destroy every arena and its backing allocation.
    ///
    /// Outstanding handles become stale. Returns the number of arenas destroyed.
    pub fn teardown(&self) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let arenas: Vec<_> = inner.arenas.drain(..).collect();
        for class in &mut inner.classes {
            class.clear();
        }

        let count = arenas.len();
        for arena in arenas {
            if !arena.is_empty() {
                log::warn!(
                    "{}: destroying arena with {} live ranges",
                    self.label,
                    arena.live_count()
                );
            }
            self.backend.destroy_backing_allocation(arena.into_memory());
        }
        count
    }

    /// Number of arenas.
    pub fn arena_count(&self) -> usize {
        self.inner.lock().arenas.len()
    }

    /// Number of arenas in size class `class_index`.
    pub fn class_arena_count(&self, class_index: usize) -> usize {
        self.inner
            .lock()
            .classes
            .get(class_index)
            .map_or(0, Vec::len)
    }

    /// Total bytes of backing memory held.
    pub fn reserved_bytes(&self) -> u64 {
        self.inner.lock().arenas.iter().map(Arena::capacity).sum()
    }

    /// Number of ranges currently handed out.
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().arenas.iter().map(Arena::live_count).sum()
    }

    /// Number of ranges waiting on arena free lists.
    pub fn free_range_count(&self) -> usize {
        self.inner
            .lock()
            .arenas
            .iter()
            .map(|arena| arena.free_ranges().len())
            .sum()
    }
}

impl<B: GpuBackend> std::fmt::Debug for SizeClassPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassPool")
            .field("label", &self.label)
            .field("classes", &self.table.len())
            .field("arenas", &self.arena_count())
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

fn make_handle<M: Clone>(
    pool: u64,
    index: usize,
    arena: &Arena<M>,
    range: Range,
    requested_size: u64,
) -> AllocationHandle<M> {
    let mapped = arena.mapped().map(|base| {
        // SAFETY: the range was carved from this arena, so it lies inside the mapping.
        MappedPtr::new(unsafe { base.offset(range.offset) })
    });

    AllocationHandle {
        arena: ArenaId {
            pool,
            index: index as u32,
            generation: arena.generation(),
        },
        range,
        requested_size,
        memory: arena.memory().clone(),
        mapped,
        kind: arena.kind(),
        flags: arena.flags(),
    }
}
