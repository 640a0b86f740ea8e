//! GPU backend abstraction layer.
//!
//! The pools never talk to a graphics API directly. Everything they need from
//! the device (backing memory, completion fences, command allocators and
//! command lists, queue submission) goes through the [`GpuBackend`] trait.
//!
//! # Available Backends
//!
//! - `dummy` (default): simulated execution timeline for testing and development
//!
//! # Handles
//!
//! Backend handle types stand in for raw API handles: they are cheap to clone
//! (memory and fences) and carry no ownership. The pools decide when a handle
//! is destroyed.

#[cfg(feature = "dummy")]
pub mod dummy;

use std::fmt::Debug;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::PoolResult;
use crate::types::{MemoryFlags, QueueRole, ResourceKind};

/// CPU pointer to the start of a mapped backing allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: MappedPtr is a plain address into memory owned by the backend. The
// pools never dereference it; synchronizing access to the pointed-to bytes is
// the responsibility of whoever holds the allocation handle.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wrap a mapped base pointer.
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// The raw base pointer.
    pub fn as_ptr(self) -> NonNull<u8> {
        self.0
    }

    /// Pointer `offset` bytes past the base.
    ///
    /// # Safety
    ///
    /// `offset` must lie within the mapped allocation.
    pub unsafe fn offset(self, offset: u64) -> NonNull<u8> {
        // SAFETY: caller guarantees the offset is in bounds of the mapping.
        unsafe { self.0.add(offset as usize) }
    }
}

/// A backing allocation created by the backend.
#[derive(Debug, Clone)]
pub struct BackingAllocation<M> {
    /// Raw memory handle.
    pub memory: M,
    /// CPU mapping, present for host-visible memory.
    pub mapped: Option<MappedPtr>,
}

/// Device capabilities the pools are built on.
///
/// Implementations must be thread-safe: the pools call into the backend from
/// whichever submission thread is allocating or submitting.
pub trait GpuBackend: Send + Sync + 'static {
    /// Raw handle to one backing allocation.
    type Memory: Clone + Debug + Send + Sync;
    /// Raw handle to a completion fence (a monotonically increasing counter).
    type Fence: Clone + Debug + Send + Sync;
    /// Scratch memory commands are encoded into.
    type CommandAllocator: Debug + Send + Sync;
    /// An encoded command sequence.
    type CommandList: Debug + Send + Sync;

    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a backing allocation of exactly `size` bytes.
    fn create_backing_allocation(
        &self,
        kind: ResourceKind,
        flags: MemoryFlags,
        size: u64,
    ) -> PoolResult<BackingAllocation<Self::Memory>>;

    /// Release a backing allocation.
    fn destroy_backing_allocation(&self, memory: Self::Memory);

    /// Create a completion fence.
    ///
    /// When `initially_satisfied` is true, waiting for value 0 returns
    /// immediately.
    fn create_fence(&self, initially_satisfied: bool) -> PoolResult<Self::Fence>;

    /// Destroy a completion fence.
    fn destroy_fence(&self, fence: Self::Fence);

    /// Have `role`'s queue set `fence` to `value` once previously submitted work finishes.
    fn signal(&self, role: QueueRole, fence: &Self::Fence, value: u64) -> PoolResult<()>;

    /// Last value the execution timeline has reached on `fence` (non-blocking).
    fn completed_value(&self, fence: &Self::Fence) -> u64;

    /// Block until `fence` reaches `value` or `timeout` elapses.
    ///
    /// Returns `true` if the value was reached.
    fn wait(&self, fence: &Self::Fence, value: u64, timeout: Duration) -> PoolResult<bool>;

    /// Create a command allocator for `role`.
    fn create_command_allocator(&self, role: QueueRole) -> PoolResult<Self::CommandAllocator>;

    /// Reset a command allocator, invalidating everything recorded through it.
    fn reset_command_allocator(&self, allocator: &mut Self::CommandAllocator) -> PoolResult<()>;

    /// Destroy a command allocator.
    fn destroy_command_allocator(&self, allocator: Self::CommandAllocator);

    /// Create a command list recording into `allocator`.
    fn create_command_list(
        &self,
        allocator: &Self::CommandAllocator,
        role: QueueRole,
    ) -> PoolResult<Self::CommandList>;

    /// Reset a closed command list and rebind it to `allocator`.
    fn reset_command_list(
        &self,
        list: &mut Self::CommandList,
        allocator: &Self::CommandAllocator,
    ) -> PoolResult<()>;

    /// Close a command list for submission.
    fn close_command_list(&self, list: &mut Self::CommandList) -> PoolResult<()>;

    /// Destroy a command list.
    fn destroy_command_list(&self, list: Self::CommandList);

    /// Submit a closed command list to `role`'s queue.
    fn submit(&self, role: QueueRole, list: &Self::CommandList) -> PoolResult<()>;
}
