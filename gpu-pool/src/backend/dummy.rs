//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations but simulates the parts
//! of a device the pools depend on:
//!
//! - Host-visible backing allocations are real zeroed CPU memory, so mapped
//!   pointers can be written through.
//! - Fences are atomic counters. In [`CompletionMode::Immediate`] every signal
//!   completes as soon as it is issued. In [`CompletionMode::Manual`] signals
//!   stay pending until the test retires them, which models a GPU that is
//!   several frames behind.
//! - Command allocators used by a submission are tagged with the value signaled
//!   after it. Resetting an allocator whose tag has not completed fails, so a
//!   pool that recycles an allocator too early is caught immediately.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::types::{MemoryFlags, QueueRole, ResourceKind};

use super::{BackingAllocation, GpuBackend, MappedPtr};

/// Completed value of a fence created in the satisfied state.
pub const FENCE_READY_VALUE: u64 = 1;

/// How the simulated execution timeline advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Every signal completes immediately.
    #[default]
    Immediate,
    /// Signals stay pending until retired by the caller.
    Manual,
}

/// Raw memory handle of the dummy backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DummyMemory {
    id: u64,
    size: u64,
}

impl DummyMemory {
    /// Unique allocation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
struct FenceState {
    id: u64,
    completed: AtomicU64,
}

/// Fence handle of the dummy backend.
#[derive(Debug, Clone)]
pub struct DummyFence(Arc<FenceState>);

impl DummyFence {
    /// Unique fence id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    fn complete(&self, value: u64) {
        self.0.completed.fetch_max(value, Ordering::AcqRel);
    }
}

/// Command allocator of the dummy backend.
#[derive(Debug)]
pub struct DummyCommandAllocator {
    id: u64,
    role: QueueRole,
    reset_count: u64,
}

impl DummyCommandAllocator {
    /// Unique allocator id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue role the allocator was created for.
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Number of times the allocator has been reset.
    pub fn reset_count(&self) -> u64 {
        self.reset_count
    }
}

/// Command list of the dummy backend.
///
/// Commands are recorded as labels so tests can check what was encoded.
#[derive(Debug)]
pub struct DummyCommandList {
    id: u64,
    role: QueueRole,
    allocator_id: u64,
    commands: Vec<String>,
    closed: bool,
}

impl DummyCommandList {
    /// Unique list id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue role the list was created for.
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Id of the allocator the list currently records into.
    pub fn allocator_id(&self) -> u64 {
        self.allocator_id
    }

    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Whether the list is closed for submission.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Record a command.
    pub fn record(&mut self, command: impl Into<String>) {
        debug_assert!(!self.closed, "recording into a closed command list");
        self.commands.push(command.into());
    }
}

/// Where a submitted allocator stands on the timeline.
#[derive(Debug)]
enum AllocatorTag {
    /// Submitted, but no signal has been issued after it yet.
    Unsignaled,
    /// Done once `fence` reaches `value`.
    Signaled { fence: DummyFence, value: u64 },
}

/// Snapshot of the dummy backend's object counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DummyCounters {
    /// Backing allocations ever created.
    pub allocations_created: usize,
    /// Backing allocations not yet destroyed.
    pub live_allocations: usize,
    /// Fences ever created.
    pub fences_created: usize,
    /// Fences not yet destroyed.
    pub live_fences: usize,
    /// Command allocators ever created.
    pub allocators_created: usize,
    /// Command allocator resets.
    pub allocator_resets: usize,
    /// Command allocators not yet destroyed.
    pub live_allocators: usize,
    /// Command lists ever created.
    pub lists_created: usize,
    /// Command lists not yet destroyed.
    pub live_lists: usize,
    /// Command lists submitted.
    pub submissions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allocations_created: AtomicUsize,
    live_allocations: AtomicUsize,
    fences_created: AtomicUsize,
    live_fences: AtomicUsize,
    allocators_created: AtomicUsize,
    allocator_resets: AtomicUsize,
    live_allocators: AtomicUsize,
    lists_created: AtomicUsize,
    live_lists: AtomicUsize,
    submissions: AtomicUsize,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    mode: CompletionMode,
    memory_budget: Option<u64>,
    allocated_bytes: AtomicU64,
    next_id: AtomicU64,
    /// CPU storage of host-visible allocations, keyed by allocation id.
    host_memory: Mutex<HashMap<u64, Box<[u8]>>>,
    /// Signals waiting to be retired in manual mode.
    pending_signals: Mutex<Vec<(QueueRole, DummyFence, u64)>>,
    /// Allocators submitted per role since the last signal on that role.
    unsignaled: Mutex<[Vec<u64>; 3]>,
    allocator_tags: Mutex<HashMap<u64, AllocatorTag>>,
    device_lost: AtomicBool,
    fail_next_signal: AtomicBool,
    counters: Counters,
}

impl DummyBackend {
    /// Create a new dummy backend whose signals complete immediately.
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Immediate)
    }

    /// Create a new dummy backend with the given completion mode.
    pub fn with_mode(mode: CompletionMode) -> Self {
        Self {
            mode,
            memory_budget: None,
            allocated_bytes: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            host_memory: Mutex::new(HashMap::new()),
            pending_signals: Mutex::new(Vec::new()),
            unsignaled: Mutex::new(Default::default()),
            allocator_tags: Mutex::new(HashMap::new()),
            device_lost: AtomicBool::new(false),
            fail_next_signal: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Limit the total bytes of live backing allocations.
    pub fn with_memory_budget(mut self, budget: u64) -> Self {
        self.memory_budget = Some(budget);
        self
    }

    /// Completion mode of the simulated timeline.
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Bytes of live backing allocations.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Number of signals not yet retired.
    pub fn pending_signal_count(&self) -> usize {
        self.pending_signals.lock().len()
    }

    /// Complete every pending signal.
    pub fn retire_all(&self) {
        let retired: Vec<_> = self.pending_signals.lock().drain(..).collect();
        for (role, fence, value) in retired {
            log::trace!(
                "DummyBackend: retiring {} signal fence={} value={}",
                role.name(),
                fence.id(),
                value
            );
            fence.complete(value);
        }
    }

    /// Complete the oldest pending signal issued on `role`.
    ///
    /// Returns `false` if `role` has no pending signal.
    pub fn retire_oldest(&self, role: QueueRole) -> bool {
        let retired = {
            let mut pending = self.pending_signals.lock();
            pending
                .iter()
                .position(|(r, _, _)| *r == role)
                .map(|index| pending.remove(index))
        };

        match retired {
            Some((_, fence, value)) => {
                fence.complete(value);
                true
            }
            None => false,
        }
    }

    /// Make every subsequent call fail with [`PoolError::DeviceLost`].
    pub fn lose_device(&self) {
        self.device_lost.store(true, Ordering::Release);
    }

    /// Make the next queue signal fail once, after its submission was accepted.
    pub fn fail_next_signal(&self) {
        self.fail_next_signal.store(true, Ordering::Release);
    }

    /// Snapshot of the object counters.
    pub fn counters(&self) -> DummyCounters {
        let c = &self.counters;
        DummyCounters {
            allocations_created: c.allocations_created.load(Ordering::Relaxed),
            live_allocations: c.live_allocations.load(Ordering::Relaxed),
            fences_created: c.fences_created.load(Ordering::Relaxed),
            live_fences: c.live_fences.load(Ordering::Relaxed),
            allocators_created: c.allocators_created.load(Ordering::Relaxed),
            allocator_resets: c.allocator_resets.load(Ordering::Relaxed),
            live_allocators: c.live_allocators.load(Ordering::Relaxed),
            lists_created: c.lists_created.load(Ordering::Relaxed),
            live_lists: c.live_lists.load(Ordering::Relaxed),
            submissions: c.submissions.load(Ordering::Relaxed),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(&self) -> PoolResult<()> {
        if self.device_lost.load(Ordering::Acquire) {
            Err(PoolError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for DummyBackend {
    type Memory = DummyMemory;
    type Fence = DummyFence;
    type CommandAllocator = DummyCommandAllocator;
    type CommandList = DummyCommandList;

    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_backing_allocation(
        &self,
        kind: ResourceKind,
        flags: MemoryFlags,
        size: u64,
    ) -> PoolResult<BackingAllocation<DummyMemory>> {
        self.check_device()?;

        if size == 0 {
            return Err(PoolError::ResourceCreationFailed(
                "backing allocation size cannot be zero".to_string(),
            ));
        }

        let previous = self.allocated_bytes.fetch_add(size, Ordering::AcqRel);
        if let Some(budget) = self.memory_budget
            && previous + size > budget
        {
            self.allocated_bytes.fetch_sub(size, Ordering::AcqRel);
            log::trace!(
                "DummyBackend: allocation of {} bytes exceeds budget ({} of {} used)",
                size,
                previous,
                budget
            );
            return Err(PoolError::OutOfMemory);
        }

        let id = self.next_id();
        let mapped = if flags.is_mappable() {
            let mut storage = vec![0u8; size as usize].into_boxed_slice();
            let ptr = NonNull::new(storage.as_mut_ptr()).ok_or_else(|| {
                PoolError::ResourceCreationFailed("host allocation returned null".to_string())
            })?;
            self.host_memory.lock().insert(id, storage);
            Some(MappedPtr::new(ptr))
        } else {
            None
        };

        self.counters
            .allocations_created
            .fetch_add(1, Ordering::Relaxed);
        self.counters.live_allocations.fetch_add(1, Ordering::Relaxed);

        log::trace!(
            "DummyBackend: creating backing allocation {} ({:?}, {:?}, size: {})",
            id,
            kind,
            flags,
            size
        );

        Ok(BackingAllocation {
            memory: DummyMemory { id, size },
            mapped,
        })
    }

    fn destroy_backing_allocation(&self, memory: DummyMemory) {
        log::trace!("DummyBackend: destroying backing allocation {}", memory.id);
        self.host_memory.lock().remove(&memory.id);
        self.allocated_bytes
            .fetch_sub(memory.size, Ordering::AcqRel);
        self.counters.live_allocations.fetch_sub(1, Ordering::Relaxed);
    }

    fn create_fence(&self, initially_satisfied: bool) -> PoolResult<DummyFence> {
        self.check_device()?;

        let completed = if initially_satisfied {
            FENCE_READY_VALUE
        } else {
            0
        };
        let fence = DummyFence(Arc::new(FenceState {
            id: self.next_id(),
            completed: AtomicU64::new(completed),
        }));

        self.counters.fences_created.fetch_add(1, Ordering::Relaxed);
        self.counters.live_fences.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "DummyBackend: creating fence {} (satisfied: {})",
            fence.id(),
            initially_satisfied
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: DummyFence) {
        log::trace!("DummyBackend: destroying fence {}", fence.id());
        self.pending_signals
            .lock()
            .retain(|(_, pending, _)| pending.id() != fence.id());
        self.counters.live_fences.fetch_sub(1, Ordering::Relaxed);
    }

    fn signal(&self, role: QueueRole, fence: &DummyFence, value: u64) -> PoolResult<()> {
        self.check_device()?;
        if self.fail_next_signal.swap(false, Ordering::AcqRel) {
            return Err(PoolError::Internal(format!(
                "{} queue failed to signal fence {}",
                role.name(),
                fence.id()
            )));
        }

        let submitted: Vec<u64> = self.unsignaled.lock()[role.index()].drain(..).collect();
        {
            let mut tags = self.allocator_tags.lock();
            for allocator_id in submitted {
                tags.insert(
                    allocator_id,
                    AllocatorTag::Signaled {
                        fence: fence.clone(),
                        value,
                    },
                );
            }
        }

        log::trace!(
            "DummyBackend: {} queue signals fence {} to {}",
            role.name(),
            fence.id(),
            value
        );

        match self.mode {
            CompletionMode::Immediate => fence.complete(value),
            CompletionMode::Manual => {
                self.pending_signals
                    .lock()
                    .push((role, fence.clone(), value))
            }
        }
        Ok(())
    }

    fn completed_value(&self, fence: &DummyFence) -> u64 {
        fence.0.completed.load(Ordering::Acquire)
    }

    fn wait(&self, fence: &DummyFence, value: u64, timeout: Duration) -> PoolResult<bool> {
        self.check_device()?;

        let start = Instant::now();
        while self.completed_value(fence) < value {
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::yield_now();
        }
        Ok(true)
    }

    fn create_command_allocator(&self, role: QueueRole) -> PoolResult<DummyCommandAllocator> {
        self.check_device()?;

        let allocator = DummyCommandAllocator {
            id: self.next_id(),
            role,
            reset_count: 0,
        };
        self.counters
            .allocators_created
            .fetch_add(1, Ordering::Relaxed);
        self.counters.live_allocators.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "DummyBackend: creating {} command allocator {}",
            role.name(),
            allocator.id
        );
        Ok(allocator)
    }

    fn reset_command_allocator(&self, allocator: &mut DummyCommandAllocator) -> PoolResult<()> {
        self.check_device()?;

        let mut tags = self.allocator_tags.lock();
        match tags.get(&allocator.id) {
            Some(AllocatorTag::Unsignaled) => {
                return Err(PoolError::Internal(format!(
                    "command allocator {} reset before its submission was signaled",
                    allocator.id
                )));
            }
            Some(AllocatorTag::Signaled { fence, value })
                if self.completed_value(fence) < *value =>
            {
                return Err(PoolError::Internal(format!(
                    "command allocator {} reset while in flight (fence {} at {}, needs {})",
                    allocator.id,
                    fence.id(),
                    self.completed_value(fence),
                    value
                )));
            }
            _ => {}
        }
        tags.remove(&allocator.id);

        allocator.reset_count += 1;
        self.counters.allocator_resets.fetch_add(1, Ordering::Relaxed);
        log::trace!("DummyBackend: reset command allocator {}", allocator.id);
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: DummyCommandAllocator) {
        log::trace!("DummyBackend: destroying command allocator {}", allocator.id);
        self.allocator_tags.lock().remove(&allocator.id);
        self.counters.live_allocators.fetch_sub(1, Ordering::Relaxed);
    }

    fn create_command_list(
        &self,
        allocator: &DummyCommandAllocator,
        role: QueueRole,
    ) -> PoolResult<DummyCommandList> {
        self.check_device()?;

        let list = DummyCommandList {
            id: self.next_id(),
            role,
            allocator_id: allocator.id,
            commands: Vec::new(),
            closed: false,
        };
        self.counters.lists_created.fetch_add(1, Ordering::Relaxed);
        self.counters.live_lists.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "DummyBackend: creating {} command list {} on allocator {}",
            role.name(),
            list.id,
            allocator.id
        );
        Ok(list)
    }

    fn reset_command_list(
        &self,
        list: &mut DummyCommandList,
        allocator: &DummyCommandAllocator,
    ) -> PoolResult<()> {
        self.check_device()?;

        if !list.closed {
            return Err(PoolError::InvalidParameter(format!(
                "command list {} must be closed before reset",
                list.id
            )));
        }

        list.allocator_id = allocator.id;
        list.commands.clear();
        list.closed = false;
        log::trace!(
            "DummyBackend: reset command list {} onto allocator {}",
            list.id,
            allocator.id
        );
        Ok(())
    }

    fn close_command_list(&self, list: &mut DummyCommandList) -> PoolResult<()> {
        self.check_device()?;

        if list.closed {
            return Err(PoolError::InvalidParameter(format!(
                "command list {} is already closed",
                list.id
            )));
        }
        list.closed = true;
        Ok(())
    }

    fn destroy_command_list(&self, list: DummyCommandList) {
        log::trace!("DummyBackend: destroying command list {}", list.id);
        self.counters.live_lists.fetch_sub(1, Ordering::Relaxed);
    }

    fn submit(&self, role: QueueRole, list: &DummyCommandList) -> PoolResult<()> {
        self.check_device()?;

        if !list.closed {
            return Err(PoolError::InvalidParameter(format!(
                "command list {} submitted without being closed",
                list.id
            )));
        }

        self.unsignaled.lock()[role.index()].push(list.allocator_id);
        self.allocator_tags
            .lock()
            .insert(list.allocator_id, AllocatorTag::Unsignaled);
        self.counters.submissions.fetch_add(1, Ordering::Relaxed);

        log::trace!(
            "DummyBackend: {} queue executing list {} ({} commands)",
            role.name(),
            list.id,
            list.commands.len()
        );
        Ok(())
    }
}
