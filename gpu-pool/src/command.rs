//! Command allocator and command list recycling.
//!
//! Recording work for the GPU needs two objects: a command allocator (the
//! scratch memory commands are encoded into) and a command list (the handle
//! the commands are recorded through). Both are reused across frames, but
//! with different rules:
//!
//! - A **list** can be re-recorded as soon as it is closed and submitted. It
//!   goes straight back to the idle FIFO.
//! - An **allocator** owns the encoded commands. Resetting it while the GPU
//!   still executes them corrupts the submission, so it waits in the pending
//!   FIFO, tagged with the completion value signaled after its submission,
//!   until the role's timeline reaches that value.
//!
//! # Architecture
//!
//! ```text
//! acquire(role)
//!   ├─ pending head reached? ── pop, reset allocator
//!   │   └─ otherwise ── create a fresh allocator (never blocks)
//!   └─ idle list? ── reset onto allocator
//!       └─ otherwise ── create a list on allocator
//!   ▶ RecordingList { list, allocator }
//!
//! execute(recording)
//!   close list ── submit ── signal timeline value v
//!   pending  ◀── (v, allocator)
//!   idle     ◀── list
//! ```
//!
//! Each [`QueueRole`] has independent state and its own timeline token taken
//! from the shared [`CompletionTokenPool`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::GpuBackend;
use crate::error::PoolResult;
use crate::profile_scope;
use crate::sync::{CompletionToken, CompletionTokenPool};
use crate::types::QueueRole;

/// A command list paired with the allocator it records into.
///
/// Returned by [`RecordingObjectPool::acquire`] and handed back through
/// [`RecordingObjectPool::execute`]. The pairing travels with the list, so
/// the allocator is always recovered exactly.
pub struct RecordingList<B: GpuBackend> {
    role: QueueRole,
    list: B::CommandList,
    allocator: B::CommandAllocator,
}

impl<B: GpuBackend> RecordingList<B> {
    /// Queue role the list will be submitted to.
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// The command list.
    pub fn list(&self) -> &B::CommandList {
        &self.list
    }

    /// The command list, for recording.
    pub fn list_mut(&mut self) -> &mut B::CommandList {
        &mut self.list
    }

    /// The allocator backing the list.
    pub fn allocator(&self) -> &B::CommandAllocator {
        &self.allocator
    }
}

impl<B: GpuBackend> std::fmt::Debug for RecordingList<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingList")
            .field("role", &self.role)
            .field("list", &self.list)
            .field("allocator", &self.allocator)
            .finish()
    }
}

/// Snapshot of one role's recording state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleStats {
    /// Allocators waiting for their submission to complete.
    pub pending_allocators: usize,
    /// Allocators whose submission could not be signaled. Never reused.
    pub parked_allocators: usize,
    /// Lists ready to be re-recorded.
    pub idle_lists: usize,
    /// Allocators created for this role.
    pub allocators_created: usize,
    /// Lists created for this role.
    pub lists_created: usize,
    /// Completion value of the most recent submission.
    pub last_submitted: u64,
    /// Completion value the timeline has reached.
    pub completed: u64,
}

struct RoleState<B: GpuBackend> {
    /// Timeline stamped on every submission; taken on first use.
    timeline: Option<CompletionToken<B::Fence>>,
    pending: VecDeque<(u64, B::CommandAllocator)>,
    /// Allocators with no completion value to wait on; destroyed at teardown.
    parked: Vec<B::CommandAllocator>,
    idle_lists: VecDeque<B::CommandList>,
    allocators_created: usize,
    lists_created: usize,
}

impl<B: GpuBackend> RoleState<B> {
    fn new() -> Self {
        Self {
            timeline: None,
            pending: VecDeque::new(),
            parked: Vec::new(),
            idle_lists: VecDeque::new(),
            allocators_created: 0,
            lists_created: 0,
        }
    }
}

/// Thread-safe pool of command allocators and command lists.
pub struct RecordingObjectPool<B: GpuBackend> {
    backend: Arc<B>,
    tokens: Arc<CompletionTokenPool<B>>,
    roles: [Mutex<RoleState<B>>; 3],
}

impl<B: GpuBackend> RecordingObjectPool<B> {
    /// Create an empty pool. Timelines are taken from `tokens` on first use.
    pub fn new(backend: Arc<B>, tokens: Arc<CompletionTokenPool<B>>) -> Self {
        Self {
            backend,
            tokens,
            roles: [
                Mutex::new(RoleState::new()),
                Mutex::new(RoleState::new()),
                Mutex::new(RoleState::new()),
            ],
        }
    }

    fn role(&self, role: QueueRole) -> &Mutex<RoleState<B>> {
        &self.roles[role.index()]
    }

    /// Get a reset allocator for `role`.
    ///
    /// Reuses the oldest pending allocator if its submission has completed;
    /// otherwise creates a new one rather than waiting.
    pub fn acquire_allocator(&self, role: QueueRole) -> PoolResult<B::CommandAllocator> {
        let fence = {
            let state = self.role(role).lock();
            match (&state.timeline, state.pending.front()) {
                (Some(timeline), Some(_)) => Some(timeline.fence().clone()),
                _ => None,
            }
        };

        // The completion query runs outside the lock.
        let completed = fence.map(|fence| self.backend.completed_value(&fence));

        let reusable = completed.and_then(|completed| {
            let mut state = self.role(role).lock();
            let ready = matches!(state.pending.front(), Some((value, _)) if *value <= completed);
            if ready {
                state.pending.pop_front().map(|(_, allocator)| allocator)
            } else {
                None
            }
        });

        if let Some(mut allocator) = reusable {
            if let Err(err) = self.backend.reset_command_allocator(&mut allocator) {
                self.backend.destroy_command_allocator(allocator);
                return Err(err);
            }
            log::trace!("reusing {} command allocator", role.name());
            return Ok(allocator);
        }

        let allocator = self.backend.create_command_allocator(role)?;
        let mut state = self.role(role).lock();
        state.allocators_created += 1;
        log::debug!(
            "created {} command allocator ({} total, {} pending)",
            role.name(),
            state.allocators_created,
            state.pending.len()
        );
        Ok(allocator)
    }

    /// Get a list ready for recording, bound to a reset allocator.
    pub fn acquire(&self, role: QueueRole) -> PoolResult<RecordingList<B>> {
        profile_scope!("gpu_pool_acquire_recording_list");

        let allocator = self.acquire_allocator(role)?;
        let idle = self.role(role).lock().idle_lists.pop_front();

        let list = match idle {
            Some(mut list) => match self.backend.reset_command_list(&mut list, &allocator) {
                Ok(()) => list,
                Err(err) => {
                    self.backend.destroy_command_list(list);
                    self.backend.destroy_command_allocator(allocator);
                    return Err(err);
                }
            },
            None => match self.backend.create_command_list(&allocator, role) {
                Ok(list) => {
                    let mut state = self.role(role).lock();
                    state.lists_created += 1;
                    log::debug!(
                        "created {} command list ({} total)",
                        role.name(),
                        state.lists_created
                    );
                    list
                }
                Err(err) => {
                    self.backend.destroy_command_allocator(allocator);
                    return Err(err);
                }
            },
        };

        Ok(RecordingList {
            role,
            list,
            allocator,
        })
    }

    /// Close, submit and stamp a recorded list.
    ///
    /// The list returns to the idle FIFO immediately. The allocator waits in
    /// the pending FIFO until the returned completion value is reached.
    pub fn execute(&self, recording: RecordingList<B>) -> PoolResult<u64> {
        profile_scope!("gpu_pool_execute");

        let RecordingList {
            role,
            mut list,
            allocator,
        } = recording;

        if let Err(err) = self.backend.close_command_list(&mut list) {
            self.backend.destroy_command_list(list);
            self.backend.destroy_command_allocator(allocator);
            return Err(err);
        }

        let mut state = self.role(role).lock();
        let mut timeline = match state.timeline.take() {
            Some(timeline) => timeline,
            None => match self.tokens.acquire() {
                Ok(timeline) => timeline,
                Err(err) => {
                    drop(state);
                    self.backend.destroy_command_list(list);
                    self.backend.destroy_command_allocator(allocator);
                    return Err(err);
                }
            },
        };

        if let Err(err) = self.backend.submit(role, &list) {
            // Nothing reached the queue: the closed list can be re-recorded.
            state.timeline = Some(timeline);
            state.idle_lists.push_back(list);
            drop(state);
            self.backend.destroy_command_allocator(allocator);
            return Err(err);
        }

        let signaled = self.tokens.signal(&mut timeline, role);
        state.timeline = Some(timeline);
        state.idle_lists.push_back(list);

        match signaled {
            Ok(value) => {
                log::trace!("{} submission stamped with {}", role.name(), value);
                state.pending.push_back((value, allocator));
                Ok(value)
            }
            Err(err) => {
                // The submission may still be running and nothing marks its
                // end, so the allocator is kept out of the FIFO for good.
                log::error!(
                    "failed to signal {} timeline after submission: {}",
                    role.name(),
                    err
                );
                state.parked.push(allocator);
                Err(err)
            }
        }
    }

    /// Completion value of `role`'s latest submission, if any.
    pub fn last_submitted(&self, role: QueueRole) -> Option<u64> {
        self.role(role)
            .lock()
            .timeline
            .as_ref()
            .map(CompletionToken::value)
    }

    /// Block until every submission on `role` has completed or `timeout` elapses.
    ///
    /// Returns `true` if the role is idle.
    pub fn wait_idle(&self, role: QueueRole, timeout: Duration) -> PoolResult<bool> {
        let target = {
            let state = self.role(role).lock();
            state
                .timeline
                .as_ref()
                .map(|timeline| (timeline.fence().clone(), timeline.value()))
        };

        match target {
            Some((fence, value)) => self.backend.wait(&fence, value, timeout),
            None => Ok(true),
        }
    }

    /// Snapshot of `role`'s recording state.
    pub fn stats(&self, role: QueueRole) -> RoleStats {
        let (fence, last_submitted, mut stats) = {
            let state = self.role(role).lock();
            let stats = RoleStats {
                pending_allocators: state.pending.len(),
                parked_allocators: state.parked.len(),
                idle_lists: state.idle_lists.len(),
                allocators_created: state.allocators_created,
                lists_created: state.lists_created,
                last_submitted: 0,
                completed: 0,
            };
            match &state.timeline {
                Some(timeline) => (
                    Some(timeline.fence().clone()),
                    timeline.value(),
                    stats,
                ),
                None => (None, 0, stats),
            }
        };

        stats.last_submitted = last_submitted;
        stats.completed = fence.map_or(0, |fence| self.backend.completed_value(&fence));
        stats
    }

    /// Destroy every pooled allocator and list and return the timelines.
    ///
    /// All submitted work must have completed.
    pub fn teardown(&self) -> PoolResult<()> {
        for role in QueueRole::ALL {
            let (timeline, pending, parked, idle) = {
                let mut state = self.role(role).lock();
                let pending: Vec<_> = state.pending.drain(..).collect();
                let parked = std::mem::take(&mut state.parked);
                let idle: Vec<_> = state.idle_lists.drain(..).collect();
                (state.timeline.take(), pending, parked, idle)
            };

            if !parked.is_empty() {
                log::warn!(
                    "destroying {} {} allocators whose submission was never signaled",
                    parked.len(),
                    role.name()
                );
            }
            if !pending.is_empty() || !idle.is_empty() {
                log::debug!(
                    "destroying {} {} allocators and {} lists",
                    pending.len(),
                    role.name(),
                    idle.len()
                );
            }

            for list in idle {
                self.backend.destroy_command_list(list);
            }
            for allocator in pending.into_iter().map(|(_, allocator)| allocator).chain(parked) {
                self.backend.destroy_command_allocator(allocator);
            }
            if let Some(timeline) = timeline {
                self.tokens.release(timeline)?;
            }
        }
        Ok(())
    }
}

impl<B: GpuBackend> std::fmt::Debug for RecordingObjectPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("RecordingObjectPool");
        for role in QueueRole::ALL {
            debug.field(role.name(), &self.stats(role));
        }
        debug.finish()
    }
}
