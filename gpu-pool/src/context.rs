//! The recycle context: every pool behind one object.
//!
//! A [`RecycleContext`] owns the memory pool, the deferred reclaim queue, the
//! completion token pool and the recording object pool for one device. It is
//! created explicitly and passed to whoever needs it; there is no global
//! instance.
//!
//! # Frame loop
//!
//! ```ignore
//! let context = RecycleContext::new(backend, PoolConfig::default())?;
//!
//! for frame in 1.. {
//!     let uniforms = context.allocate(ResourceKind::Buffer, MemoryFlags::UPLOAD, 256)?;
//!     let mut recording = context.acquire_recording_list(QueueRole::Graphics)?;
//!     // ... record commands reading `uniforms` ...
//!     context.submit_recording_list(recording)?;
//!     context.free(uniforms)?;
//!
//!     context.advance_frame(frame);
//! }
//!
//! context.wait_idle(Duration::from_secs(5))?;
//! context.teardown()?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::GpuBackend;
use crate::command::{RecordingList, RecordingObjectPool};
use crate::config::PoolConfig;
use crate::error::PoolResult;
use crate::memory::{AllocationHandle, DeferredReclaimQueue, SizeClassPool};
use crate::stats::PoolStats;
use crate::sync::{CompletionToken, CompletionTokenPool};
use crate::types::{MemoryFlags, QueueRole, ResourceKind};
use crate::{frame_mark, profile_scope};

/// Allocation handle type of backend `B`.
pub type Allocation<B> = AllocationHandle<<B as GpuBackend>::Memory>;

/// Completion token type of backend `B`.
pub type Token<B> = CompletionToken<<B as GpuBackend>::Fence>;

/// All recycling pools of one device.
pub struct RecycleContext<B: GpuBackend> {
    backend: Arc<B>,
    config: PoolConfig,
    memory: SizeClassPool<B>,
    deferred: DeferredReclaimQueue<B::Memory>,
    tokens: Arc<CompletionTokenPool<B>>,
    recording: RecordingObjectPool<B>,
}

impl<B: GpuBackend> RecycleContext<B> {
    /// Create a context on `backend`.
    ///
    /// Fails with [`PoolError::InvalidParameter`](crate::PoolError::InvalidParameter)
    /// if the configuration is invalid. No backend object is created until first use.
    pub fn new(backend: Arc<B>, config: PoolConfig) -> PoolResult<Self> {
        let config = config.validated()?;
        let tokens = Arc::new(CompletionTokenPool::new(Arc::clone(&backend)));

        log::info!(
            "{}: created on {} ({} size classes, alignment {}, frame latency {})",
            config.label(),
            backend.name(),
            config.size_classes.len(),
            config.alignment,
            config.frame_latency
        );

        Ok(Self {
            memory: SizeClassPool::new(Arc::clone(&backend), &config),
            deferred: DeferredReclaimQueue::new(config.frame_latency),
            recording: RecordingObjectPool::new(Arc::clone(&backend), Arc::clone(&tokens)),
            tokens,
            config,
            backend,
        })
    }

    /// The backend the pools allocate from.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The validated configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Frame number of the last [`advance_frame`](Self::advance_frame).
    pub fn current_frame(&self) -> u64 {
        self.deferred.current_frame()
    }

    /// The memory pool.
    pub fn memory(&self) -> &SizeClassPool<B> {
        &self.memory
    }

    /// The completion token pool.
    pub fn tokens(&self) -> &CompletionTokenPool<B> {
        &self.tokens
    }

    /// The recording object pool.
    pub fn recording(&self) -> &RecordingObjectPool<B> {
        &self.recording
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Allocate `size` bytes of pooled memory.
    pub fn allocate(
        &self,
        kind: ResourceKind,
        flags: MemoryFlags,
        size: u64,
    ) -> PoolResult<Allocation<B>> {
        self.memory.alloc(kind, flags, size)
    }

    /// Free an allocation once the GPU can no longer be using it.
    ///
    /// The range returns to its arena after `frame_latency` further frames.
    /// Returns [`PoolError::StaleHandle`](crate::PoolError::StaleHandle) for a
    /// handle whose arena was reset or torn down.
    pub fn free(&self, handle: Allocation<B>) -> PoolResult<()> {
        self.memory.validate(&handle)?;
        self.deferred.free(handle);
        Ok(())
    }

    /// Mark a frame boundary and reclaim frees that are old enough.
    ///
    /// Returns the number of ranges returned to their arenas.
    pub fn advance_frame(&self, frame: u64) -> usize {
        profile_scope!("gpu_pool_advance_frame");

        let reclaimed = self
            .deferred
            .advance_frame(frame, |handle| self.memory.free(handle));

        #[cfg(feature = "profiling")]
        {
            crate::profile_plot!("gpu_pool_reserved_bytes", self.memory.reserved_bytes());
            crate::profile_plot!("gpu_pool_pending_bytes", self.deferred.pending_bytes());
        }
        frame_mark!();
        reclaimed
    }

    // ------------------------------------------------------------------
    // Command recording
    // ------------------------------------------------------------------

    /// Get a command list ready for recording on `role`'s queue.
    pub fn acquire_recording_list(&self, role: QueueRole) -> PoolResult<RecordingList<B>> {
        self.recording.acquire(role)
    }

    /// Submit a recorded list. Returns the completion value stamped on it.
    pub fn submit_recording_list(&self, recording: RecordingList<B>) -> PoolResult<u64> {
        self.recording.execute(recording)
    }

    // ------------------------------------------------------------------
    // Completion tokens
    // ------------------------------------------------------------------

    /// Take a completion token from the pool.
    pub fn acquire_completion_token(&self) -> PoolResult<Token<B>> {
        self.tokens.acquire()
    }

    /// Attach a token to new work on `role`'s queue. Returns the new value.
    pub fn signal_completion_token(
        &self,
        token: &mut Token<B>,
        role: QueueRole,
    ) -> PoolResult<u64> {
        self.tokens.signal(token, role)
    }

    /// Whether a token's work has completed (non-blocking).
    pub fn query_completion_token(&self, token: &Token<B>) -> bool {
        self.tokens.query(token)
    }

    /// Block until a token's work completes or `timeout` elapses.
    pub fn wait_completion_token(&self, token: &Token<B>, timeout: Duration) -> PoolResult<bool> {
        self.tokens.wait(token, timeout)
    }

    /// Give a token back. Its work must have completed.
    pub fn release_completion_token(&self, token: Token<B>) -> PoolResult<()> {
        self.tokens.release(token)
    }

    // ------------------------------------------------------------------
    // Lifetime
    // ------------------------------------------------------------------

    /// Block until every queue role has finished its submissions or `timeout` elapses.
    ///
    /// Returns `true` if all roles are idle.
    pub fn wait_idle(&self, timeout: Duration) -> PoolResult<bool> {
        // A deadline past the end of `Instant` means waiting without bound.
        let deadline = Instant::now().checked_add(timeout);
        for role in QueueRole::ALL {
            let remaining = deadline.map_or(timeout, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if !self.recording.wait_idle(role, remaining)? {
                log::debug!(
                    "{}: {} queue not idle after {:?}",
                    self.config.label(),
                    role.name(),
                    timeout
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Release every backend object the pools hold.
    ///
    /// The GPU must be idle (see [`wait_idle`](Self::wait_idle)). Pending frees
    /// are flushed, recording objects and tokens are destroyed, and every arena
    /// is released. Handles issued before teardown become stale; the context
    /// can be used again afterwards.
    pub fn teardown(&self) -> PoolResult<()> {
        let flushed = self
            .deferred
            .flush_all(|handle| self.memory.free(handle));
        self.recording.teardown()?;
        let fences = self.tokens.teardown();
        let arenas = self.memory.teardown();

        log::info!(
            "{}: teardown released {} arenas, {} fences ({} deferred frees flushed)",
            self.config.label(),
            arenas,
            fences,
            flushed
        );
        Ok(())
    }

    /// Snapshot of every pool's counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            current_frame: self.deferred.current_frame(),
            arena_count: self.memory.arena_count(),
            reserved_bytes: self.memory.reserved_bytes(),
            live_allocations: self.memory.live_allocations(),
            free_ranges: self.memory.free_range_count(),
            pending_frees: self.deferred.pending_count(),
            pending_bytes: self.deferred.pending_bytes(),
            tokens_in_use: self.tokens.in_use_count(),
            tokens_available: self.tokens.available_count(),
            roles: QueueRole::ALL.map(|role| self.recording.stats(role)),
        }
    }
}

impl<B: GpuBackend> Drop for RecycleContext<B> {
    fn drop(&mut self) {
        let stats = self.stats();
        if !stats.is_empty() {
            log::warn!(
                "{}: dropped without teardown, leaking backend objects ({})",
                self.config.label(),
                stats
            );
        }
    }
}

impl<B: GpuBackend> std::fmt::Debug for RecycleContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecycleContext")
            .field("label", &self.config.label())
            .field("backend", &self.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(feature = "dummy")]
static_assertions::assert_impl_all!(
    RecycleContext<crate::backend::dummy::DummyBackend>: Send, Sync
);
