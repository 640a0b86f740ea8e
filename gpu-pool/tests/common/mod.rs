//! Common utilities for pool integration tests.
//!
//! Every test drives a [`RecycleContext`] on the dummy backend. The completion
//! mode decides whether the simulated GPU keeps up (`Immediate`) or stays
//! behind until the test retires its work (`Manual`).

use std::sync::Arc;
use std::time::Duration;

use redlilium_gpu_pool::{
    Allocation, CompletionMode, DummyBackend, MemoryFlags, PoolConfig, RecycleContext,
    ResourceKind, SizeClass,
};

/// Capacity of the arena in [`single_arena_config`].
pub const ARENA_SIZE: u64 = 1024;

/// Range granularity of [`single_arena_config`].
pub const GRANULARITY: u64 = 256;

/// Route log output through the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One 1 KiB size class with 256 byte granularity, plus the overflow class.
pub fn single_arena_config() -> PoolConfig {
    PoolConfig::default()
        .with_label("single_arena")
        .with_size_classes(vec![SizeClass::new(ARENA_SIZE, ARENA_SIZE)])
        .with_alignment(GRANULARITY)
}

/// Deterministic xorshift generator for randomized sequences.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform value in `low..=high`.
    pub fn range(&mut self, low: u64, high: u64) -> u64 {
        low + self.next_u64() % (high - low + 1)
    }
}

/// A recycle context on a dummy backend the test can drive directly.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub context: RecycleContext<DummyBackend>,
}

impl TestContext {
    /// Context with the default configuration.
    pub fn new(mode: CompletionMode) -> Self {
        Self::with_config(mode, PoolConfig::default())
    }

    /// Context with a custom configuration.
    pub fn with_config(mode: CompletionMode, config: PoolConfig) -> Self {
        Self::from_backend(DummyBackend::with_mode(mode), config)
    }

    /// Context whose backend refuses to hold more than `budget` bytes.
    #[allow(dead_code)]
    pub fn with_budget(mode: CompletionMode, config: PoolConfig, budget: u64) -> Self {
        Self::from_backend(DummyBackend::with_mode(mode).with_memory_budget(budget), config)
    }

    fn from_backend(backend: DummyBackend, config: PoolConfig) -> Self {
        init_logging();
        let backend = Arc::new(backend);
        let context = RecycleContext::new(Arc::clone(&backend), config)
            .expect("test configuration should be valid");
        Self { backend, context }
    }

    /// Allocate a device-local buffer range.
    pub fn alloc(&self, size: u64) -> Allocation<DummyBackend> {
        self.context
            .allocate(ResourceKind::Buffer, MemoryFlags::DEVICE_LOCAL, size)
            .expect("allocation should succeed")
    }

    /// Advance frame by frame up to and including `frame`.
    ///
    /// Returns the total number of ranges reclaimed.
    #[allow(dead_code)]
    pub fn advance_to(&self, frame: u64) -> usize {
        let start = self.context.current_frame() + 1;
        (start..=frame)
            .map(|f| self.context.advance_frame(f))
            .sum()
    }

    /// Retire outstanding GPU work, tear down, and check nothing leaked.
    pub fn finish(self) {
        self.backend.retire_all();
        assert!(self.context.wait_idle(Duration::from_secs(1)).unwrap());
        self.context.teardown().unwrap();

        let counters = self.backend.counters();
        assert_eq!(counters.live_allocations, 0, "backing allocations leaked");
        assert_eq!(counters.live_fences, 0, "fences leaked");
        assert_eq!(counters.live_allocators, 0, "command allocators leaked");
        assert_eq!(counters.live_lists, 0, "command lists leaked");
        assert_eq!(self.backend.allocated_bytes(), 0);
    }
}
