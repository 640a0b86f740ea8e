//! # RedLilium GPU Pool
//!
//! Recycling of GPU memory and command recording objects for a frame-pipelined
//! renderer, where the CPU runs several frames ahead of the GPU.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`RecycleContext`] - All pools of one device behind a single object
//! - [`SizeClassPool`] - Sub-allocation from large arenas, routed by size class
//! - [`DeferredReclaimQueue`] - Holds freed ranges until the GPU can no longer read them
//! - [`CompletionTokenPool`] - Recycled fences paired with completion values
//! - [`RecordingObjectPool`] - Recycled command allocators and command lists per queue role
//! - [`GpuBackend`] - Trait the pools allocate through, with a [`DummyBackend`] for testing
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use redlilium_gpu_pool::{DummyBackend, MemoryFlags, PoolConfig, RecycleContext, ResourceKind};
//!
//! let context = RecycleContext::new(Arc::new(DummyBackend::new()), PoolConfig::default())?;
//! let staging = context.allocate(ResourceKind::Buffer, MemoryFlags::UPLOAD, 4096)?;
//! context.free(staging)?;
//! context.advance_frame(1);
//! context.teardown()?;
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod profiling;
pub mod stats;
pub mod sync;
pub mod types;

// Re-export main types for convenience
#[cfg(feature = "dummy")]
pub use backend::dummy::{CompletionMode, DummyBackend};
pub use backend::{BackingAllocation, GpuBackend, MappedPtr};
pub use command::{RecordingList, RecordingObjectPool, RoleStats};
pub use config::{DEFAULT_ALIGNMENT, MAX_FRAMES_IN_FLIGHT, PoolConfig, SizeClass};
pub use context::{Allocation, RecycleContext, Token};
pub use error::{PoolError, PoolResult};
pub use memory::{AllocationHandle, ArenaId, DeferredReclaimQueue, Range, SizeClassPool};
pub use stats::PoolStats;
pub use sync::{CompletionToken, CompletionTokenPool};
pub use types::{MemoryFlags, QueueRole, ResourceKind};

/// GPU pool library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the GPU pool subsystem.
///
/// Only logs the version; contexts are created explicitly.
pub fn init() {
    log::info!("RedLilium GPU Pool v{} initialized", VERSION);
}
