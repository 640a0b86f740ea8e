//! Pooled device memory.
//!
//! Memory is handed out as byte ranges of larger backing allocations
//! ([`Arena`]s). Requests are routed by size to a [`SizeClass`](crate::SizeClass),
//! and each class keeps its own list of arenas in a [`SizeClassPool`].
//!
//! Freed ranges are not returned to their arena right away. The
//! [`DeferredReclaimQueue`] holds them for a fixed number of frames so the
//! GPU can finish any work that still references them.
//!
//! ```text
//! allocate(kind, flags, size)
//!   └─ SizeClassTable::route(size) ── class i
//!        └─ arenas of class i, first compatible with room ── Range
//!             └─ none? create a new Arena (backend allocation)
//!
//! free(handle) ── DeferredReclaimQueue (tagged with current frame)
//!   └─ advance_frame(f): age >= N ── Arena::free(range)
//!        └─ every carved range free? reset the arena to offset 0
//! ```

pub mod arena;
pub mod deferred;
pub mod pool;
pub mod size_class;

pub use arena::{Arena, Range};
pub use deferred::{DeferredReclaimQueue, PendingFree};
pub use pool::{AllocationHandle, ArenaId, SizeClassPool};
pub use size_class::SizeClassTable;

/// Align a value up to the given alignment.
///
/// Returns `None` if the aligned value does not fit in a `u64`.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}
