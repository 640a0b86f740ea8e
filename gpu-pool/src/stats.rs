//! Diagnostics snapshot of a recycle context.

use std::fmt;

use crate::command::RoleStats;
use crate::types::QueueRole;

/// Point-in-time counters of every pool in a [`RecycleContext`](crate::RecycleContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Frame number of the last `advance_frame`.
    pub current_frame: u64,
    /// Arenas held by the memory pool.
    pub arena_count: usize,
    /// Bytes of backing memory held by the memory pool.
    pub reserved_bytes: u64,
    /// Ranges handed out, including ones waiting in the deferred queue.
    pub live_allocations: usize,
    /// Ranges waiting on arena free lists.
    pub free_ranges: usize,
    /// Frees waiting out the frame latency.
    pub pending_frees: usize,
    /// Bytes held by frees waiting out the frame latency.
    pub pending_bytes: u64,
    /// Completion tokens lent out (including per-role timelines).
    pub tokens_in_use: usize,
    /// Completion tokens ready for reuse.
    pub tokens_available: usize,
    /// Recording state per queue role, indexed by [`QueueRole::index`].
    pub roles: [RoleStats; 3],
}

impl PoolStats {
    /// Recording state of `role`.
    pub fn role(&self, role: QueueRole) -> &RoleStats {
        &self.roles[role.index()]
    }

    /// Whether the context holds no backend objects at all.
    pub fn is_empty(&self) -> bool {
        self.arena_count == 0
            && self.pending_frees == 0
            && self.tokens_in_use == 0
            && self.tokens_available == 0
            && self
                .roles
                .iter()
                .all(|role| {
                    role.pending_allocators == 0
                        && role.parked_allocators == 0
                        && role.idle_lists == 0
                })
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {}: {} arenas ({} bytes), {} live ranges, {} free ranges, \
             {} pending frees ({} bytes), tokens {}/{} in use",
            self.current_frame,
            self.arena_count,
            self.reserved_bytes,
            self.live_allocations,
            self.free_ranges,
            self.pending_frees,
            self.pending_bytes,
            self.tokens_in_use,
            self.tokens_in_use + self.tokens_available
        )?;
        for role in QueueRole::ALL {
            let stats = self.role(role);
            write!(
                f,
                ", {} {}/{} ({} pending, {} idle lists)",
                role.name(),
                stats.completed,
                stats.last_submitted,
                stats.pending_allocators,
                stats.idle_lists
            )?;
        }
        Ok(())
    }
}
