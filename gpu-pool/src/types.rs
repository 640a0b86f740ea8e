//! Resource and queue classification types.

use bitflags::bitflags;

/// Kind of resource a backing allocation will hold.
///
/// Arenas only serve requests of the kind they were created for, since
/// backends place buffers, textures and render targets in different heap tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceKind {
    /// Linear buffer memory (vertex, index, uniform, staging).
    #[default]
    Buffer,
    /// Sampled or storage textures.
    Texture,
    /// Color and depth attachments.
    RenderTarget,
}

bitflags! {
    /// Memory property flags for backing allocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Memory is local to the device.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory can be mapped for CPU access.
        const HOST_VISIBLE = 1 << 1;
        /// CPU writes are visible to the device without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// CPU reads are cached.
        const HOST_CACHED = 1 << 3;
        /// Shaders may write to the memory.
        const SHADER_WRITE = 1 << 4;
    }
}

impl Default for MemoryFlags {
    fn default() -> Self {
        Self::DEVICE_LOCAL
    }
}

impl MemoryFlags {
    /// Flags for per-frame upload memory (CPU writes, GPU reads).
    pub const UPLOAD: Self = Self::HOST_VISIBLE.union(Self::HOST_COHERENT);

    /// Flags for readback memory (GPU writes, CPU reads).
    pub const READBACK: Self = Self::HOST_VISIBLE.union(Self::HOST_CACHED);

    /// Whether allocations with these flags carry a CPU mapping.
    pub fn is_mappable(self) -> bool {
        self.contains(Self::HOST_VISIBLE)
    }
}

/// Queue a recording list is submitted to.
///
/// Each role has its own execution timeline and its own recording pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Graphics queue (draws, also accepts compute and copies).
    Graphics,
    /// Async compute queue.
    Compute,
    /// Copy/transfer queue.
    Transfer,
}

impl QueueRole {
    /// All queue roles, in index order.
    pub const ALL: [QueueRole; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// Dense index of this role.
    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
        }
    }

    /// Human-readable name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        }
    }
}
