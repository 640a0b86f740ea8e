//! Pool configuration.
//!
//! A [`PoolConfig`] describes the size classes the memory pool routes requests
//! through, the alignment every range is rounded to, and the number of frames
//! the execution timeline may lag behind submission.
//!
//! # Example
//!
//! ```
//! use redlilium_gpu_pool::{PoolConfig, SizeClass};
//!
//! let config = PoolConfig::default()
//!     .with_size_classes(vec![
//!         SizeClass::new(256, 64 * 1024),
//!         SizeClass::new(64 * 1024, 4 * 1024 * 1024),
//!         SizeClass::overflow(),
//!     ])
//!     .with_alignment(256)
//!     .with_frame_latency(2)
//!     .with_label("upload");
//!
//! assert!(config.validated().is_ok());
//! ```

use crate::error::{PoolError, PoolResult};

/// Maximum number of frames the GPU may lag behind the CPU.
///
/// Freed ranges are held for this many frames before returning to their arena.
pub const MAX_FRAMES_IN_FLIGHT: u64 = 3;

/// Default alignment for ranges (256 bytes).
///
/// This matches the typical minimum uniform buffer offset alignment
/// required by most GPUs.
pub const DEFAULT_ALIGNMENT: u64 = 256;

/// A size bucket of the memory pool.
///
/// Requests are routed to the first class whose `threshold` is at least the
/// aligned request size. New arenas of a bounded class are created with the
/// class's fixed `arena_size`; the overflow class creates arenas sized exactly
/// to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    /// Largest aligned request served by this class.
    pub threshold: u64,
    /// Capacity of arenas created for this class. `None` for the overflow class.
    pub arena_size: Option<u64>,
}

impl SizeClass {
    /// Create a bounded size class.
    pub fn new(threshold: u64, arena_size: u64) -> Self {
        Self {
            threshold,
            arena_size: Some(arena_size),
        }
    }

    /// Create the overflow class, which serves any request with a dedicated arena.
    pub fn overflow() -> Self {
        Self {
            threshold: u64::MAX,
            arena_size: None,
        }
    }

    /// Whether this is the overflow class.
    pub fn is_overflow(&self) -> bool {
        self.arena_size.is_none()
    }

    /// Capacity of a new arena serving a request of `aligned_size` bytes.
    pub fn arena_capacity(&self, aligned_size: u64) -> u64 {
        self.arena_size.unwrap_or(aligned_size)
    }
}

/// Configuration for a [`RecycleContext`](crate::RecycleContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Debug label used in log messages.
    pub label: Option<String>,
    /// Size classes in ascending threshold order.
    pub size_classes: Vec<SizeClass>,
    /// Alignment of every range handed out. Must be a power of two.
    pub alignment: u64,
    /// Frames a freed range waits before it may be reused.
    pub frame_latency: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            label: None,
            size_classes: vec![
                SizeClass::new(4 * 1024, 256 * 1024),
                SizeClass::new(64 * 1024, 4 * 1024 * 1024),
                SizeClass::new(1024 * 1024, 16 * 1024 * 1024),
                SizeClass::overflow(),
            ],
            alignment: DEFAULT_ALIGNMENT,
            frame_latency: MAX_FRAMES_IN_FLIGHT,
        }
    }
}

impl PoolConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Replace the size classes.
    pub fn with_size_classes(mut self, size_classes: Vec<SizeClass>) -> Self {
        self.size_classes = size_classes;
        self
    }

    /// Set the range alignment.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the number of frames the execution timeline may lag.
    pub fn with_frame_latency(mut self, frame_latency: u64) -> Self {
        self.frame_latency = frame_latency;
        self
    }

    /// Label for log messages.
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("gpu_pool")
    }

    /// Validate the configuration, appending an overflow class if missing.
    pub fn validated(mut self) -> PoolResult<Self> {
        if !self.alignment.is_power_of_two() {
            return Err(PoolError::InvalidParameter(format!(
                "alignment must be a power of 2, got {}",
                self.alignment
            )));
        }

        if self.frame_latency == 0 {
            return Err(PoolError::InvalidParameter(
                "frame latency cannot be zero".to_string(),
            ));
        }

        if self.size_classes.is_empty() {
            return Err(PoolError::InvalidParameter(
                "at least one size class is required".to_string(),
            ));
        }

        let last = self.size_classes.len() - 1;
        for (i, class) in self.size_classes.iter().enumerate() {
            if class.is_overflow() {
                if i != last {
                    return Err(PoolError::InvalidParameter(format!(
                        "overflow class must be last, found at position {i}"
                    )));
                }
                continue;
            }

            if class.threshold == 0 {
                return Err(PoolError::InvalidParameter(format!(
                    "size class {i} has a zero threshold"
                )));
            }

            if class.arena_capacity(0) < class.threshold {
                return Err(PoolError::InvalidParameter(format!(
                    "size class {i} arena ({} bytes) is smaller than its threshold ({} bytes)",
                    class.arena_capacity(0),
                    class.threshold
                )));
            }

            if i > 0 && self.size_classes[i - 1].threshold >= class.threshold {
                return Err(PoolError::InvalidParameter(format!(
                    "size class thresholds must be ascending, class {i} ({}) follows {}",
                    class.threshold,
                    self.size_classes[i - 1].threshold
                )));
            }
        }

        if !self.size_classes[last].is_overflow() {
            self.size_classes.push(SizeClass::overflow());
        }

        Ok(self)
    }
}
