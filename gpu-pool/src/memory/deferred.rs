//! Frame-deferred reclaim of pooled memory.
//!
//! GPU commands are executed asynchronously - when you submit work to the GPU,
//! the CPU continues while the GPU processes commands a few frames behind.
//! A range freed by the CPU may still be read by a frame the GPU has not
//! finished, so it cannot go back on its arena's free list right away.
//!
//! [`DeferredReclaimQueue`] holds freed ranges until `frame_latency` frames
//! have passed, after which the GPU can no longer reference them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                  DeferredReclaimQueue                     │
//! │   FIFO of (frame freed, handle), oldest at the front      │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐       │
//! │  │ F=10  a │  │ F=10  b │  │ F=11  c │  │ F=12  d │  ...  │
//! │  └─────────┘  └─────────┘  └─────────┘  └─────────┘       │
//! └───────────────────────────────────────────────────────────┘
//!
//! On free(handle):
//!   1. Don't touch the arena
//!   2. Push (current frame, handle)
//!
//! On advance(frame):
//!   1. Pop every front entry with frame - freed_at >= N
//!   2. Hand each popped handle back to its arena, in FIFO order
//! ```
//!
//! No fence is waited on here. The frame latency is a fixed bound on how far
//! the GPU may lag, which command recording objects cannot rely on; those use
//! completion fences instead (see [`RecordingObjectPool`](crate::RecordingObjectPool)).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::pool::AllocationHandle;

/// A freed handle waiting out the frame latency.
#[derive(Debug)]
pub struct PendingFree<M> {
    /// Frame number at which the handle was freed.
    pub frame: u64,
    /// The freed handle.
    pub handle: AllocationHandle<M>,
}

/// Holds freed ranges until the GPU can no longer reference them.
pub struct DeferredReclaimQueue<M> {
    frame_latency: u64,
    /// Last frame number passed to [`advance_frame`](Self::advance_frame).
    current_frame: AtomicU64,
    pending: Mutex<VecDeque<PendingFree<M>>>,
}

impl<M> std::fmt::Debug for DeferredReclaimQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReclaimQueue")
            .field("frame_latency", &self.frame_latency)
            .field("current_frame", &self.current_frame.load(Ordering::Relaxed))
            .field("pending_count", &self.pending.lock().len())
            .finish()
    }
}

impl<M> DeferredReclaimQueue<M> {
    /// Create a queue that holds ranges for `frame_latency` frames.
    pub fn new(frame_latency: u64) -> Self {
        debug_assert!(frame_latency > 0);
        Self {
            frame_latency,
            current_frame: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of frames a range is held.
    pub fn frame_latency(&self) -> u64 {
        self.frame_latency
    }

    /// Current frame number.
    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Queue a handle, tagged with the current frame.
    pub fn free(&self, handle: AllocationHandle<M>) {
        let mut pending = self.pending.lock();
        let frame = self.current_frame();
        log::trace!(
            "deferring free of {} bytes at {} (frame {})",
            handle.size(),
            handle.offset(),
            frame
        );
        pending.push_back(PendingFree { frame, handle });
    }

    /// Move to `frame` and reclaim every handle old enough to be safe.
    ///
    /// `reclaim` receives each eligible handle in the order it was freed.
    /// Returns the number of handles reclaimed.
    ///
    /// Frame numbers must not go backwards; a smaller `frame` is ignored with
    /// a warning and nothing is reclaimed.
    pub fn advance_frame(&self, frame: u64, mut reclaim: impl FnMut(AllocationHandle<M>)) -> usize {
        let ready: Vec<_> = {
            let mut pending = self.pending.lock();
            let previous = self.current_frame.load(Ordering::Acquire);
            if frame < previous {
                log::warn!(
                    "advance_frame({}) called after frame {}, ignoring",
                    frame,
                    previous
                );
                return 0;
            }
            self.current_frame.store(frame, Ordering::Release);

            let count = pending
                .iter()
                .take_while(|entry| frame - entry.frame >= self.frame_latency)
                .count();
            pending.drain(..count).collect()
        };

        let count = ready.len();
        for entry in ready {
            reclaim(entry.handle);
        }

        if count > 0 {
            log::trace!("frame {}: reclaimed {} deferred frees", frame, count);
        }
        count
    }

    /// Reclaim every pending handle regardless of its age.
    ///
    /// Should only be called during shutdown, when the GPU is idle.
    pub fn flush_all(&self, mut reclaim: impl FnMut(AllocationHandle<M>)) -> usize {
        let all: Vec<_> = self.pending.lock().drain(..).collect();
        let count = all.len();
        for entry in all {
            reclaim(entry.handle);
        }
        count
    }

    /// Number of handles waiting to be reclaimed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Bytes held by handles waiting to be reclaimed.
    pub fn pending_bytes(&self) -> u64 {
        self.pending
            .lock()
            .iter()
            .map(|entry| entry.handle.size())
            .sum()
    }
}
