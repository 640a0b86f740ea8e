//! Recyclable completion tokens.
//!
//! A [`CompletionToken`] pairs a backend fence with the value that marks its
//! attached work as done. Fences are expensive to create, so the
//! [`CompletionTokenPool`] keeps returned tokens and hands them out again.
//!
//! # Token states
//!
//! ```text
//!            acquire()                 signal(role)
//! available ───────────▶ in use ──────────────────▶ in use (value = v)
//!     ▲                                                    │
//!     └──────────────── release() ◀── query()/wait() ok ───┘
//! ```
//!
//! The pool does not check completion on [`release`](CompletionTokenPool::release).
//! Releasing a token whose work is still running lets the next holder observe
//! it as complete too early; callers must query or wait first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::GpuBackend;
use crate::error::{PoolError, PoolResult};
use crate::types::QueueRole;

/// A fence plus the value that marks its attached work as complete.
///
/// Tokens are lent out by a [`CompletionTokenPool`] and must be given back
/// with [`CompletionTokenPool::release`].
#[derive(Debug)]
pub struct CompletionToken<F> {
    id: u64,
    fence: F,
    value: u64,
}

impl<F> CompletionToken<F> {
    /// Pool-unique token id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The backend fence.
    pub fn fence(&self) -> &F {
        &self.fence
    }

    /// Fence value that marks the attached work as complete.
    pub fn value(&self) -> u64 {
        self.value
    }
}

#[derive(Debug)]
struct TokenState<F> {
    available: Vec<CompletionToken<F>>,
    /// Fences of tokens currently lent out, by token id.
    in_use: HashMap<u64, F>,
    next_id: u64,
}

/// Thread-safe pool of completion tokens.
///
/// Bookkeeping (acquire, release, teardown) is serialized by a lock. Querying
/// and waiting only touch the backend fence and never take the lock.
pub struct CompletionTokenPool<B: GpuBackend> {
    backend: Arc<B>,
    state: Mutex<TokenState<B::Fence>>,
}

impl<B: GpuBackend> CompletionTokenPool<B> {
    /// Create an empty token pool.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            state: Mutex::new(TokenState {
                available: Vec::new(),
                in_use: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Take a token, creating one if none is available.
    ///
    /// A freshly created token is already satisfied, so waiting on it before
    /// any work is attached returns immediately.
    pub fn acquire(&self) -> PoolResult<CompletionToken<B::Fence>> {
        let mut state = self.state.lock();

        if let Some(token) = state.available.pop() {
            state.in_use.insert(token.id, token.fence.clone());
            log::trace!("reusing completion token {}", token.id);
            return Ok(token);
        }

        let fence = self.backend.create_fence(true)?;
        let value = self.backend.completed_value(&fence);
        let id = state.next_id;
        state.next_id += 1;
        state.in_use.insert(id, fence.clone());

        log::debug!(
            "created completion token {} ({} tokens tracked)",
            id,
            state.in_use.len() + state.available.len()
        );
        Ok(CompletionToken { id, fence, value })
    }

    /// Give a token back to the pool.
    ///
    /// Does not check that the token's work has completed.
    ///
    /// Returns [`PoolError::StaleHandle`] for a token this pool is not
    /// tracking as in use, e.g. one issued before [`teardown`](Self::teardown).
    pub fn release(&self, token: CompletionToken<B::Fence>) -> PoolResult<()> {
        let mut state = self.state.lock();
        if state.in_use.remove(&token.id).is_none() {
            return Err(PoolError::StaleHandle(format!(
                "completion token {} is not in use",
                token.id
            )));
        }
        log::trace!("released completion token {}", token.id);
        state.available.push(token);
        Ok(())
    }

    /// Attach the token to the next value of its fence, signaled on `role`'s queue.
    ///
    /// Returns the new completion value.
    pub fn signal(
        &self,
        token: &mut CompletionToken<B::Fence>,
        role: QueueRole,
    ) -> PoolResult<u64> {
        let value = token.value.max(self.backend.completed_value(&token.fence)) + 1;
        self.backend.signal(role, &token.fence, value)?;
        token.value = value;
        Ok(value)
    }

    /// Whether the token's work has completed (non-blocking).
    pub fn query(&self, token: &CompletionToken<B::Fence>) -> bool {
        self.backend.completed_value(&token.fence) >= token.value
    }

    /// Block until the token's work completes or `timeout` elapses.
    ///
    /// Returns `true` if the work completed.
    pub fn wait(&self, token: &CompletionToken<B::Fence>, timeout: Duration) -> PoolResult<bool> {
        self.backend.wait(&token.fence, token.value, timeout)
    }

    /// Destroy every tracked token, in use or available.
    ///
    /// No outstanding GPU work may reference any of them. Tokens still held by
    /// callers become stale. Returns the number of fences destroyed.
    pub fn teardown(&self) -> usize {
        let (available, in_use) = {
            let mut state = self.state.lock();
            let available: Vec<_> = state.available.drain(..).collect();
            let in_use: Vec<_> = state.in_use.drain().map(|(_, fence)| fence).collect();
            (available, in_use)
        };

        if !in_use.is_empty() {
            log::warn!("destroying {} completion tokens still in use", in_use.len());
        }

        let count = available.len() + in_use.len();
        for token in available {
            self.backend.destroy_fence(token.fence);
        }
        for fence in in_use {
            self.backend.destroy_fence(fence);
        }
        count
    }

    /// Number of tokens lent out.
    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Number of tokens ready to be handed out.
    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }
}

impl<B: GpuBackend> std::fmt::Debug for CompletionTokenPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionTokenPool")
            .field("in_use", &state.in_use.len())
            .field("available", &state.available.len())
            .finish()
    }
}
