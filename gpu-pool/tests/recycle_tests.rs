//! Integration tests for the recycle context.
//!
//! These tests drive the whole caller surface (allocate, free, advance frame,
//! recording lists, completion tokens, teardown) against the dummy backend.
//! Tests are parameterized using `rstest` over completion modes, queue roles,
//! latencies and free orders.
//!
//! # Test Categories
//!
//! - **Memory Tests**: range disjointness, full-drain reset, first-fit reuse
//! - **Deferral Tests**: frame-latency visibility of freed ranges
//! - **Synchronization Tests**: completion tokens and recording object reuse
//! - **Lifetime Tests**: stale handles, device loss, concurrent use
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test recycle_tests
//! ```

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rstest::rstest;

use common::{ARENA_SIZE, GRANULARITY, TestContext, XorShift, single_arena_config};
use redlilium_gpu_pool::{
    Allocation, CompletionMode, DummyBackend, MemoryFlags, PoolConfig, PoolError, QueueRole,
    Range, ResourceKind, SizeClass,
};

// ============================================================================
// Memory Tests
// ============================================================================

/// Randomized allocate/free/advance sequences never hand out a range that
/// overlaps one still held by the caller or still waiting out its latency.
#[rstest]
#[case::seed_a(1)]
#[case::seed_b(42)]
#[case::seed_c(0x9e37_79b9_7f4a_7c15)]
fn test_live_ranges_never_overlap(#[case] seed: u64) {
    let config = PoolConfig::default()
        .with_size_classes(vec![SizeClass::new(4096, 16 * 1024)])
        .with_frame_latency(2);
    let ctx = TestContext::with_config(CompletionMode::Immediate, config);
    let latency = ctx.context.config().frame_latency;

    let mut rng = XorShift::new(seed);
    let mut live: Vec<Allocation<DummyBackend>> = Vec::new();
    // Freed but not yet reclaimed: (arena index, range, frame freed).
    let mut in_flight: Vec<(u32, Range, u64)> = Vec::new();

    for step in 0..2000 {
        match rng.range(0, 9) {
            0..=4 => {
                let handle = ctx.alloc(rng.range(1, 6000));
                let index = handle.arena().index;
                let range = handle.range();

                let clash = live
                    .iter()
                    .map(|held| (held.arena().index, held.range()))
                    .chain(in_flight.iter().map(|&(i, r, _)| (i, r)))
                    .any(|(i, r)| i == index && r.overlaps(&range));
                assert!(
                    !clash,
                    "step {step}: {range:?} in arena {index} overlaps an outstanding range"
                );
                live.push(handle);
            }
            5..=8 if !live.is_empty() => {
                let victim = live.swap_remove(rng.range(0, live.len() as u64 - 1) as usize);
                in_flight.push((
                    victim.arena().index,
                    victim.range(),
                    ctx.context.current_frame(),
                ));
                ctx.context.free(victim).unwrap();
            }
            _ => {
                let frame = ctx.context.current_frame() + 1;
                ctx.context.advance_frame(frame);
                in_flight.retain(|&(_, _, freed)| frame - freed < latency);
            }
        }
    }

    for handle in live {
        ctx.context.free(handle).unwrap();
    }
    ctx.finish();
}

/// Once every range carved from an arena is back, the next allocation starts
/// at offset zero in a new generation of the same arena.
#[rstest]
#[case::in_order(false)]
#[case::reversed(true)]
fn test_drained_arena_restarts_at_offset_zero(#[case] reversed: bool) {
    let ctx = TestContext::with_config(CompletionMode::Immediate, single_arena_config());

    let first = ctx.alloc(300);
    let second = ctx.alloc(200);
    assert_eq!(first.offset(), 0);
    assert_eq!(second.offset(), 2 * GRANULARITY);
    let arena = first.arena();

    if reversed {
        ctx.context.free(second).unwrap();
        ctx.context.free(first).unwrap();
    } else {
        ctx.context.free(first).unwrap();
        ctx.context.free(second).unwrap();
    }
    ctx.advance_to(ctx.context.config().frame_latency);

    let next = ctx.alloc(100);
    assert_eq!(next.offset(), 0);
    assert_eq!(next.arena().index, arena.index);
    assert_ne!(next.arena().generation, arena.generation);
    assert_eq!(ctx.context.stats().arena_count, 1);

    ctx.context.free(next).unwrap();
    ctx.finish();
}

/// A reused free range is granted whole, never split.
#[test]
fn test_first_fit_granted_whole() {
    let ctx = TestContext::with_config(CompletionMode::Immediate, single_arena_config());

    let large = ctx.alloc(2 * GRANULARITY);
    let keep = ctx.alloc(GRANULARITY);
    ctx.context.free(large).unwrap();
    ctx.advance_to(ctx.context.config().frame_latency);
    assert_eq!(ctx.context.stats().free_ranges, 1);

    let small = ctx.alloc(100);
    assert_eq!(small.offset(), 0);
    assert_eq!(small.size(), 2 * GRANULARITY);
    assert_eq!(small.requested_size(), 100);

    // The remainder was not returned to the free list, so the next request bumps.
    let bumped = ctx.alloc(100);
    assert_eq!(bumped.offset(), 3 * GRANULARITY);
    assert_eq!(ctx.context.stats().free_ranges, 0);

    for handle in [small, keep, bumped] {
        ctx.context.free(handle).unwrap();
    }
    ctx.finish();
}

/// Three small ranges freed in any order give the whole arena back: a 900
/// byte request then fits in the same arena even though the backend has no
/// room for a second one.
#[rstest]
#[case::in_order([0, 1, 2])]
#[case::reversed([2, 1, 0])]
#[case::middle_first([1, 0, 2])]
fn test_full_drain_reclaims_whole_arena(#[case] order: [usize; 3]) {
    let ctx =
        TestContext::with_budget(CompletionMode::Immediate, single_arena_config(), ARENA_SIZE);

    let mut handles: Vec<_> = [100, 150, 50]
        .into_iter()
        .map(|size| Some(ctx.alloc(size)))
        .collect();
    let offsets: HashSet<_> = handles.iter().flatten().map(|h| h.offset()).collect();
    assert_eq!(offsets.len(), 3);

    // 768 bytes are carved; 900 more cannot fit and no second arena fits the budget.
    let refused = ctx
        .context
        .allocate(ResourceKind::Buffer, MemoryFlags::DEVICE_LOCAL, 900);
    assert!(matches!(refused, Err(PoolError::OutOfMemory)));

    for index in order {
        let handle = handles[index].take().unwrap();
        ctx.context.free(handle).unwrap();
    }
    ctx.advance_to(ctx.context.config().frame_latency);

    let whole = ctx.alloc(900);
    assert_eq!(whole.offset(), 0);
    assert_eq!(whole.size(), ARENA_SIZE);
    assert_eq!(ctx.context.stats().arena_count, 1);

    ctx.context.free(whole).unwrap();
    ctx.finish();
}

/// Arenas are never shared between resource kinds or memory flags.
#[test]
fn test_kinds_and_flags_use_separate_arenas() {
    let ctx = TestContext::new(CompletionMode::Immediate);

    let buffer = ctx.alloc(1024);
    let texture = ctx
        .context
        .allocate(ResourceKind::Texture, MemoryFlags::DEVICE_LOCAL, 1024)
        .unwrap();
    let upload = ctx
        .context
        .allocate(ResourceKind::Buffer, MemoryFlags::UPLOAD, 1024)
        .unwrap();

    assert_ne!(buffer.arena().index, texture.arena().index);
    assert_ne!(buffer.arena().index, upload.arena().index);
    assert!(buffer.mapped_ptr().is_none());
    assert!(upload.mapped_ptr().is_some());
    assert_eq!(ctx.context.stats().arena_count, 3);

    for handle in [buffer, texture, upload] {
        ctx.context.free(handle).unwrap();
    }
    ctx.finish();
}

/// Host-visible ranges can be written through their mapped pointer.
#[test]
fn test_upload_range_is_writable() {
    let ctx = TestContext::new(CompletionMode::Immediate);

    let mut first = ctx
        .context
        .allocate(ResourceKind::Buffer, MemoryFlags::UPLOAD, 64)
        .unwrap();
    let mut second = ctx
        .context
        .allocate(ResourceKind::Buffer, MemoryFlags::UPLOAD, 64)
        .unwrap();

    // SAFETY: the dummy GPU never reads these ranges and the pool is alive.
    unsafe {
        first.mapped_slice_mut().unwrap().fill(0xAA);
        second.mapped_slice_mut().unwrap().fill(0x55);
        assert!(first.mapped_slice_mut().unwrap().iter().all(|&b| b == 0xAA));
    }

    ctx.context.free(first).unwrap();
    ctx.context.free(second).unwrap();
    ctx.finish();
}

#[test]
fn test_zero_size_rejected() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let result = ctx
        .context
        .allocate(ResourceKind::Buffer, MemoryFlags::DEVICE_LOCAL, 0);
    assert!(matches!(result, Err(PoolError::InvalidParameter(_))));
    assert_eq!(ctx.context.stats().arena_count, 0);
    ctx.finish();
}

// ============================================================================
// Deferral Tests
// ============================================================================

/// A range freed at frame F stays out of the free list through frame
/// F + N - 1 and is back after frame F + N.
#[rstest]
#[case::latency_1(1)]
#[case::latency_2(2)]
#[case::latency_3(3)]
fn test_freed_range_reusable_after_latency(#[case] latency: u64) {
    let config = single_arena_config().with_frame_latency(latency);
    let ctx = TestContext::with_config(CompletionMode::Immediate, config);

    let freed_at = 5;
    ctx.advance_to(freed_at);

    // Keeps the arena from draining, so the freed range lands on the free list.
    let keep = ctx.alloc(GRANULARITY);
    let freed = ctx.alloc(GRANULARITY);
    ctx.context.free(freed).unwrap();

    ctx.advance_to(freed_at + latency - 1);
    let stats = ctx.context.stats();
    assert_eq!(stats.free_ranges, 0);
    assert_eq!(stats.pending_frees, 1);
    assert_eq!(stats.pending_bytes, GRANULARITY);

    ctx.advance_to(freed_at + latency);
    let stats = ctx.context.stats();
    assert_eq!(stats.free_ranges, 1);
    assert_eq!(stats.pending_frees, 0);

    ctx.context.free(keep).unwrap();
    ctx.finish();
}

/// A frame number that goes backwards is ignored.
#[test]
fn test_frame_regression_ignored() {
    let ctx = TestContext::with_config(CompletionMode::Immediate, single_arena_config());
    let keep = ctx.alloc(GRANULARITY);

    ctx.advance_to(10);
    let freed = ctx.alloc(GRANULARITY);
    ctx.context.free(freed).unwrap();

    assert_eq!(ctx.context.advance_frame(4), 0);
    assert_eq!(ctx.context.current_frame(), 10);
    assert_eq!(ctx.context.stats().pending_frees, 1);

    ctx.context.free(keep).unwrap();
    ctx.finish();
}

// ============================================================================
// Synchronization Tests
// ============================================================================

/// A token that was never signaled never blocks.
#[rstest]
#[case::immediate(CompletionMode::Immediate)]
#[case::manual(CompletionMode::Manual)]
fn test_first_token_is_satisfied(#[case] mode: CompletionMode) {
    let ctx = TestContext::new(mode);

    let token = ctx.context.acquire_completion_token().unwrap();
    assert!(ctx.context.query_completion_token(&token));
    assert!(
        ctx.context
            .wait_completion_token(&token, Duration::ZERO)
            .unwrap()
    );
    ctx.context.release_completion_token(token).unwrap();
    ctx.finish();
}

/// Waiting on a token returns once another thread retires the work.
#[test]
fn test_token_wait_across_threads() {
    let ctx = TestContext::new(CompletionMode::Manual);

    let mut token = ctx.context.acquire_completion_token().unwrap();
    ctx.context
        .signal_completion_token(&mut token, QueueRole::Transfer)
        .unwrap();
    assert!(!ctx.context.query_completion_token(&token));

    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(10));
            ctx.backend.retire_all();
        });
        assert!(
            ctx.context
                .wait_completion_token(&token, Duration::from_secs(5))
                .unwrap()
        );
    });

    ctx.context.release_completion_token(token).unwrap();
    let again = ctx.context.acquire_completion_token().unwrap();
    assert!(ctx.context.query_completion_token(&again));
    assert_eq!(ctx.backend.counters().fences_created, 1);
    ctx.context.release_completion_token(again).unwrap();
    ctx.finish();
}

/// With a GPU that never catches up, every acquire still succeeds with a
/// fresh allocator, and none is reset while its submission is running.
#[rstest]
#[case::graphics(QueueRole::Graphics)]
#[case::compute(QueueRole::Compute)]
#[case::transfer(QueueRole::Transfer)]
fn test_backpressure_never_reuses_in_flight_allocator(#[case] role: QueueRole) {
    let ctx = TestContext::new(CompletionMode::Manual);
    let mut seen = HashSet::new();

    for frame in 1..=8 {
        let mut recording = ctx.context.acquire_recording_list(role).unwrap();
        assert!(
            seen.insert(recording.allocator().id()),
            "frame {frame}: allocator reused while in flight"
        );
        recording.list_mut().record(format!("frame {frame}"));
        ctx.context.submit_recording_list(recording).unwrap();
        ctx.context.advance_frame(frame);
    }

    let stats = ctx.context.stats();
    assert_eq!(stats.role(role).pending_allocators, 8);
    assert_eq!(stats.role(role).idle_lists, 1);
    assert_eq!(ctx.backend.counters().lists_created, 1);

    // Completing the oldest submission frees exactly that allocator.
    assert!(ctx.backend.retire_oldest(role));
    let recording = ctx.context.acquire_recording_list(role).unwrap();
    assert!(seen.contains(&recording.allocator().id()));
    assert_eq!(recording.allocator().reset_count(), 1);
    assert!(recording.list().commands().is_empty());
    ctx.context.submit_recording_list(recording).unwrap();

    ctx.finish();
}

/// Submissions on one role never hold back another.
#[test]
fn test_roles_recycle_independently() {
    let ctx = TestContext::new(CompletionMode::Manual);

    let graphics = ctx.context.acquire_recording_list(QueueRole::Graphics).unwrap();
    let graphics_value = ctx.context.submit_recording_list(graphics).unwrap();
    let compute = ctx.context.acquire_recording_list(QueueRole::Compute).unwrap();
    ctx.context.submit_recording_list(compute).unwrap();

    assert!(ctx.backend.retire_oldest(QueueRole::Compute));
    let stats = ctx.context.stats();
    assert_eq!(stats.role(QueueRole::Graphics).last_submitted, graphics_value);
    assert!(stats.role(QueueRole::Graphics).completed < graphics_value);
    assert_eq!(
        stats.role(QueueRole::Compute).completed,
        stats.role(QueueRole::Compute).last_submitted
    );

    assert!(!ctx.context.wait_idle(Duration::from_millis(1)).unwrap());
    ctx.finish();
}

// ============================================================================
// Lifetime Tests
// ============================================================================

/// Handles issued before teardown are refused afterwards, and the context
/// keeps working.
#[test]
fn test_handles_stale_after_teardown() {
    let ctx = TestContext::new(CompletionMode::Immediate);

    let handle = ctx.alloc(512);
    let token = ctx.context.acquire_completion_token().unwrap();
    ctx.context.teardown().unwrap();

    assert!(matches!(ctx.context.free(handle), Err(PoolError::StaleHandle(_))));
    assert!(matches!(
        ctx.context.release_completion_token(token),
        Err(PoolError::StaleHandle(_))
    ));

    let fresh = ctx.alloc(512);
    ctx.context.free(fresh).unwrap();
    ctx.finish();
}

/// A handle from one context is refused by another, even when both carved
/// the same range from the same arena slot.
#[test]
fn test_handle_refused_by_other_context() {
    let a = TestContext::with_config(CompletionMode::Immediate, single_arena_config());
    let b = TestContext::with_config(CompletionMode::Immediate, single_arena_config());

    let from_a = a.alloc(GRANULARITY);
    let from_b = b.alloc(GRANULARITY);
    assert_eq!(from_a.arena().index, from_b.arena().index);
    assert_eq!(from_a.arena().generation, from_b.arena().generation);
    assert_eq!(from_a.range(), from_b.range());
    assert_ne!(from_a.arena(), from_b.arena());

    assert!(matches!(b.context.free(from_a), Err(PoolError::StaleHandle(_))));
    assert_eq!(b.context.stats().pending_frees, 0);

    // B's own range is still live and frees normally.
    b.context.free(from_b).unwrap();
    assert_eq!(b.context.stats().pending_frees, 1);

    a.finish();
    b.finish();
}

/// Device loss surfaces as an error without leaking pooled objects.
#[test]
fn test_device_lost() {
    let ctx = TestContext::new(CompletionMode::Immediate);

    let recording = ctx.context.acquire_recording_list(QueueRole::Graphics).unwrap();
    ctx.backend.lose_device();

    assert_eq!(
        ctx.context
            .allocate(ResourceKind::Buffer, MemoryFlags::DEVICE_LOCAL, 64)
            .unwrap_err(),
        PoolError::DeviceLost
    );
    assert_eq!(
        ctx.context.submit_recording_list(recording).unwrap_err(),
        PoolError::DeviceLost
    );

    ctx.context.teardown().unwrap();
    let counters = ctx.backend.counters();
    assert_eq!(counters.live_allocators, 0);
    assert_eq!(counters.live_lists, 0);
    assert_eq!(counters.live_fences, 0);
}

/// The context is shared by reference across threads.
#[test]
fn test_concurrent_allocate_and_record() {
    let ctx = TestContext::new(CompletionMode::Immediate);

    std::thread::scope(|scope| {
        for (worker, role) in QueueRole::ALL.into_iter().enumerate() {
            let ctx = &ctx;
            scope.spawn(move || {
                let mut rng = XorShift::new(worker as u64 + 1);
                for _ in 0..200 {
                    let handle = ctx.alloc(rng.range(1, 70_000));
                    let mut recording = ctx.context.acquire_recording_list(role).unwrap();
                    recording.list_mut().record("copy");
                    ctx.context.submit_recording_list(recording).unwrap();
                    ctx.context.free(handle).unwrap();
                }
            });
        }
    });

    let latency = ctx.context.config().frame_latency;
    ctx.advance_to(latency);
    let stats = ctx.context.stats();
    assert_eq!(stats.pending_frees, 0);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(ctx.backend.counters().submissions, 600);
    for role in QueueRole::ALL {
        assert_eq!(stats.role(role).idle_lists, 1);
    }
    ctx.finish();
}

/// Many threads record on one role while the simulated GPU retires behind
/// them. No allocator is reset while its work is still in flight.
#[test]
fn test_concurrent_submit_on_one_role() {
    const WORKERS: usize = 4;
    const SUBMISSIONS: usize = 500;

    let ctx = TestContext::new(CompletionMode::Manual);
    let done = AtomicBool::new(false);
    let mut values = HashSet::new();

    std::thread::scope(|scope| {
        let retirer = scope.spawn(|| {
            let mut retired = 0usize;
            while !done.load(Ordering::Acquire) {
                if ctx.backend.retire_oldest(QueueRole::Graphics) {
                    retired += 1;
                } else {
                    std::thread::yield_now();
                }
            }
            retired
        });

        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                scope.spawn(|| {
                    (0..SUBMISSIONS)
                        .map(|_| {
                            let mut recording = ctx
                                .context
                                .acquire_recording_list(QueueRole::Graphics)
                                .unwrap();
                            recording.list_mut().record("draw");
                            ctx.context.submit_recording_list(recording).unwrap()
                        })
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        for worker in workers {
            values.extend(worker.join().unwrap());
        }

        done.store(true, Ordering::Release);
        assert!(retirer.join().unwrap() <= WORKERS * SUBMISSIONS);
    });

    let counters = ctx.backend.counters();
    assert_eq!(counters.submissions, WORKERS * SUBMISSIONS);
    let stats = ctx.context.stats();
    let graphics = stats.role(QueueRole::Graphics);
    // Every submission got its own completion value on the shared timeline.
    assert_eq!(values.len(), WORKERS * SUBMISSIONS);
    assert_eq!(Some(&graphics.last_submitted), values.iter().max());
    assert!(graphics.allocators_created <= WORKERS * SUBMISSIONS);
    ctx.finish();
}
