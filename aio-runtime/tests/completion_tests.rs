//! End-to-end tests of the completion engine against a scripted provider.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aio_runtime::{
    AioConfig, AioEngine, AioError, CallId, CompletionRecord, FutureSelector, IoBuffer, IoRequest,
};
use common::{eventually, fast_config, Script, ScriptedProvider};

fn engine_with(provider: &Arc<ScriptedProvider>, config: AioConfig) -> AioEngine {
    AioEngine::new(provider.clone(), config).unwrap()
}

// ============================================================================
// Core scenarios
// ============================================================================

#[test]
fn test_immediate_gather_write_advances_buffers() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(Script::Immediate { rc: 0, bytes: 100 });
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(7).unwrap();

    let first = IoBuffer::from_slice(&[1u8; 60]);
    let second = IoBuffer::from_slice(&[2u8; 40]);
    let future = channel
        .write(IoRequest::new([first.clone(), second.clone()]))
        .unwrap();

    assert!(future.is_completed());
    assert_eq!(future.result().unwrap().unwrap(), 100);
    assert_eq!(first.position(), 60);
    assert_eq!(second.position(), 40);
    assert!(!first.is_pinned());
    assert!(!second.is_pinned());
    assert_eq!(group.stats().immediate, 1);

    let (record, options) = provider.last_issued().unwrap();
    assert!(!options.is_read);
    assert_eq!(record.descriptors().len(), 2);
    assert_eq!(record.requested_bytes(), 100);
    assert_eq!(record.channel_id(), 7);
}

#[test]
fn test_soft_timeout_cancels_pending_read() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(3).unwrap();

    let buffer = IoBuffer::allocate(32);
    let started = Instant::now();
    let future = channel
        .read(IoRequest::single(buffer.clone()).timeout(Duration::from_millis(50)))
        .unwrap();
    assert!(future.is_pending());

    let outcome = future.wait_for_completion(Duration::ZERO);
    assert!(matches!(outcome, Err(AioError::OperationTimedOut { timeout_ms: 50 })));
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert!(future.is_timed_out());
    assert!(!buffer.is_pinned());

    let cancels = provider.cancels();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, 3);
    assert_eq!(cancels[0].1.selector(), Some(FutureSelector::Read));
    assert!(eventually(|| group.stats().timeouts == 1));
}

#[test]
fn test_completion_beats_timeout() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(4).unwrap();

    let buffer = IoBuffer::allocate(64);
    let future = channel
        .read(IoRequest::single(buffer.clone()).timeout(Duration::from_millis(200)))
        .unwrap();

    std::thread::sleep(Duration::from_millis(10));
    provider.complete_last(0, 30);

    assert_eq!(future.wait_for_completion(Duration::ZERO).unwrap(), 30);
    assert!(!future.is_timed_out());
    assert_eq!(buffer.position(), 30);
    assert!(!buffer.is_pinned());

    std::thread::sleep(Duration::from_millis(250));
    assert!(provider.cancels().is_empty());
    assert_eq!(future.result().unwrap().unwrap(), 30);
    assert_eq!(group.stats().dispatched, 1);
}

#[test]
fn test_read_after_close_is_closed_resource() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(5).unwrap();

    channel.close();
    let future = channel.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();

    assert!(matches!(future.result(), Some(Err(AioError::ClosedResource))));
    assert_eq!(provider.issued_count(), 0);
    assert!(group.channel(channel.index()).is_none());
}

// ============================================================================
// Operation semantics
// ============================================================================

#[test]
fn test_second_read_while_pending_is_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let first = channel.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();
    let second = channel.read(IoRequest::single(IoBuffer::allocate(8)));

    assert!(matches!(second, Err(AioError::OperationPending { selector: "read" })));
    assert!(first.is_pending());
    assert_eq!(provider.issued_count(), 1);

    // The write side is independent.
    provider.push(Script::Immediate { rc: 0, bytes: 2 });
    let write = channel.write(IoRequest::single(IoBuffer::from_slice(b"ok"))).unwrap();
    assert_eq!(write.result().unwrap().unwrap(), 2);
}

#[test]
fn test_user_cancel_succeeds() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let buffer = IoBuffer::allocate(16);
    let future = channel.read(IoRequest::single(buffer.clone())).unwrap();
    assert!(channel.cancel(&future, "shutting down"));

    match future.result() {
        Some(Err(AioError::Cancelled { reason })) => assert_eq!(reason, "shutting down"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!future.is_timed_out());
    assert!(!buffer.is_pinned());
    assert_eq!(buffer.position(), 0);
}

#[test]
fn test_refused_cancel_leaves_operation_running() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_cancel_rc(1);
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let future = channel.read(IoRequest::single(IoBuffer::allocate(16))).unwrap();
    assert!(!channel.cancel(&future, "try"));
    assert!(future.is_pending());

    provider.complete_last(0, 8);
    assert_eq!(future.wait_for_completion(Duration::from_secs(2)).unwrap(), 8);
}

#[test]
fn test_cancel_of_foreign_future_is_ignored() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let a = group.open_channel(1).unwrap();
    let b = group.open_channel(2).unwrap();

    let future = a.read(IoRequest::single(IoBuffer::allocate(4))).unwrap();
    assert!(!b.cancel(&future, "wrong channel"));
    assert!(future.is_pending());
    assert!(provider.cancels().is_empty());
}

#[test]
fn test_close_completes_pending_operations() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(9).unwrap();

    let buffer = IoBuffer::allocate(16);
    let future = channel.read(IoRequest::single(buffer.clone())).unwrap();
    channel.close();

    assert!(matches!(future.result(), Some(Err(AioError::ClosedResource))));
    assert!(!buffer.is_pinned());

    // A late completion for the closed channel changes nothing.
    provider.complete_last(0, 16);
    std::thread::sleep(Duration::from_millis(50));
    assert!(matches!(future.result(), Some(Err(AioError::ClosedResource))));

    // Idempotent.
    channel.close();
    assert!(channel.is_closed());
}

#[test]
fn test_native_failure_code_is_decoded() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(Script::Immediate { rc: 5, bytes: 0 });
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let buffer = IoBuffer::from_slice(b"data");
    let future = channel.write(IoRequest::single(buffer.clone())).unwrap();
    match future.result() {
        Some(Err(AioError::NativeOperationFailed { code, message })) => {
            assert_eq!(code, 5);
            assert!(!message.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(buffer.position(), 0);
    assert!(!buffer.is_pinned());
}

#[test]
fn test_issue_error_fails_future() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(Script::Fail);
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let buffer = IoBuffer::allocate(4);
    let future = channel.read(IoRequest::single(buffer.clone())).unwrap();
    assert!(matches!(future.result(), Some(Err(AioError::Io(_)))));
    assert!(!buffer.is_pinned());

    // The future is reusable after a failed setup.
    provider.push(Script::Immediate { rc: 0, bytes: 4 });
    let again = channel.read(IoRequest::single(buffer)).unwrap();
    assert_eq!(again.result().unwrap().unwrap(), 4);
}

#[test]
fn test_no_usable_buffers() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let empty = channel.write(IoRequest::new(Vec::new())).unwrap();
    assert!(matches!(
        empty.result(),
        Some(Err(AioError::NoBuffersSupplied { operation: "write" }))
    ));

    let full = IoBuffer::allocate(8);
    full.set_position(8);
    let exhausted = channel.read(IoRequest::single(full)).unwrap();
    assert!(matches!(
        exhausted.result(),
        Some(Err(AioError::NoBuffersSupplied { operation: "read" }))
    ));
    assert_eq!(provider.issued_count(), 0);
}

#[test]
fn test_pinned_buffer_is_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let a = group.open_channel(1).unwrap();
    let b = group.open_channel(2).unwrap();

    let shared = IoBuffer::allocate(8);
    let first = a.read(IoRequest::single(shared.clone())).unwrap();
    assert!(first.is_pending());

    let other = IoBuffer::allocate(8);
    let second = b.read(IoRequest::new([other.clone(), shared.clone()])).unwrap();
    assert!(matches!(second.result(), Some(Err(AioError::BufferInUse))));
    assert!(!other.is_pinned());
    assert!(shared.is_pinned());
}

#[test]
fn test_read_sync_immediate_and_timeout() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(Script::Immediate { rc: 0, bytes: 16 });
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let buffer = IoBuffer::allocate(16);
    assert_eq!(channel.read_sync(IoRequest::single(buffer.clone())).unwrap(), 16);
    assert_eq!(buffer.position(), 16);

    let (record, _) = provider.last_issued().unwrap();
    assert_eq!(record.call_id().selector(), Some(FutureSelector::SyncRead));

    let timed = channel.read_sync(IoRequest::single(IoBuffer::allocate(4)).timeout(Duration::from_millis(20)));
    assert!(matches!(timed, Err(AioError::OperationTimedOut { .. })));
}

#[test]
fn test_wait_timeout_without_soft_timer() {
    let provider = Arc::new(ScriptedProvider::new());
    let config = AioConfig::builder()
        .max_workers(1)
        .initial_workers(1)
        .dequeue_timeout(Duration::from_millis(20))
        .disable_timeouts(true)
        .build()
        .unwrap();
    let engine = engine_with(&provider, config);
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let future = channel.read(IoRequest::single(IoBuffer::allocate(4))).unwrap();
    let outcome = future.wait_for_completion(Duration::from_millis(30));
    assert!(matches!(outcome, Err(AioError::OperationTimedOut { timeout_ms: 30 })));
    assert_eq!(provider.cancels().len(), 1);
    assert_eq!(engine.timer_stats().scheduled, 0);
}

#[test]
fn test_write_sync_with_position() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push(Script::Immediate { rc: 0, bytes: 3 });
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let written = channel
        .write_sync(IoRequest::single(IoBuffer::from_slice(b"abc")).at(4096))
        .unwrap();
    assert_eq!(written, 3);
    let (record, options) = provider.last_issued().unwrap();
    assert_eq!(record.position(), Some(4096));
    assert_eq!(record.call_id().selector(), Some(FutureSelector::SyncWrite));
    assert!(!options.is_read);
}

// ============================================================================
// Listeners and reuse
// ============================================================================

#[test]
fn test_listener_runs_once_on_executor() {
    let provider = Arc::new(ScriptedProvider::new());
    let config = AioConfig::builder()
        .max_workers(2)
        .initial_workers(1)
        .dequeue_timeout(Duration::from_millis(20))
        .listener_threads(1)
        .build()
        .unwrap();
    let engine = engine_with(&provider, config);
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam_channel::bounded(4);
    let future = channel.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();
    {
        let calls = calls.clone();
        future.add_completion_listener(move |f| {
            calls.fetch_add(1, Ordering::SeqCst);
            let name = std::thread::current().name().map(str::to_owned);
            let _ = tx.send((f.result(), name));
        });
    }

    provider.complete_last(0, 8);
    let (outcome, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome.unwrap().unwrap(), 8);
    assert!(thread.unwrap().starts_with("aio-listener"));

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_future_reused_across_operations() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let mut reuse = Vec::new();
    for round in 1..=3u64 {
        provider.push(Script::Immediate { rc: 0, bytes: round });
        let future = channel.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();
        assert!(Arc::ptr_eq(&future, channel.read_future()));
        assert_eq!(future.result().unwrap().unwrap(), round);
        reuse.push(future.reuse_count());
    }
    assert!(reuse.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(channel.read_future().completions(), 3);
}

#[test]
fn test_reset_while_pending_fails() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();

    let future = channel.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();
    assert!(matches!(future.reset(), Err(AioError::OperationPending { .. })));

    provider.complete_last(0, 1);
    future.wait_for_completion(Duration::from_secs(2)).unwrap();
    future.reset().unwrap();
    assert!(!future.is_completed());
    assert!(future.result().is_none());
}

// ============================================================================
// Result handler routing
// ============================================================================

#[test]
fn test_record_for_unknown_channel_is_dropped() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let _channel = group.open_channel(1).unwrap();

    let mut record = CompletionRecord::new();
    let call = CallId::new(FutureSelector::Read, 4242).unwrap();
    record.prepare(1, call, None, &[]).unwrap();
    record.set_result(0, 10);
    provider.post(record);

    assert!(eventually(|| group.stats().dropped == 1));
    assert_eq!(group.stats().dispatched, 0);
}

#[test]
fn test_stale_completion_after_slot_reuse_is_dropped() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();

    let old = group.open_channel(10).unwrap();
    old.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();
    let (stale, _) = provider.last_issued().unwrap();
    old.close();

    let new = group.open_channel(11).unwrap();
    assert_eq!(new.index(), old.index());
    let future = new.read(IoRequest::single(IoBuffer::allocate(8))).unwrap();

    let mut stale = stale;
    stale.set_result(0, 8);
    provider.post(stale);

    assert!(eventually(|| group.stats().dropped == 1));
    assert!(future.is_pending());
}

#[test]
fn test_worker_pool_grows_to_cap() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    assert!(eventually(|| group.stats().workers_running == 1));

    let channels: Vec<_> = (0..6).map(|h| group.open_channel(100 + h).unwrap()).collect();
    for channel in &channels {
        channel.read(IoRequest::single(IoBuffer::allocate(4))).unwrap();
        provider.complete_last(0, 4);
    }

    for channel in &channels {
        assert_eq!(channel.read_future().wait_for_completion(Duration::from_secs(2)).unwrap(), 4);
    }
    assert!(eventually(|| group.stats().workers_running == 2));
    assert!(group.stats().workers_running <= engine.config().handler.max_workers);
}

#[test]
fn test_single_record_dequeue_without_batching() {
    let provider = Arc::new(ScriptedProvider::with_batch(false));
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();

    let a = group.open_channel(1).unwrap();
    let b = group.open_channel(2).unwrap();
    let fa = a.read(IoRequest::single(IoBuffer::allocate(4))).unwrap();
    provider.complete_last(0, 1);
    let fb = b.read(IoRequest::single(IoBuffer::allocate(4))).unwrap();
    provider.complete_last(0, 2);

    assert_eq!(fa.wait_for_completion(Duration::from_secs(2)).unwrap(), 1);
    assert_eq!(fb.wait_for_completion(Duration::from_secs(2)).unwrap(), 2);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_engine_shutdown_closes_channels() {
    let provider = Arc::new(ScriptedProvider::new());
    let engine = engine_with(&provider, fast_config());
    let group = engine.create_group().unwrap();
    let channel = group.open_channel(1).unwrap();
    let future = channel.read(IoRequest::single(IoBuffer::allocate(4))).unwrap();

    engine.shutdown();

    assert!(matches!(future.result(), Some(Err(AioError::ClosedResource))));
    assert!(channel.is_closed());
    assert!(group.is_shut_down());
    assert_eq!(group.stats().workers_running, 0);
    assert!(matches!(engine.create_group(), Err(AioError::ClosedResource)));
    assert!(!engine.provider().is_initialized());

    // Idempotent.
    engine.shutdown();
}

#[test]
fn test_invalid_config_is_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let config = AioConfig::builder().max_workers(0).build_unchecked();
    let result = AioEngine::new(provider, config);
    assert!(matches!(result, Err(AioError::Config(_))));
}
