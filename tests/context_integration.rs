//! Context integration tests: affinity, ordering, blocking offload, timers.

use courier_core::streams::ReadStream;
use courier_core::types::{DeploymentId, RuntimeConfig, TimerId};
use courier_core::{CompositeFuture, Config, Context, ContextKind, Courier, Error, Future};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn start_courier() -> Courier {
    let config = Config {
        runtime: RuntimeConfig {
            event_loop_pool_size: 2,
            worker_pool_size: 4,
            ..RuntimeConfig::default()
        },
        ..Config::default()
    };
    Courier::new(config).unwrap()
}

fn flush(context: &Context) {
    let (tx, rx) = mpsc::channel();
    context.run_on_context(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(WAIT).unwrap();
}

// =============================================================================
// Scheduling
// =============================================================================

#[test]
fn test_event_loop_tasks_run_in_order_on_loop_thread() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    for n in 0..50 {
        let tx = tx.clone();
        let expected = ctx.clone();
        ctx.run_on_context(move || {
            assert!(Context::is_on_event_loop_thread());
            assert_eq!(Context::current(), Some(expected));
            let _ = tx.send(n);
        });
    }
    let seen: Vec<i32> = (0..50).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
    assert_eq!(Context::current(), None);
    courier.close();
}

#[test]
fn test_run_on_context_is_never_synchronous() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let inner = ctx.clone();
    ctx.run_on_context(move || {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        inner.run_on_context(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        let _ = tx.send(ran.load(Ordering::SeqCst));
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
    courier.close();
}

#[test]
fn test_worker_context_preserves_order() {
    let courier = start_courier();
    let ctx = courier.create_worker_context(false).unwrap();
    assert_eq!(ctx.kind(), ContextKind::Worker);
    let (tx, rx) = mpsc::channel();

    for n in 0..20 {
        let tx = tx.clone();
        ctx.run_on_context(move || {
            assert!(Context::is_on_worker_thread());
            std::thread::sleep(Duration::from_millis(1));
            let _ = tx.send(n);
        });
    }
    let seen: Vec<i32> = (0..20).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    courier.close();
}

/// Queue two tasks that each wait for the other to start. Returns whether
/// each saw its peer, which only happens when they overlap.
fn rendezvous(ctx: &Context) -> (bool, bool) {
    let (a_tx, a_rx) = mpsc::channel::<()>();
    let (b_tx, b_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();

    let done = done_tx.clone();
    ctx.run_on_context(move || {
        let _ = a_tx.send(());
        let met = b_rx.recv_timeout(Duration::from_millis(500)).is_ok();
        let _ = done.send(("a", met, Context::is_on_worker_thread()));
    });
    ctx.run_on_context(move || {
        let _ = b_tx.send(());
        let met = a_rx.recv_timeout(Duration::from_millis(500)).is_ok();
        let _ = done_tx.send(("b", met, Context::is_on_worker_thread()));
    });

    let mut a_met = false;
    let mut b_met = false;
    for _ in 0..2 {
        let (task, met, on_worker) = done_rx.recv_timeout(WAIT).unwrap();
        assert!(on_worker);
        match task {
            "a" => a_met = met,
            _ => b_met = met,
        }
    }
    (a_met, b_met)
}

#[test]
fn test_multi_threaded_worker_runs_tasks_concurrently() {
    let courier = start_courier();
    let ctx = courier.create_worker_context(true).unwrap();
    assert_eq!(ctx.kind(), ContextKind::MultiThreadedWorker);

    let (tx, rx) = mpsc::channel();
    let task_ctx = ctx.clone();
    ctx.run_on_context(move || {
        let current = Context::current().map(|c| c.id().clone());
        let _ = tx.send((Context::is_on_worker_thread(), current == Some(task_ctx.id().clone())));
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, true));

    assert_eq!(rendezvous(&ctx), (true, true));
    courier.close();
}

#[test]
fn test_worker_context_never_overlaps_tasks() {
    let courier = start_courier();
    let ctx = courier.create_worker_context(false).unwrap();
    // The second task only starts after the first gave up waiting
    assert_eq!(rendezvous(&ctx), (false, true));
    courier.close();
}

#[test]
fn test_panicking_task_reaches_exception_handler() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();
    ctx.exception_handler(move |e| {
        let _ = tx.send(e.clone());
    });

    ctx.run_on_context(|| panic!("task exploded"));
    match rx.recv_timeout(WAIT).unwrap() {
        Error::Uncaught(message) => assert!(message.contains("task exploded")),
        other => panic!("unexpected error {:?}", other),
    }
    // The loop survives
    flush(&ctx);
    courier.close();
}

#[test]
fn test_deployment_tag() {
    let courier = start_courier();
    let deployment = DeploymentId::new();
    let ctx = courier
        .create_context(ContextKind::MultiThreadedWorker, Some(deployment.clone()))
        .unwrap();
    assert_eq!(ctx.deployment(), Some(&deployment));
    assert!(ctx.kind().is_worker());
    courier.close();
}

// =============================================================================
// Blocking offload
// =============================================================================

#[test]
fn test_execute_blocking_returns_on_context() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let future = ctx.execute_blocking(
        || {
            assert!(Context::is_on_worker_thread());
            assert!(!Context::is_on_event_loop_thread());
            Ok(6 * 7)
        },
        true,
    );
    let expected = ctx.clone();
    future.set_handler(move |result| {
        let on_ctx = Context::current().as_ref() == Some(&expected);
        let _ = tx.send((result.as_ref().ok().copied(), on_ctx));
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (Some(42), true));
    courier.close();
}

#[test]
fn test_execute_blocking_panic_fails_future() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let future: Future<()> = ctx.execute_blocking(|| panic!("disk on fire"), false);
    future.set_handler(move |result| {
        let _ = tx.send(result.clone().err());
    });
    match rx.recv_timeout(WAIT).unwrap() {
        Some(Error::Uncaught(message)) => assert!(message.contains("disk on fire")),
        other => panic!("unexpected outcome {:?}", other),
    }
    courier.close();
}

#[test]
fn test_ordered_blocking_runs_one_at_a_time() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let futures: Vec<_> = (0..8)
        .map(|n| {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            let order = Arc::clone(&order);
            ctx.execute_blocking(
                move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    order.lock().push(n);
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                true,
            )
            .erased()
        })
        .collect();

    let (tx, rx) = mpsc::channel();
    CompositeFuture::all(futures).set_handler(move |result| {
        let _ = tx.send(result.is_ok());
    });
    assert!(rx.recv_timeout(WAIT).unwrap());
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    courier.close();
}

#[test]
fn test_unordered_blocking_runs_concurrently() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_rx = Arc::new(parking_lot::Mutex::new(gate_rx));

    // The first action waits for the second; only concurrency lets both finish
    let waiter = {
        let gate_rx = Arc::clone(&gate_rx);
        ctx.execute_blocking(
            move || {
                gate_rx
                    .lock()
                    .recv_timeout(WAIT)
                    .map_err(|_| Error::failed("gate never opened"))
            },
            false,
        )
    };
    let opener = ctx.execute_blocking(
        move || {
            let _ = gate_tx.send(());
            Ok(())
        },
        false,
    );

    let (tx, rx) = mpsc::channel();
    CompositeFuture::all(vec![waiter.erased(), opener.erased()]).set_handler(move |result| {
        let _ = tx.send(result.is_ok());
    });
    assert!(rx.recv_timeout(WAIT * 2).unwrap());
    courier.close();
}

// =============================================================================
// Timers
// =============================================================================

#[test]
fn test_timer_fires_once_on_context() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let expected = ctx.clone();
    let id = courier
        .set_timer(&ctx, Duration::from_millis(10), move |fired: TimerId| {
            let _ = tx.send((fired, Context::current() == Some(expected)));
        })
        .unwrap();

    let (fired, on_ctx) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(fired, id);
    assert!(on_ctx);
    assert!(!courier.cancel_timer(id));
    courier.close();
}

#[test]
fn test_cancelled_timer_never_fires() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let id = courier
        .set_timer(&ctx, Duration::from_millis(50), move |_| {
            let _ = tx.send(());
        })
        .unwrap();
    assert!(courier.cancel_timer(id));
    assert!(!courier.cancel_timer(id));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    courier.close();
}

#[test]
fn test_timer_delay_below_one_ms_rejected() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let result = courier.set_timer(&ctx, Duration::from_micros(500), |_| {});
    assert!(matches!(result, Err(Error::IllegalArgument(_))));
    courier.close();
}

#[test]
fn test_periodic_timer_repeats_until_cancelled() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let id = courier
        .set_periodic(&ctx, Duration::from_millis(5), move |_| {
            let _ = tx.send(());
        })
        .unwrap();
    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert!(courier.cancel_timer(id));
    flush(&ctx);
    while rx.try_recv().is_ok() {}
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    courier.close();
}

#[test]
fn test_closing_context_cancels_timers() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let periodic_tx = tx.clone();
    courier
        .set_periodic(&ctx, Duration::from_millis(20), move |_| {
            let _ = periodic_tx.send(());
        })
        .unwrap();
    courier
        .set_timer(&ctx, Duration::from_millis(20), move |_| {
            let _ = tx.send(());
        })
        .unwrap();
    assert_eq!(courier.timer_table().len(), 2);

    ctx.close();
    assert!(ctx.is_closed());
    assert!(courier.timer_table().is_empty());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(matches!(
        courier.set_timer(&ctx, Duration::from_millis(5), |_| {}),
        Err(Error::IllegalState(_))
    ));
    courier.close();
}

#[test]
fn test_timer_stream_ends_after_firing() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let (tx, rx) = mpsc::channel();

    let stream = courier.timer_stream(&ctx, Duration::from_millis(10));
    assert!(stream.timer_id().is_none());

    let end_tx = tx.clone();
    stream.end_handler(Some(Box::new(move || {
        let _ = end_tx.send("end");
    })));
    stream
        .handler(Some(Arc::new(move |_id: TimerId| {
            let _ = tx.send("tick");
        })))
        .unwrap();
    assert!(stream.timer_id().is_some());

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "tick");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "end");
    assert!(stream.timer_id().is_none());
    courier.close();
}

#[test]
fn test_periodic_stream_skips_while_paused() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let stream = courier.periodic_stream(&ctx, Duration::from_millis(5));
    let counter = Arc::clone(&ticks);
    stream
        .handler(Some(Arc::new(move |_id: TimerId| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.pause();
    flush(&ctx);
    let paused_at = ticks.load(Ordering::SeqCst);
    assert!(paused_at > 0);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ticks.load(Ordering::SeqCst), paused_at);

    stream.handler(None).unwrap();
    assert!(stream.timer_id().is_none());
    courier.close();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_closed_courier_rejects_contexts() {
    let courier = start_courier();
    let ctx = courier.create_event_loop_context().unwrap();
    courier.close();
    assert!(courier.is_closed());
    assert!(ctx.is_closed());
    assert!(matches!(
        courier.create_event_loop_context(),
        Err(Error::IllegalState(_))
    ));
    // Idempotent
    courier.close();
}

#[test]
fn test_zero_pool_size_rejected() {
    let mut config = Config::default();
    config.runtime.event_loop_pool_size = 0;
    assert!(matches!(Courier::new(config), Err(Error::IllegalArgument(_))));
}
