//! Closing and cancelling contexts

mod common;

use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use common::{EventLog, TestLanguage, abc, init_tracing, registry};
use parking_lot::Mutex;
use polyglot_engine::{Context, EngineConfig, ErrorKind, Lifecycle};

const CLOSED: &str = "The Context is already closed.";

fn wait_for_active(context: &Context, threads: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while context.snapshot().active_threads < threads {
        assert!(Instant::now() < deadline, "threads did not enter in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_concurrent_close_is_race_free() {
    const THREADS: usize = 10;
    init_tracing();

    for _ in 0..100 {
        let log = EventLog::default();
        let context = Context::builder().registry(abc(&log)).build().unwrap();
        context.initialize("a").unwrap();
        let engine = context.engine();

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                let context = context.clone();
                let engine = engine.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 { context.close() } else { engine.close() }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert!(context.is_closed());
        assert!(engine.is_closed());
        assert_eq!(context.eval("a", "x").unwrap_err().to_string(), CLOSED);
        assert_eq!(log.count("finalize", "a"), 1);
        assert_eq!(log.count("dispose", "a"), 1);
    }
}

#[test]
fn test_close_is_idempotent() {
    let log = EventLog::default();
    let context = Context::builder().registry(abc(&log)).build().unwrap();
    context.initialize("b").unwrap();

    context.close().unwrap();
    context.close().unwrap();
    context.close_cancel().unwrap();
    assert_eq!(log.count("dispose", "b"), 1);
    assert_eq!(context.snapshot().lifecycle, Lifecycle::Closed);
}

#[test]
fn test_thread_started_during_dispose_sees_closed_context() {
    let log = EventLog::default();
    let observed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&observed);
    let registry = registry([TestLanguage::new("a", &log).multi_threaded().on_dispose(move |env| {
        let context = env.context();
        let result = thread::spawn(move || context.eval("a", "x").map_err(|err| err.to_string()))
            .join()
            .map_err(|_| anyhow::anyhow!("eval thread panicked"))?;
        *seen.lock() = Some(result);
        Ok(())
    })]);
    let context = Context::builder().registry(registry).build().unwrap();
    context.initialize("a").unwrap();

    context.close().unwrap();
    assert_eq!(*observed.lock(), Some(Err(CLOSED.to_string())));
}

#[test]
fn test_close_fails_while_executing_on_other_thread() {
    let log = EventLog::default();
    let context = Context::builder().registry(abc(&log)).build().unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (leave_tx, leave_rx) = mpsc::channel::<()>();
    let worker = context.clone();
    let handle = thread::spawn(move || {
        worker.enter().unwrap();
        entered_tx.send(()).unwrap();
        leave_rx.recv().unwrap();
        worker.leave().unwrap();
    });
    entered_rx.recv().unwrap();

    let err = context.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
    assert_eq!(
        err.to_string(),
        "The context is currently executing on another thread. Set cancel to true to stop the \
         execution on this thread."
    );
    assert!(!context.is_closed());

    leave_tx.send(()).unwrap();
    handle.join().unwrap();
    context.close().unwrap();
}

#[test]
fn test_close_fails_while_explicitly_entered() {
    let context = Context::builder().registry(abc(&EventLog::default())).build().unwrap();
    context.enter().unwrap();

    let err = context.close().unwrap_err();
    assert_eq!(
        err.to_string(),
        "The context is explicitly entered on the current thread. Call leave() before closing the \
         context to resolve this."
    );

    context.leave().unwrap();
    context.close().unwrap();
}

#[test]
fn test_cancel_interrupts_parked_threads() {
    const THREADS: usize = 8;

    let log = EventLog::default();
    let context = Context::builder().registry(abc(&log)).build().unwrap();
    context.initialize("a").unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let context = context.clone();
            thread::spawn(move || context.eval("a", "park"))
        })
        .collect();
    wait_for_active(&context, THREADS);

    context.close_cancel().unwrap();
    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_cancelled(), "{err}");
    }
    assert!(context.is_closed());
    assert_eq!(log.count("dispose", "a"), 1);
    assert_eq!(log.count("dispose_thread", "a"), 1 + THREADS);
}

#[test]
fn test_cancel_interrupts_sleeping_guest_code() {
    let log = EventLog::default();
    let context = Context::builder().registry(abc(&log)).build().unwrap();

    let worker = context.clone();
    let handle = thread::spawn(move || worker.eval("b", "sleep:60000"));
    wait_for_active(&context, 1);

    let started = Instant::now();
    context.close_cancel().unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(handle.join().unwrap().unwrap_err().is_cancelled());
}

#[test]
fn test_cancelled_context_rejects_new_work() {
    let context = Context::builder().registry(abc(&EventLog::default())).build().unwrap();
    context.close_cancel().unwrap();

    let err = context.eval("a", "x").unwrap_err();
    assert!(err.is_closed());
}

#[test]
fn test_finalize_under_cancel_still_disposes() {
    let log = EventLog::default();
    let registry = registry([TestLanguage::new("a", &log).on_finalize(|env| {
        env.sleep(Duration::from_secs(60))?;
        Ok(())
    })]);
    let context = Context::builder().registry(registry).build().unwrap();
    context.initialize("a").unwrap();

    context.close_cancel().unwrap();
    assert!(context.is_closed());
    assert_eq!(log.phase("finalize"), ["a"]);
    assert_eq!(log.phase("dispose"), ["a"]);
}

#[test]
fn test_cancel_times_out_on_unresponsive_thread() {
    let config = EngineConfig {
        cancel_timeout_ms: 100,
        close_poll_interval_ms: 5,
        close_escalation_rounds: 4,
        ..EngineConfig::default()
    };
    let log = EventLog::default();
    let context = Context::builder().registry(abc(&log)).config(config).build().unwrap();

    let worker = context.clone();
    let handle = thread::spawn(move || worker.eval("c", "block:1000"));
    wait_for_active(&context, 1);
    while log.count("initialize", "c") == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    // let the worker get past its last cancellation check
    thread::sleep(Duration::from_millis(100));

    let err = context.close_cancel().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("timed out"), "{err}");
    assert!(!context.is_closed());
    assert!(context.snapshot().cancelling);

    // the blocked call never looked at the cancel flag
    handle.join().unwrap().unwrap();
    context.close_cancel().unwrap();
    assert!(context.is_closed());
    assert_eq!(log.count("dispose", "c"), 1);
}

#[test]
fn test_cancel_interrupts_close_in_progress() {
    let log = EventLog::default();
    let registry = registry([TestLanguage::new("a", &log).on_finalize(|env| {
        env.sleep(Duration::from_secs(60))?;
        Ok(())
    })]);
    let context = Context::builder().registry(registry).build().unwrap();
    context.initialize("a").unwrap();

    let closer = context.clone();
    let handle = thread::spawn(move || closer.close());
    while log.count("finalize", "a") == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    let started = Instant::now();
    context.close_cancel().unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(context.is_closed());

    // the interrupted finalize does not abort the close that ran it
    handle.join().unwrap().unwrap();
    assert_eq!(log.count("dispose", "a"), 1);
}

#[test]
fn test_cancel_times_out_behind_unresponsive_close() {
    let config = EngineConfig {
        cancel_timeout_ms: 100,
        close_poll_interval_ms: 5,
        close_escalation_rounds: 4,
        ..EngineConfig::default()
    };
    let log = EventLog::default();
    let registry = registry([TestLanguage::new("a", &log).on_finalize(|_| {
        thread::sleep(Duration::from_millis(1000));
        Ok(())
    })]);
    let context = Context::builder().registry(registry).config(config).build().unwrap();
    context.initialize("a").unwrap();

    let closer = context.clone();
    let handle = thread::spawn(move || closer.close());
    while log.count("finalize", "a") == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    let err = context.close_cancel().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("timed out"), "{err}");
    assert!(err.to_string().contains("is still closing it"), "{err}");

    handle.join().unwrap().unwrap();
    assert!(context.is_closed());
    assert_eq!(log.count("dispose", "a"), 1);
}

#[test]
fn test_work_racing_close_fails_cleanly() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;
    init_tracing();

    for round in 0..ROUNDS {
        let log = EventLog::default();
        let context = Context::builder().registry(abc(&log)).build().unwrap();
        context.initialize("a").unwrap();

        let barrier = Arc::new(Barrier::new(THREADS + 1));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let context = context.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    loop {
                        let result = if i % 2 == 0 {
                            context.eval("a", "x").map(drop)
                        } else {
                            context.enter().and_then(|()| {
                                let evaluated = context.eval("b", "x").map(drop);
                                context.leave()?;
                                evaluated
                            })
                        };
                        match result {
                            Ok(()) => thread::sleep(Duration::from_micros(200)),
                            Err(err) if err.is_closed() => return,
                            Err(err) => {
                                assert!(err.is_cancelled(), "{err}");
                                thread::yield_now();
                            }
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(2));
        if round % 2 == 0 {
            context.close_cancel().unwrap();
        } else {
            // a normal close only succeeds in a moment without guest code running
            while let Err(err) = context.close() {
                assert_eq!(err.kind(), ErrorKind::Lifecycle, "{err}");
                thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(context.is_closed());
        assert_eq!(log.count("finalize", "a"), 1);
        assert_eq!(log.count("dispose", "a"), 1);
        assert!(log.count("dispose", "b") <= 1);
        assert_eq!(log.count("dispose", "b"), log.count("create", "b"));
    }
}

#[test]
fn test_closed_engine_rejects_contexts() {
    let engine = polyglot_engine::Engine::create(abc(&EventLog::default()));
    engine.close().unwrap();

    let err = engine.context_builder().build().unwrap_err();
    assert_eq!(err.to_string(), "The Engine is already closed.");
    assert!(err.is_closed());
}

#[test]
fn test_implicit_engine_closes_with_its_context() {
    let context = Context::builder().registry(abc(&EventLog::default())).build().unwrap();
    let engine = context.engine();
    assert!(!engine.is_closed());

    context.close().unwrap();
    assert!(engine.is_closed());
}

#[test]
fn test_explicit_engine_outlives_its_contexts() {
    let log = EventLog::default();
    let engine = polyglot_engine::Engine::create(abc(&log));
    let first = engine.context_builder().build().unwrap();
    let second = engine.context_builder().build().unwrap();
    first.initialize("a").unwrap();
    second.initialize("b").unwrap();
    assert_eq!(engine.context_count(), 2);

    first.close().unwrap();
    assert!(!engine.is_closed());
    assert_eq!(engine.context_count(), 1);

    engine.close().unwrap();
    assert!(second.is_closed());
    assert_eq!(engine.context_count(), 0);
    assert_eq!(log.count("dispose", "a"), 1);
    assert_eq!(log.count("dispose", "b"), 1);
}

#[test]
fn test_engine_close_fails_while_context_executes() {
    let engine = polyglot_engine::Engine::create(abc(&EventLog::default()));
    let context = engine.context_builder().build().unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (leave_tx, leave_rx) = mpsc::channel::<()>();
    let worker = context.clone();
    let handle = thread::spawn(move || {
        let _scope = worker.enter_scoped().unwrap();
        entered_tx.send(()).unwrap();
        leave_rx.recv().unwrap();
    });
    entered_rx.recv().unwrap();

    assert_eq!(engine.close().unwrap_err().kind(), ErrorKind::Lifecycle);
    assert!(engine.is_closed());
    assert!(!context.is_closed());

    leave_tx.send(()).unwrap();
    handle.join().unwrap();
    engine.close().unwrap();
    assert!(context.is_closed());
}
