//! Language lifecycle ordering within one context

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{EventLog, TestLanguage, init_tracing, registry};
use parking_lot::Mutex;
use polyglot_engine::{Context, ErrorKind, Lifecycle, PolyglotAccess, SlotState};

fn chain(log: &EventLog) -> Context {
    let registry = registry([
        TestLanguage::new("t", log).depends_on(&["d"]),
        TestLanguage::new("d", log).depends_on(&["p"]),
        TestLanguage::new("p", log).depends_on(&["i"]),
        TestLanguage::new("i", log).internal(),
    ]);
    Context::builder().registry(registry).build().unwrap()
}

#[test]
fn test_dependency_chain_order() {
    init_tracing();
    let log = EventLog::default();
    let context = chain(&log);

    assert!(context.initialize("t").unwrap());
    assert_eq!(log.phase("create"), ["i", "p", "d", "t"]);
    assert_eq!(log.phase("initialize"), ["i", "p", "d", "t"]);
    assert_eq!(context.snapshot().creation_order(), ["i", "p", "d", "t"]);

    context.close().unwrap();
    assert_eq!(log.phase("finalize"), ["t", "d", "p", "i"]);
    assert_eq!(log.phase("dispose"), ["t", "d", "p", "i"]);

    // every finalize happens before the first dispose
    let last_finalize = log.position("finalize", "i").unwrap();
    let first_dispose = log.position("dispose", "t").unwrap();
    assert!(last_finalize < first_dispose);
}

#[test]
fn test_slot_states_follow_lifecycle() {
    let log = EventLog::default();
    let context = chain(&log);

    assert_eq!(context.snapshot().state_of("t"), SlotState::Uncreated);
    context.initialize("p").unwrap();

    let snapshot = context.snapshot();
    assert_eq!(snapshot.state_of("p"), SlotState::ContextInitialized);
    assert_eq!(snapshot.state_of("i"), SlotState::ContextInitialized);
    assert_eq!(snapshot.state_of("t"), SlotState::Uncreated);

    context.close().unwrap();
    let snapshot = context.snapshot();
    assert_eq!(snapshot.lifecycle, Lifecycle::Closed);
    assert!(snapshot.languages.iter().all(|language| language.state == SlotState::Disposed));
}

#[test]
fn test_initialize_twice_returns_false() {
    let log = EventLog::default();
    let context = chain(&log);

    assert!(context.initialize("d").unwrap());
    assert!(!context.initialize("d").unwrap());
    assert!(context.initialize("t").unwrap());
    assert_eq!(log.count("create", "d"), 1);
}

#[test]
fn test_dependency_usable_during_initialize() {
    let log = EventLog::default();
    let registry = registry([
        TestLanguage::new("user", &log)
            .depends_on(&["lib"])
            .on_initialize(|env| {
                assert_eq!(env.eval("lib", "ready")?.as_str(), Some("ready"));
                Ok(())
            }),
        TestLanguage::new("lib", &log),
    ]);
    let context = Context::builder().registry(registry).build().unwrap();

    assert!(context.initialize("user").unwrap());
}

#[test]
fn test_cyclic_use_during_initialize_succeeds() {
    let log = EventLog::default();
    let registry = registry([
        TestLanguage::new("a", &log).on_initialize(|env| {
            env.eval("b", "x")?;
            Ok(())
        }),
        TestLanguage::new("b", &log).on_initialize(|env| {
            env.eval("a", "x")?;
            Ok(())
        }),
    ]);
    let context = Context::builder()
        .registry(registry)
        .allow_polyglot_access(PolyglotAccess::All)
        .build()
        .unwrap();

    assert!(context.initialize("a").unwrap());
    assert_eq!(log.phase("initialize"), ["a", "b"]);
    assert_eq!(context.snapshot().state_of("b"), SlotState::ContextInitialized);
}

#[test]
fn test_dependent_used_during_create_is_rejected() {
    let log = EventLog::default();
    let registry = registry([
        TestLanguage::new("base", &log).on_create(|env| {
            env.initialize("ext")?;
            Ok(())
        }),
        TestLanguage::new("ext", &log).depends_on(&["base"]),
    ]);
    let context = Context::builder()
        .registry(registry)
        .allow_polyglot_access(PolyglotAccess::All)
        .build()
        .unwrap();

    for _ in 0..3 {
        let err = context.initialize("base").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "Cyclic access to language 'base' while its context is being created."
        );
        assert_eq!(context.snapshot().state_of("base"), SlotState::Uncreated);
    }
    context.close().unwrap();
}

#[test]
fn test_language_activated_during_finalize() {
    let log = EventLog::default();
    let registry = registry([
        TestLanguage::new("a", &log).on_finalize(|env| {
            env.eval("late", "x")?;
            Ok(())
        }),
        TestLanguage::new("late", &log),
    ]);
    let context = Context::builder()
        .registry(registry)
        .allow_polyglot_access(PolyglotAccess::All)
        .build()
        .unwrap();

    context.initialize("a").unwrap();
    context.close().unwrap();

    assert_eq!(log.phase("finalize"), ["a", "late"]);
    assert_eq!(log.phase("dispose"), ["late", "a"]);
}

#[test]
fn test_initialize_during_dispose_fails_closed() {
    let log = EventLog::default();
    let observed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&observed);
    let registry = registry([
        TestLanguage::new("a", &log).on_dispose(move |env| {
            *seen.lock() = Some(env.initialize("b").map_err(|err| err.to_string()));
            Ok(())
        }),
        TestLanguage::new("b", &log),
    ]);
    let context = Context::builder()
        .registry(registry)
        .allow_polyglot_access(PolyglotAccess::All)
        .build()
        .unwrap();

    context.initialize("a").unwrap();
    context.close().unwrap();

    assert_eq!(*observed.lock(), Some(Err("The Context is already closed.".to_string())));
    assert_eq!(log.count("create", "b"), 0);
}

#[test]
fn test_dispose_error_is_internal_and_context_still_closes() {
    let log = EventLog::default();
    let registry = registry([
        TestLanguage::new("a", &log)
            .on_dispose(|_| Err(anyhow::anyhow!("ran guest code while disposing"))),
        TestLanguage::new("b", &log),
    ]);
    let context = Context::builder().registry(registry).build().unwrap();
    context.initialize("a").unwrap();
    context.initialize("b").unwrap();

    let err = context.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(context.is_closed());
    assert_eq!(log.phase("dispose"), ["b", "a"]);
    assert_eq!(
        context.eval("b", "x").unwrap_err().to_string(),
        "The Context is already closed."
    );
}

#[test]
fn test_finalize_error_aborts_close_and_resumes() {
    let log = EventLog::default();
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed_once);
    let registry = registry([
        TestLanguage::new("a", &log).on_finalize(move |_| {
            if !flag.swap(true, Ordering::SeqCst) {
                anyhow::bail!("not yet");
            }
            Ok(())
        }),
        TestLanguage::new("b", &log),
    ]);
    let context = Context::builder().registry(registry).build().unwrap();
    context.initialize("a").unwrap();
    context.initialize("b").unwrap();

    let err = context.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guest);
    assert_eq!(err.to_string(), "Error in language 'a': not yet");

    let snapshot = context.snapshot();
    assert_eq!(snapshot.lifecycle, Lifecycle::Open);
    assert_eq!(snapshot.state_of("b"), SlotState::Finalized);
    assert_eq!(snapshot.state_of("a"), SlotState::ContextInitialized);
    assert_eq!(context.eval("a", "still open").unwrap().as_str(), Some("still open"));

    context.close().unwrap();
    assert_eq!(log.count("finalize", "b"), 1);
    assert_eq!(log.count("finalize", "a"), 2);
    assert_eq!(log.phase("dispose"), ["b", "a"]);
}

#[test]
fn test_create_error_surfaces_as_guest_error() {
    let log = EventLog::default();
    let registry =
        registry([TestLanguage::new("a", &log).on_create(|_| Err(anyhow::anyhow!("no memory")))]);
    let context = Context::builder().registry(registry).build().unwrap();

    let err = context.initialize("a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guest);
    assert_eq!(err.to_string(), "Error in language 'a': no memory");
    assert_eq!(context.snapshot().state_of("a"), SlotState::Uncreated);

    context.close().unwrap();
    assert_eq!(log.count("dispose", "a"), 0);
}

#[test]
fn test_guest_error_from_eval() {
    let log = EventLog::default();
    let context = Context::builder().registry(common::abc(&log)).build().unwrap();

    let err = context.eval("a", "fail").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guest);
    assert_eq!(err.to_string(), "Error in language 'a': guest failure");
}

#[test]
fn test_threads_initialized_and_disposed() {
    let log = EventLog::default();
    let context = Context::builder().registry(common::abc(&log)).build().unwrap();
    context.initialize("a").unwrap();

    let worker = context.clone();
    std::thread::spawn(move || worker.eval("a", "x").unwrap()).join().unwrap();

    assert_eq!(log.count("initialize_thread", "a"), 2);
    context.close().unwrap();
    assert_eq!(log.count("dispose_thread", "a"), 2);
}
