//! Polyglot Context
//!
//! A context owns one [`LanguageContextSlot`] per language it has touched and
//! drives each of them through its lifecycle: creation and initialization in
//! dependency order, multi-threading activation, finalization and disposal in
//! reverse creation order.
//!
//! A context may own inner contexts created by its languages and threads
//! started by them. Both are torn down before the context's own languages.
//!
//! All bookkeeping lives behind a single mutex. Language callbacks are never
//! invoked while it is held; instead a slot is marked busy by the thread
//! running its current phase and other threads wait on the condition
//! variable.

mod builder;
mod close;
mod enter;
mod lifecycle;
mod threads;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, Thread};

use parking_lot::{Condvar, Mutex};
use polyglot_security::{AccessPolicy, Requester};
use serde::Serialize;

pub use builder::ContextBuilder;
pub use enter::ContextScope;

use crate::bindings::Bindings;
use crate::cancel::CancelFlag;
use crate::engine::{Engine, EngineShared};
use crate::env::{Env, Executable};
use crate::error::PolyglotError;
use crate::inspect::{ContextSnapshot, LanguageSnapshot};
use crate::language::{Source, Value};
use crate::slot::LanguageContextSlot;
use crate::thread_local::{ContextId, ThreadKey};

pub(crate) const EXECUTING_ON_OTHER_THREAD: &str = "The context is currently executing on another \
    thread. Set cancel to true to stop the execution on this thread.";
const EXPLICITLY_ENTERED: &str = "The context is explicitly entered on the current thread. Call \
    leave() before closing the context to resolve this.";
const NOT_ENTERED_EXPLICITLY: &str = "The context is not entered explicitly. A context can only be \
    left if it was previously entered.";

/// Open, closing and closed. Only moves forward, except that a failed
/// normal close reopens the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// Per-thread bookkeeping of a context
#[derive(Debug)]
pub(crate) struct ThreadInfo {
    pub(crate) handle: Thread,
    /// Nesting depth of enters on this thread, explicit and implicit
    pub(crate) enter_count: usize,
    /// Bindings displaced by explicit enters, innermost last
    pub(crate) explicit: Vec<Option<ContextId>>,
    /// Dangles once the thread has exited
    alive: Weak<()>,
}

impl ThreadInfo {
    fn current() -> Self {
        Self {
            handle: std::thread::current(),
            enter_count: 0,
            explicit: Vec::new(),
            alive: ThreadKey::liveness(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.enter_count > 0
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.alive.strong_count() == 0
    }
}

#[derive(Debug)]
pub(crate) struct ContextInner {
    pub(crate) lifecycle: Lifecycle,
    /// The thread that won the close race
    pub(crate) closing_thread: Option<ThreadKey>,
    /// Set once finalization is over; no new work is accepted
    pub(crate) disposing: bool,
    pub(crate) cancelling: bool,
    pub(crate) single_threaded: bool,
    /// Slots in creation order
    pub(crate) slots: Vec<LanguageContextSlot>,
    /// Languages whose `create_context` is running, with the creating thread
    pub(crate) creating: Vec<(String, ThreadKey)>,
    pub(crate) threads: HashMap<ThreadKey, ThreadInfo>,
    /// Inner contexts created by languages, closed before this one
    pub(crate) children: Vec<Arc<ContextShared>>,
    /// Threads started through [`Env::create_thread`] that have not finished
    pub(crate) language_threads: HashSet<ThreadKey>,
    /// Language threads spawned but not running yet
    pub(crate) starting_threads: usize,
    pub(crate) thread_handles: Vec<JoinHandle<()>>,
}

impl ContextInner {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Open,
            closing_thread: None,
            disposing: false,
            cancelling: false,
            single_threaded: true,
            slots: Vec::new(),
            creating: Vec::new(),
            threads: HashMap::new(),
            children: Vec::new(),
            language_threads: HashSet::new(),
            starting_threads: 0,
            thread_handles: Vec::new(),
        }
    }

    pub(crate) fn slot_index(&self, id: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    pub(crate) fn slot(&self, id: &str) -> Option<&LanguageContextSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub(crate) fn slot_mut(&mut self, id: &str) -> Option<&mut LanguageContextSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    /// Threads other than `me` currently inside the context
    pub(crate) fn other_active_threads(&self, me: ThreadKey) -> Vec<ThreadKey> {
        let mut active: Vec<_> = self
            .threads
            .iter()
            .filter(|(key, info)| **key != me && info.is_active())
            .map(|(key, _)| *key)
            .collect();
        active.sort_unstable();
        active
    }

    /// Whether a language thread other than `me` has not finished yet
    pub(crate) fn language_threads_running(&self, me: ThreadKey) -> bool {
        self.starting_threads > 0 || self.language_threads.iter().any(|key| *key != me)
    }

    /// All threads known to the context, `me` first
    pub(crate) fn known_threads(&self, me: ThreadKey) -> Vec<ThreadKey> {
        let mut others: Vec<_> = self.threads.keys().copied().filter(|key| *key != me).collect();
        others.sort_unstable();
        let mut known = Vec::with_capacity(others.len() + 1);
        if self.threads.contains_key(&me) {
            known.push(me);
        }
        known.extend(others);
        known
    }
}

pub(crate) struct ContextShared {
    pub(crate) id: ContextId,
    pub(crate) engine: Arc<EngineShared>,
    /// Set for inner contexts
    pub(crate) parent: Option<Weak<ContextShared>>,
    /// Close the engine together with this context
    pub(crate) owns_engine: bool,
    pub(crate) policy: AccessPolicy,
    pub(crate) inner: Mutex<ContextInner>,
    pub(crate) changed: Condvar,
    pub(crate) cancel: CancelFlag,
    /// Mirrors `Lifecycle::Closed` for lock-free checks and binding handles
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) polyglot_bindings: Bindings,
}

impl fmt::Debug for ContextShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextShared")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ContextShared {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        policy: AccessPolicy,
        parent: Option<Weak<ContextShared>>,
    ) -> Arc<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let owns_engine = parent.is_none() && engine.bound;
        Arc::new(Self {
            id: ContextId::next(),
            engine,
            parent,
            owns_engine,
            policy,
            inner: Mutex::new(ContextInner::new()),
            changed: Condvar::new(),
            cancel: CancelFlag::default(),
            polyglot_bindings: Bindings::new(Arc::clone(&closed)),
            closed,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_access(
        &self,
        requester: Requester<'_>,
        target: &str,
    ) -> Result<(), PolyglotError> {
        self.policy
            .check_language_access(&self.engine.registry, requester, target)
            .map_err(PolyglotError::from)
    }

    /// Whether `me` may enter at all
    pub(crate) fn check_enterable(
        &self,
        inner: &ContextInner,
        me: ThreadKey,
    ) -> Result<(), PolyglotError> {
        let closer = inner.closing_thread == Some(me);
        match inner.lifecycle {
            Lifecycle::Closed => Err(PolyglotError::ContextClosed),
            Lifecycle::Closing if !closer => Err(PolyglotError::ContextClosed),
            _ if inner.cancelling && !closer => Err(PolyglotError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Whether `me` may start new guest work: initialize languages, parse or run code
    pub(crate) fn check_running(
        &self,
        inner: &ContextInner,
        me: ThreadKey,
    ) -> Result<(), PolyglotError> {
        self.check_enterable(inner, me)?;
        if inner.disposing {
            return Err(PolyglotError::ContextClosed);
        }
        self.cancel.check()
    }

    /// Environment of an existing slot
    pub(crate) fn env_for(self: &Arc<Self>, language: &str) -> Result<Env, PolyglotError> {
        let inner = self.inner.lock();
        match inner.slot(language) {
            Some(slot) if slot.state() < crate::slot::SlotState::Disposed => {
                Ok(Env::new(Arc::clone(self), language, Arc::clone(&slot.instance)))
            }
            Some(_) => Err(PolyglotError::ContextClosed),
            None => Err(PolyglotError::Internal(format!(
                "Language '{language}' has no context in {}.",
                self.id
            ))),
        }
    }

    /// Initialize the source's language and parse it, on behalf of `requester`
    pub(crate) fn parse(
        self: &Arc<Self>,
        requester: Requester<'_>,
        source: &Source,
    ) -> Result<Executable, PolyglotError> {
        let language = source.language();
        self.check_access(requester, language)?;
        let _entered = self.enter_if_needed()?;
        self.ensure_initialized(language)?;

        let env = self.env_for(language)?;
        {
            let inner = self.inner.lock();
            self.check_running(&inner, ThreadKey::current())?;
        }
        let code = env
            .instance()
            .parse(&env, source)
            .map_err(|error| PolyglotError::from_guest(language, error))?;
        Ok(Executable::new(env, code, source.name()))
    }

    /// Per-language bindings, initializing the language first
    pub(crate) fn language_bindings(
        self: &Arc<Self>,
        requester: Requester<'_>,
        language: &str,
    ) -> Result<Bindings, PolyglotError> {
        self.check_access(requester, language)?;
        let _entered = self.enter_if_needed()?;
        self.ensure_initialized(language)?;

        let inner = self.inner.lock();
        inner
            .slot(language)
            .map(|slot| slot.bindings.clone())
            .ok_or(PolyglotError::ContextClosed)
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.lock();
        ContextSnapshot {
            id: self.id.as_u64(),
            lifecycle: inner.lifecycle,
            single_threaded: inner.single_threaded,
            cancelling: inner.cancelling,
            languages: inner
                .slots
                .iter()
                .map(|slot| LanguageSnapshot {
                    id: slot.id.clone(),
                    state: slot.state(),
                    initialized_threads: slot.threads.len(),
                })
                .collect(),
            known_threads: inner.threads.len(),
            active_threads: inner.threads.values().filter(|info| info.is_active()).count(),
            language_threads: inner.language_threads.len() + inner.starting_threads,
            inner_contexts: inner.children.len(),
        }
    }
}

/// Handle to a polyglot context. Clones share the same context.
#[derive(Clone)]
pub struct Context {
    pub(crate) shared: Arc<ContextShared>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&self.shared.id).finish()
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn engine(&self) -> Engine {
        Engine {
            shared: Arc::clone(&self.shared.engine),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Initialize a language and its dependencies. Returns `true` if the
    /// language was initialized by this call, `false` if it already was.
    pub fn initialize(&self, language: &str) -> Result<bool, PolyglotError> {
        self.shared.check_access(Requester::Host, language)?;
        let _entered = self.shared.enter_if_needed()?;
        self.shared.ensure_initialized(language)
    }

    pub fn parse(&self, source: &Source) -> Result<Executable, PolyglotError> {
        self.shared.parse(Requester::Host, source)
    }

    pub fn eval_source(&self, source: &Source) -> Result<Value, PolyglotError> {
        self.parse(source)?.execute(&[])
    }

    pub fn eval(&self, language: &str, code: &str) -> Result<Value, PolyglotError> {
        self.eval_source(&Source::new(language, code))
    }

    /// Top-level symbols of a language
    pub fn bindings(&self, language: &str) -> Result<Bindings, PolyglotError> {
        self.shared.language_bindings(Requester::Host, language)
    }

    /// The namespace shared between languages with bindings access
    pub fn polyglot_bindings(&self) -> Result<Bindings, PolyglotError> {
        if self.is_closed() {
            return Err(PolyglotError::ContextClosed);
        }
        Ok(self.shared.polyglot_bindings.clone())
    }

    /// Enter the context on the current thread until the matching [`Self::leave`]
    pub fn enter(&self) -> Result<(), PolyglotError> {
        self.shared.enter_explicit()
    }

    pub fn leave(&self) -> Result<(), PolyglotError> {
        self.shared.leave_explicit()
    }

    /// Enter the context until the returned scope is dropped
    pub fn enter_scoped(&self) -> Result<ContextScope, PolyglotError> {
        self.enter()?;
        Ok(ContextScope::new(self.clone()))
    }

    /// Close the context, finalizing and disposing every language.
    ///
    /// Waits if another thread is closing it already. Fails if the context
    /// is still executing on another thread.
    pub fn close(&self) -> Result<(), PolyglotError> {
        match self.shared.close(false)? {
            true => Ok(()),
            false => Err(PolyglotError::Lifecycle(EXECUTING_ON_OTHER_THREAD.to_string())),
        }
    }

    /// Cancel running guest code on every thread, then close
    pub fn close_cancel(&self) -> Result<(), PolyglotError> {
        self.shared.close(true).map(|_| ())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.shared.snapshot()
    }
}
