//! Inner contexts and threads
//!
//! Languages may create inner contexts on the engine of their own context
//! and start threads that run inside it. Both belong to the creating
//! context: its close tears them down before any of its own languages is
//! finalized.
//!
//! Per-thread state is dropped once a thread is gone. Language threads do
//! that themselves when their body returns; threads of the embedder are
//! swept the next time a new thread enters.

use std::sync::Arc;
use std::thread;

use crate::env::Env;
use crate::error::{GuestResult, PolyglotError};
use crate::language::{Language, LanguageState};
use crate::slot::SlotState;
use crate::thread_local::ThreadKey;

use super::{Context, ContextInner, ContextShared, Lifecycle, ThreadInfo};

/// A `dispose_thread` callback owed for a thread that is gone
pub(crate) type ThreadDisposal = (String, Arc<dyn Language>, LanguageState, ThreadKey);

impl ContextInner {
    /// Inactive threads whose OS thread has exited
    pub(crate) fn exited_threads(&self) -> Vec<ThreadKey> {
        self.threads
            .iter()
            .filter(|(_, info)| !info.is_active() && info.has_exited())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Remove `thread` from every initialized language and return the
    /// callbacks that dispose it. Languages still initializing keep it and
    /// dispose it with the context.
    pub(crate) fn release_thread_slots(&mut self, thread: ThreadKey) -> Vec<ThreadDisposal> {
        let mut owed = Vec::new();
        for slot in &mut self.slots {
            if slot.state() != SlotState::ContextInitialized || slot.busy.is_some() {
                continue;
            }
            let Some(position) = slot.threads.iter().position(|key| *key == thread) else {
                continue;
            };
            slot.threads.remove(position);
            if let Ok(state) = slot.language_state() {
                owed.push((slot.id.clone(), Arc::clone(&slot.instance), state, thread));
            }
        }
        owed
    }

    /// Drop the bookkeeping of `thread`. Its enter record survives while it
    /// is still inside the context.
    pub(crate) fn forget_thread(&mut self, thread: ThreadKey) {
        self.language_threads.remove(&thread);
        if !self.threads.get(&thread).is_some_and(ThreadInfo::is_active) {
            self.threads.remove(&thread);
        }
    }
}

impl ContextShared {
    pub(crate) fn dispose_threads(self: &Arc<Self>, owed: Vec<ThreadDisposal>) {
        for (id, instance, state, thread) in owed {
            tracing::debug!(context = %self.id, language = %id, %thread, "disposing thread");
            let env = Env::new(Arc::clone(self), &id, Arc::clone(&instance));
            if let Err(error) = instance.dispose_thread(&env, &state, thread) {
                let error = PolyglotError::contract_violation(&id, "dispose_thread", error);
                tracing::error!(
                    context = %self.id,
                    language = %id,
                    %error,
                    "language violated the dispose contract"
                );
            }
        }
    }

    /// Create a context on the same engine that is closed together with
    /// this one
    pub(crate) fn create_inner(self: &Arc<Self>) -> Result<Context, PolyglotError> {
        let child = ContextShared::new(
            Arc::clone(&self.engine),
            self.policy.clone(),
            Some(Arc::downgrade(self)),
        );
        self.engine.register_context(&child)?;

        let registered = {
            let mut inner = self.inner.lock();
            if inner.lifecycle == Lifecycle::Open {
                self.check_running(&inner, ThreadKey::current())
                    .map(|()| inner.children.push(Arc::clone(&child)))
            } else {
                Err(PolyglotError::ContextClosed)
            }
        };
        if let Err(error) = registered {
            self.engine.unregister_context(child.id);
            return Err(error);
        }

        tracing::debug!(context = %self.id, inner = %child.id, "inner context created");
        Ok(Context { shared: child })
    }

    /// Forget a closed inner context
    pub(crate) fn remove_child(&self, child: &ContextShared) {
        self.inner.lock().children.retain(|existing| existing.id != child.id);
        self.changed.notify_all();
    }

    /// Start a thread that runs `body` inside this context
    pub(crate) fn spawn_language_thread<F>(
        self: &Arc<Self>,
        env: Env,
        body: F,
    ) -> Result<(), PolyglotError>
    where
        F: FnOnce(&Env) -> GuestResult<()> + Send + 'static,
    {
        let name = format!("polyglot-{}-{}", env.language_id(), self.id.as_u64());
        let mut inner = self.inner.lock();
        if inner.lifecycle != Lifecycle::Open || inner.disposing {
            return Err(PolyglotError::ContextClosed);
        }
        self.check_running(&inner, ThreadKey::current())?;

        inner.thread_handles.retain(|handle| !handle.is_finished());
        let context = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || context.run_language_thread(&env, body))
            .map_err(|error| {
                PolyglotError::Internal(format!("Failed to start a language thread: {error}."))
            })?;
        inner.starting_threads += 1;
        inner.thread_handles.push(handle);
        Ok(())
    }

    fn run_language_thread<F>(self: &Arc<Self>, env: &Env, body: F)
    where
        F: FnOnce(&Env) -> GuestResult<()>,
    {
        let me = ThreadKey::current();
        let _registered = LanguageThread::register(self, me);

        let result = self.enter_if_needed().and_then(|entered| {
            tracing::debug!(context = %self.id, thread = %me, "language thread started");
            let outcome = body(env)
                .map_err(|error| PolyglotError::from_guest(env.language_id(), error));
            let owed = self.inner.lock().release_thread_slots(me);
            self.dispose_threads(owed);
            drop(entered);
            outcome
        });

        match result {
            Ok(()) => {
                tracing::debug!(context = %self.id, thread = %me, "language thread finished");
            }
            Err(error) if error.is_closed() || error.is_cancelled() => {
                tracing::debug!(
                    context = %self.id,
                    thread = %me,
                    %error,
                    "language thread stopped"
                );
            }
            Err(error) => {
                tracing::warn!(context = %self.id, thread = %me, %error, "language thread failed");
            }
        }
    }

    /// Wait for every language thread that already left the context
    pub(crate) fn join_language_threads(&self) {
        let handles = std::mem::take(&mut self.inner.lock().thread_handles);
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(context = %self.id, "language thread panicked");
            }
        }
    }
}

/// Marks the current thread as a language thread of `context` until dropped
struct LanguageThread<'a> {
    context: &'a ContextShared,
    thread: ThreadKey,
}

impl<'a> LanguageThread<'a> {
    fn register(context: &'a ContextShared, thread: ThreadKey) -> Self {
        let mut inner = context.inner.lock();
        inner.starting_threads = inner.starting_threads.saturating_sub(1);
        inner.language_threads.insert(thread);
        Self { context, thread }
    }
}

impl Drop for LanguageThread<'_> {
    fn drop(&mut self) {
        self.context.inner.lock().forget_thread(self.thread);
        self.context.changed.notify_all();
    }
}
