//! Close protocol
//!
//! Any number of threads may close a context concurrently. The first one to
//! find no other thread executing becomes the closing thread and performs
//! the teardown; everybody else waits for it and then observes the closed
//! context. A cancelling close interrupts executing threads first, including
//! a closing thread stuck in a language callback, and waits for them to
//! leave, bounded by the configured cancel timeout.
//!
//! Threads started by languages do not make a normal close fail. The close
//! waits for them to finish instead. Inner contexts are closed before any
//! language of their parent is finalized.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::env::Env;
use crate::error::PolyglotError;
use crate::slot::SlotState;
use crate::thread_local::ThreadKey;

use super::{ContextInner, ContextShared, EXECUTING_ON_OTHER_THREAD, EXPLICITLY_ENTERED, Lifecycle};

impl ContextShared {
    /// Close the context. `Ok(false)` means a normal close found the context
    /// executing on another thread and did nothing.
    pub(crate) fn close(self: &Arc<Self>, cancel: bool) -> Result<bool, PolyglotError> {
        let me = ThreadKey::current();
        let config = &self.engine.config;
        let poll = config.close_poll_interval();
        let started = Instant::now();
        let mut rounds: u32 = 0;

        let cancelling = {
            let mut inner = self.inner.lock();
            loop {
                if inner.lifecycle == Lifecycle::Closed {
                    return Ok(true);
                }
                if let Some(closer) = inner.closing_thread {
                    if closer == me {
                        // close from inside the teardown
                        return Ok(true);
                    }
                    if cancel {
                        self.begin_cancel(&mut inner, me);
                        if started.elapsed() >= config.cancel_timeout() {
                            tracing::error!(
                                context = %self.id,
                                %closer,
                                "closing thread did not respond to cancellation"
                            );
                            return Err(PolyglotError::Internal(format!(
                                "Cancelling {} timed out after {:?}; {closer} is still closing it.",
                                self.id,
                                config.cancel_timeout()
                            )));
                        }
                    }
                    rounds += 1;
                    if rounds % config.escalation_rounds() == 0 {
                        tracing::warn!(
                            context = %self.id,
                            %closer,
                            waited = ?started.elapsed(),
                            "still waiting for another thread to finish closing"
                        );
                        if cancel {
                            self.interrupt(&inner, me);
                        }
                    }
                    self.changed.wait_for(&mut inner, poll);
                    continue;
                }
                if inner.threads.get(&me).is_some_and(|info| !info.explicit.is_empty()) {
                    return Err(PolyglotError::Lifecycle(EXPLICITLY_ENTERED.to_string()));
                }
                if cancel {
                    self.begin_cancel(&mut inner, me);
                }

                let others = inner.other_active_threads(me);
                let embedder: Vec<_> = others
                    .iter()
                    .copied()
                    .filter(|key| !inner.language_threads.contains(key))
                    .collect();
                if !cancel && !embedder.is_empty() {
                    return Ok(false);
                }
                if !others.is_empty() || inner.language_threads_running(me) {
                    if cancel && started.elapsed() >= config.cancel_timeout() {
                        tracing::error!(
                            context = %self.id,
                            threads = ?others,
                            "threads did not respond to cancellation"
                        );
                        return Err(PolyglotError::Internal(format!(
                            "Cancelling {} timed out after {:?}; threads still executing: {}.",
                            self.id,
                            config.cancel_timeout(),
                            others.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                        )));
                    }
                    rounds += 1;
                    if rounds % config.escalation_rounds() == 0 {
                        if cancel {
                            tracing::warn!(
                                context = %self.id,
                                threads = ?others,
                                "threads did not respond to cancellation yet, interrupting again"
                            );
                            self.interrupt(&inner, me);
                        } else {
                            tracing::warn!(
                                context = %self.id,
                                threads = ?others,
                                waited = ?started.elapsed(),
                                "still waiting for language threads to finish"
                            );
                        }
                    }
                    self.changed.wait_for(&mut inner, poll);
                    continue;
                }

                inner.closing_thread = Some(me);
                inner.lifecycle = Lifecycle::Closing;
                break inner.cancelling;
            }
        };

        tracing::info!(context = %self.id, cancel = cancelling, "closing context");
        let outcome = self.enter().and_then(|previous| {
            let outcome = self.teardown(cancelling);
            let left = self.leave(previous);
            let dispose_error = outcome?;
            left?;
            Ok(dispose_error)
        });

        let mut inner = self.inner.lock();
        inner.closing_thread = None;
        let dispose_error = match outcome {
            Ok(dispose_error) => {
                inner.lifecycle = Lifecycle::Closed;
                self.closed.store(true, Ordering::Release);
                dispose_error
            }
            Err(error) => {
                // finalization failed, the context stays usable
                inner.lifecycle = Lifecycle::Open;
                inner.disposing = false;
                self.changed.notify_all();
                drop(inner);
                tracing::warn!(context = %self.id, %error, "close aborted");
                return Err(error);
            }
        };
        self.changed.notify_all();
        drop(inner);

        self.join_language_threads();
        self.polyglot_bindings.clear();
        self.engine.unregister_context(self.id);
        if let Some(parent) = self.parent.as_ref().and_then(|parent| parent.upgrade()) {
            parent.remove_child(self);
        }
        tracing::info!(context = %self.id, "context closed");

        if self.owns_engine {
            self.engine.close(cancel)?;
        }
        dispose_error.map_or(Ok(true), Err)
    }

    /// Raise the cancel flag of this context and its inner contexts, and
    /// wake every thread executing in them
    fn begin_cancel(&self, inner: &mut ContextInner, me: ThreadKey) {
        if !inner.cancelling {
            inner.cancelling = true;
            self.cancel.request();
            tracing::info!(context = %self.id, "cancelling context");
            self.interrupt(inner, me);
            for child in &inner.children {
                let mut child_inner = child.inner.lock();
                child.begin_cancel(&mut child_inner, me);
            }
        }
    }

    /// Wake every other active thread so that blocked guest code observes
    /// the cancel flag
    fn interrupt(&self, inner: &ContextInner, me: ThreadKey) {
        for (key, info) in &inner.threads {
            if *key != me && info.is_active() {
                info.handle.unpark();
            }
        }
    }

    /// Whether finalization errors are ignored. A close that started out
    /// normal turns into a cancelling one when cancel is requested meanwhile.
    fn is_cancelling(&self, cancelling: bool) -> bool {
        cancelling || self.inner.lock().cancelling
    }

    /// Close inner contexts, then finalize until no initialized language is
    /// left, then dispose everything in reverse creation order.
    ///
    /// Err: an inner context or a finalize callback failed during a normal
    /// close; nothing was disposed. Ok(Some): the context is torn down but a
    /// dispose callback broke its contract.
    fn teardown(
        self: &Arc<Self>,
        cancelling: bool,
    ) -> Result<Option<PolyglotError>, PolyglotError> {
        self.close_children(cancelling)?;

        loop {
            let pending: Vec<String> = {
                let mut inner = self.inner.lock();
                let pending: Vec<String> = inner
                    .slots
                    .iter()
                    .rev()
                    .filter(|slot| slot.state() == SlotState::ContextInitialized)
                    .map(|slot| slot.id.clone())
                    .collect();
                if pending.is_empty() {
                    inner.disposing = true;
                }
                pending
            };
            if pending.is_empty() {
                break;
            }
            for id in &pending {
                self.finalize_slot(id, cancelling)?;
            }
        }

        let order: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .rev()
                .filter(|slot| slot.state() < SlotState::Disposed)
                .map(|slot| slot.id.clone())
                .collect()
        };

        let mut first_error = None;
        for id in &order {
            if let Some(error) = self.dispose_slot(id) {
                first_error.get_or_insert(error);
            }
        }
        Ok(first_error)
    }

    fn close_children(self: &Arc<Self>, cancelling: bool) -> Result<(), PolyglotError> {
        let children = self.inner.lock().children.clone();
        for child in children {
            let cancel = self.is_cancelling(cancelling);
            tracing::debug!(context = %self.id, inner = %child.id, cancel, "closing inner context");
            let result = match child.close(cancel) {
                Ok(true) => Ok(()),
                Ok(false) => Err(PolyglotError::Lifecycle(EXECUTING_ON_OTHER_THREAD.to_string())),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                if !self.is_cancelling(cancelling) {
                    return Err(error);
                }
                tracing::warn!(
                    context = %self.id,
                    inner = %child.id,
                    %error,
                    "inner context failed to close during cancellation"
                );
            }
        }
        Ok(())
    }

    fn finalize_slot(self: &Arc<Self>, id: &str, cancelling: bool) -> Result<(), PolyglotError> {
        let (instance, state) = {
            let inner = self.inner.lock();
            match inner.slot(id) {
                Some(slot) if slot.state() == SlotState::ContextInitialized => {
                    (Arc::clone(&slot.instance), slot.language_state()?)
                }
                _ => return Ok(()),
            }
        };

        tracing::debug!(context = %self.id, language = id, "finalizing language context");
        let env = Env::new(Arc::clone(self), id, Arc::clone(&instance));
        if let Err(error) = instance.finalize_context(&env, &state) {
            let error = PolyglotError::from_guest(id, error);
            if !self.is_cancelling(cancelling) {
                return Err(error);
            }
            tracing::warn!(
                context = %self.id,
                language = id,
                %error,
                "finalization failed during cancellation"
            );
        }

        match self.inner.lock().slot_mut(id) {
            Some(slot) => slot.advance(SlotState::Finalized),
            None => Ok(()),
        }
    }

    fn dispose_slot(self: &Arc<Self>, id: &str) -> Option<PolyglotError> {
        let (instance, state, threads) = {
            let inner = self.inner.lock();
            let slot = inner.slot(id)?;
            (Arc::clone(&slot.instance), slot.language_state().ok(), slot.threads.clone())
        };

        tracing::debug!(context = %self.id, language = id, "disposing language context");
        let env = Env::new(Arc::clone(self), id, Arc::clone(&instance));
        let mut failure = None;
        if let Some(state) = &state {
            for thread in threads {
                if let Err(error) = instance.dispose_thread(&env, state, thread) {
                    let error = PolyglotError::contract_violation(id, "dispose_thread", error);
                    failure.get_or_insert(error);
                }
            }
            if let Err(error) = instance.dispose_context(&env, state) {
                let error = PolyglotError::contract_violation(id, "dispose_context", error);
                failure.get_or_insert(error);
            }
        }

        let transition = match self.inner.lock().slot_mut(id) {
            Some(slot) => {
                slot.bindings.clear();
                if slot.state() == SlotState::Finalized {
                    slot.advance(SlotState::Disposed)
                } else {
                    slot.abandon()
                }
            }
            None => Ok(()),
        };
        if let Err(error) = transition {
            failure.get_or_insert(error);
        }
        drop(env);
        self.engine.release_instance(id, instance);

        if let Some(error) = &failure {
            tracing::error!(
                context = %self.id,
                language = id,
                %error,
                "language violated the dispose contract"
            );
        }
        failure
    }
}
