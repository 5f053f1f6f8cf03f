//! Entering and leaving a context

use std::sync::Arc;
use std::time::Instant;

use crate::env::Env;
use crate::error::PolyglotError;
use crate::language::{Language, LanguageState};
use crate::slot::SlotState;
use crate::thread_local::{ContextId, ThreadKey};

use super::threads::ThreadDisposal;
use super::{Context, ContextInner, ContextShared, Lifecycle, NOT_ENTERED_EXPLICITLY, ThreadInfo};

type PendingCallback = (String, Arc<dyn Language>, LanguageState);

/// Callbacks owed by a thread that just entered
#[derive(Default)]
struct EnterWork {
    /// Threads that exited since they last left
    exited: Vec<ThreadDisposal>,
    multi_threading: Vec<PendingCallback>,
    new_thread: Vec<PendingCallback>,
}

pub(crate) fn thread_access_error(
    thread: ThreadKey,
    single_threaded: bool,
    languages: &[String],
) -> PolyglotError {
    let mode = if single_threaded { "Single" } else { "Multi" };
    PolyglotError::ThreadAccess(format!(
        "{mode} threaded access requested by thread {thread} but is not allowed for \
         language(s) {}.",
        languages.join(", ")
    ))
}

impl ContextShared {
    /// Initialized languages refusing access of `threads` in the given mode
    fn denied_languages(
        inner: &ContextInner,
        threads: &[ThreadKey],
        single_threaded: bool,
    ) -> Vec<String> {
        inner
            .slots
            .iter()
            .filter(|slot| {
                slot.state() >= SlotState::Created && slot.state() < SlotState::Finalized
            })
            .filter(|slot| {
                threads
                    .iter()
                    .any(|thread| !slot.instance.is_thread_access_allowed(*thread, single_threaded))
            })
            .map(|slot| slot.id.clone())
            .collect()
    }

    /// Bind the calling thread to this context. Returns the binding it
    /// displaced, to be handed back to [`Self::leave`].
    pub(crate) fn enter(self: &Arc<Self>) -> Result<Option<ContextId>, PolyglotError> {
        let me = ThreadKey::current();
        let poll = self.engine.config.close_poll_interval();
        let deadline = Instant::now() + self.engine.config.thread_access_timeout();

        let work = {
            let mut inner = self.inner.lock();
            loop {
                self.check_enterable(&inner, me)?;

                let known = inner.threads.contains_key(&me);
                let others = inner.other_active_threads(me);
                let transition = inner.single_threaded && !others.is_empty();
                let single_threaded = inner.single_threaded && !transition;

                let closer = inner.closing_thread == Some(me);
                if (transition || !known) && !closer {
                    let mut checked = vec![me];
                    if transition {
                        checked.extend(others.iter().copied());
                    }
                    let denied = Self::denied_languages(&inner, &checked, single_threaded);
                    if !denied.is_empty() {
                        let now = Instant::now();
                        if transition && now < deadline {
                            // wait for exclusive access
                            self.changed.wait_until(&mut inner, deadline.min(now + poll));
                            continue;
                        }
                        tracing::debug!(
                            context = %self.id,
                            thread = %me,
                            ?denied,
                            "thread access denied"
                        );
                        return Err(thread_access_error(me, single_threaded, &denied));
                    }
                }

                break self.register_entry(&mut inner, me, known, transition);
            }
        };

        let previous = self.engine.local.push(self.id);
        if let Err(error) = self.run_enter_callbacks(me, work) {
            if let Err(leave_error) = self.leave(previous) {
                tracing::error!(
                    context = %self.id,
                    %leave_error,
                    "failed to leave after enter error"
                );
            }
            return Err(error);
        }
        Ok(previous)
    }

    fn register_entry(
        &self,
        inner: &mut ContextInner,
        me: ThreadKey,
        known: bool,
        transition: bool,
    ) -> EnterWork {
        let mut work = EnterWork::default();

        if !known && inner.lifecycle == Lifecycle::Open {
            for exited in inner.exited_threads() {
                tracing::debug!(context = %self.id, thread = %exited, "forgetting exited thread");
                work.exited.extend(inner.release_thread_slots(exited));
                inner.forget_thread(exited);
            }
        }

        if transition {
            inner.single_threaded = false;
            tracing::debug!(context = %self.id, thread = %me, "context is now multi-threaded");
            for slot in inner.slots.iter_mut() {
                if slot.state().is_initialized() && !slot.multi_threading_initialized {
                    slot.multi_threading_initialized = true;
                    if let Ok(state) = slot.language_state() {
                        let instance = Arc::clone(&slot.instance);
                        work.multi_threading.push((slot.id.clone(), instance, state));
                    }
                }
            }
        }

        if !known {
            tracing::debug!(context = %self.id, thread = %me, "context entered by a new thread");
            for slot in inner.slots.iter_mut() {
                let state = slot.state();
                let live = state >= SlotState::ThreadInitialized && state < SlotState::Finalized;
                if live && !slot.threads.contains(&me) {
                    slot.threads.push(me);
                    if let Ok(language_state) = slot.language_state() {
                        let instance = Arc::clone(&slot.instance);
                        work.new_thread.push((slot.id.clone(), instance, language_state));
                    }
                }
            }
        }

        inner
            .threads
            .entry(me)
            .or_insert_with(ThreadInfo::current)
            .enter_count += 1;
        work
    }

    fn run_enter_callbacks(
        self: &Arc<Self>,
        me: ThreadKey,
        work: EnterWork,
    ) -> Result<(), PolyglotError> {
        self.dispose_threads(work.exited);
        for (id, instance, state) in work.multi_threading {
            let env = Env::new(Arc::clone(self), &id, Arc::clone(&instance));
            instance
                .initialize_multi_threading(&env, &state)
                .map_err(|error| PolyglotError::from_guest(&id, error))?;
        }
        for (id, instance, state) in work.new_thread {
            let env = Env::new(Arc::clone(self), &id, Arc::clone(&instance));
            tracing::debug!(
                context = %self.id,
                language = %id,
                thread = %me,
                "initializing thread"
            );
            instance
                .initialize_thread(&env, &state, me)
                .map_err(|error| PolyglotError::from_guest(&id, error))?;
        }
        Ok(())
    }

    /// Undo one [`Self::enter`], restoring `previous` as the current binding
    pub(crate) fn leave(&self, previous: Option<ContextId>) -> Result<(), PolyglotError> {
        if self.engine.local.get() != Some(self.id) {
            tracing::error!(context = %self.id, "leave without matching enter");
            return Err(PolyglotError::enter_leave_mismatch());
        }

        let me = ThreadKey::current();
        {
            let mut inner = self.inner.lock();
            let Some(info) = inner.threads.get_mut(&me).filter(|info| info.is_active()) else {
                tracing::error!(
                    context = %self.id,
                    thread = %me,
                    "leave on a thread that did not enter"
                );
                return Err(PolyglotError::enter_leave_mismatch());
            };
            info.enter_count -= 1;
            if !info.is_active() {
                self.changed.notify_all();
            }
        }
        self.engine.local.restore(previous);
        Ok(())
    }

    /// Enter unless the current thread is already inside this context
    pub(crate) fn enter_if_needed(self: &Arc<Self>) -> Result<Option<Entered>, PolyglotError> {
        if self.engine.local.get() == Some(self.id) {
            return Ok(None);
        }
        let previous = self.enter()?;
        Ok(Some(Entered {
            context: Arc::clone(self),
            previous,
        }))
    }

    pub(crate) fn enter_explicit(self: &Arc<Self>) -> Result<(), PolyglotError> {
        let previous = self.enter()?;
        let me = ThreadKey::current();
        if let Some(info) = self.inner.lock().threads.get_mut(&me) {
            info.explicit.push(previous);
        }
        Ok(())
    }

    pub(crate) fn leave_explicit(&self) -> Result<(), PolyglotError> {
        let me = ThreadKey::current();
        let previous = {
            let mut inner = self.inner.lock();
            match inner.threads.get_mut(&me).and_then(|info| info.explicit.pop()) {
                Some(previous) => previous,
                None => return Err(PolyglotError::Lifecycle(NOT_ENTERED_EXPLICITLY.to_string())),
            }
        };

        if let Err(error) = self.leave(previous) {
            if let Some(info) = self.inner.lock().threads.get_mut(&me) {
                info.explicit.push(previous);
            }
            return Err(error);
        }
        Ok(())
    }
}

/// Implicit enter held for the duration of one operation
pub(crate) struct Entered {
    context: Arc<ContextShared>,
    previous: Option<ContextId>,
}

impl Drop for Entered {
    fn drop(&mut self) {
        if let Err(error) = self.context.leave(self.previous) {
            tracing::error!(context = %self.context.id, %error, "failed to leave context");
        }
    }
}

/// Explicit enter that is left when dropped. See [`Context::enter_scoped`].
#[must_use = "the context is left as soon as the scope is dropped"]
#[derive(Debug)]
pub struct ContextScope {
    context: Context,
}

impl ContextScope {
    pub(crate) fn new(context: Context) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Err(error) = self.context.leave() {
            tracing::error!(
                context = %self.context.id(),
                %error,
                "failed to leave scoped context"
            );
        }
    }
}
