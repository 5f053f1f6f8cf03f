//! Language creation and initialization

use std::sync::Arc;

use crate::bindings::Bindings;
use crate::env::Env;
use crate::error::{ConfigError, PolyglotError};
use crate::slot::{LanguageContextSlot, SlotState};
use crate::thread_local::ThreadKey;

use super::ContextShared;
use super::enter::thread_access_error;

/// Outcome of trying to take a slot for initialization
enum Claim {
    /// Nothing to do: initialized already, or initializing on this thread
    Ready,
    /// The slot exists and is now busy with the calling thread
    Owned,
    /// No slot yet; the calling thread is registered as its creator
    Create,
}

fn lost_slot(id: &str) -> PolyglotError {
    PolyglotError::Internal(format!("Language '{id}' lost its context slot."))
}

impl ContextShared {
    /// Make `id` and its dependencies usable, dependencies first. Returns
    /// whether `id` itself was initialized by this call.
    ///
    /// The caller must have entered the context.
    pub(crate) fn ensure_initialized(self: &Arc<Self>, id: &str) -> Result<bool, PolyglotError> {
        let order = self.engine.registry.initialization_order(id)?;
        let mut initialized = false;
        for language in &order {
            initialized = self.ensure_slot_initialized(language)?;
        }
        Ok(initialized)
    }

    fn ensure_slot_initialized(self: &Arc<Self>, id: &str) -> Result<bool, PolyglotError> {
        let me = ThreadKey::current();
        match self.claim_slot(id, me)? {
            Claim::Ready => return Ok(false),
            Claim::Create => self.create_slot(id, me)?,
            Claim::Owned => {}
        }

        let result = self.initialize_slot(id, me);

        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slot_mut(id) {
            if slot.busy == Some(me) {
                slot.busy = None;
            }
        }
        self.changed.notify_all();
        drop(inner);

        result.map(|()| true)
    }

    fn claim_slot(&self, id: &str, me: ThreadKey) -> Result<Claim, PolyglotError> {
        let poll = self.engine.config.close_poll_interval();
        let mut inner = self.inner.lock();
        loop {
            self.check_running(&inner, me)?;

            if let Some(index) = inner.slot_index(id) {
                let (state, busy) = (inner.slots[index].state(), inner.slots[index].busy);
                if state >= SlotState::ContextInitialized {
                    return Ok(Claim::Ready);
                }
                match busy {
                    // used during its own initialization, e.g. by a dependency
                    Some(owner) if owner == me => return Ok(Claim::Ready),
                    Some(_) => {
                        self.changed.wait_for(&mut inner, poll);
                    }
                    None => {
                        inner.slots[index].busy = Some(me);
                        return Ok(Claim::Owned);
                    }
                }
                continue;
            }

            let creator = inner
                .creating
                .iter()
                .find(|(language, _)| language == id)
                .map(|(_, owner)| *owner);
            match creator {
                Some(owner) if owner == me => {
                    tracing::error!(
                        context = %self.id,
                        language = id,
                        "language used during its own creation"
                    );
                    return Err(ConfigError::CyclicCreation(id.to_string()).into());
                }
                Some(_) => {
                    self.changed.wait_for(&mut inner, poll);
                }
                None => {
                    inner.creating.push((id.to_string(), me));
                    return Ok(Claim::Create);
                }
            }
        }
    }

    /// Run `create_context` and store the new slot, busy with `me`
    fn create_slot(self: &Arc<Self>, id: &str, me: ThreadKey) -> Result<(), PolyglotError> {
        let instance = match self.engine.registry.get(id) {
            Some(registration) => self.engine.acquire_instance(registration),
            None => {
                self.finish_creating(id);
                return Err(PolyglotError::Internal(format!("Language '{id}' is not installed.")));
            }
        };

        tracing::debug!(context = %self.id, language = id, "creating language context");
        let env = Env::new(Arc::clone(self), id, Arc::clone(&instance));
        let created = instance.create_context(&env);

        let mut inner = self.inner.lock();
        inner.creating.retain(|(language, _)| language != id);
        self.changed.notify_all();
        match created {
            Ok(state) => {
                let bindings = Bindings::new(Arc::clone(&self.closed));
                let slot =
                    LanguageContextSlot::created(id.to_string(), instance, state, bindings, me);
                inner.slots.push(slot);
                tracing::debug!(context = %self.id, language = id, "language context created");
                Ok(())
            }
            Err(error) => {
                drop(inner);
                self.engine.release_instance(id, instance);
                Err(PolyglotError::from_guest(id, error))
            }
        }
    }

    fn finish_creating(&self, id: &str) {
        self.inner.lock().creating.retain(|(language, _)| language != id);
        self.changed.notify_all();
    }

    /// Drive a slot busy with `me` from `Created` or `ThreadInitialized`
    /// to `ContextInitialized`
    fn initialize_slot(self: &Arc<Self>, id: &str, me: ThreadKey) -> Result<(), PolyglotError> {
        let (instance, state, threads) = {
            let mut inner = self.inner.lock();
            let single_threaded = inner.single_threaded;
            let known = inner.known_threads(me);
            let Some(slot) = inner.slot_mut(id) else {
                return Err(lost_slot(id));
            };
            let instance = Arc::clone(&slot.instance);
            let state = slot.language_state()?;

            if slot.state() == SlotState::Created {
                if let Some(thread) = known
                    .iter()
                    .find(|thread| !instance.is_thread_access_allowed(**thread, single_threaded))
                {
                    return Err(thread_access_error(*thread, single_threaded, &[id.to_string()]));
                }
                slot.threads = known.clone();
                slot.advance(SlotState::ThreadInitialized)?;
                (instance, state, known)
            } else {
                (instance, state, Vec::new())
            }
        };

        let env = Env::new(Arc::clone(self), id, Arc::clone(&instance));
        for (done, thread) in threads.iter().enumerate() {
            tracing::debug!(
                context = %self.id,
                language = id,
                thread = %thread,
                "initializing thread"
            );
            if let Err(error) = instance.initialize_thread(&env, &state, *thread) {
                for initialized in &threads[..done] {
                    let rollback = instance.dispose_thread(&env, &state, *initialized);
                    if let Err(dispose_error) = rollback {
                        tracing::warn!(
                            language = id,
                            %dispose_error,
                            "failed to roll back thread initialization"
                        );
                    }
                }
                if let Some(slot) = self.inner.lock().slot_mut(id) {
                    slot.reset_threads();
                }
                return Err(PolyglotError::from_guest(id, error));
            }
        }

        instance
            .initialize_context(&env, &state)
            .map_err(|error| PolyglotError::from_guest(id, error))?;

        let multi_threading = {
            let mut inner = self.inner.lock();
            let single_threaded = inner.single_threaded;
            let Some(slot) = inner.slot_mut(id) else {
                return Err(lost_slot(id));
            };
            slot.advance(SlotState::ContextInitialized)?;
            let pending = !single_threaded && !slot.multi_threading_initialized;
            slot.multi_threading_initialized |= pending;
            pending
        };
        tracing::debug!(context = %self.id, language = id, "language context initialized");

        if multi_threading {
            instance
                .initialize_multi_threading(&env, &state)
                .map_err(|error| PolyglotError::from_guest(id, error))?;
        }
        Ok(())
    }
}
