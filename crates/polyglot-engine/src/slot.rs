//! Language context slot
//!
//! Per (context, language) record of the language instance, its state
//! object and how far its lifecycle has progressed. Slots are owned by the
//! context and only touched under the context lock; callbacks run outside
//! of it on cloned handles.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::bindings::Bindings;
use crate::error::PolyglotError;
use crate::language::{Language, LanguageState};
use crate::thread_local::ThreadKey;

/// Lifecycle of one language within one context. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Uncreated,
    Created,
    ThreadInitialized,
    ContextInitialized,
    Finalized,
    Disposed,
}

impl SlotState {
    fn successor(self) -> Option<Self> {
        match self {
            Self::Uncreated => Some(Self::Created),
            Self::Created => Some(Self::ThreadInitialized),
            Self::ThreadInitialized => Some(Self::ContextInitialized),
            Self::ContextInitialized => Some(Self::Finalized),
            Self::Finalized => Some(Self::Disposed),
            Self::Disposed => None,
        }
    }

    /// Whether guest code of the language may run
    pub fn is_initialized(self) -> bool {
        self == Self::ContextInitialized
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uncreated => "uncreated",
            Self::Created => "created",
            Self::ThreadInitialized => "thread-initialized",
            Self::ContextInitialized => "context-initialized",
            Self::Finalized => "finalized",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

pub(crate) struct LanguageContextSlot {
    pub(crate) id: String,
    pub(crate) instance: Arc<dyn Language>,
    state: SlotState,
    language_state: Option<LanguageState>,
    /// Thread currently running an initialization phase of this slot
    pub(crate) busy: Option<ThreadKey>,
    /// Threads `initialize_thread` was called for, in call order
    pub(crate) threads: Vec<ThreadKey>,
    pub(crate) multi_threading_initialized: bool,
    pub(crate) bindings: Bindings,
}

impl fmt::Debug for LanguageContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageContextSlot")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("busy", &self.busy)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

impl LanguageContextSlot {
    /// A slot whose `create_context` just returned `state`
    pub(crate) fn created(
        id: String,
        instance: Arc<dyn Language>,
        state: LanguageState,
        bindings: Bindings,
        owner: ThreadKey,
    ) -> Self {
        Self {
            id,
            instance,
            state: SlotState::Created,
            language_state: Some(state),
            busy: Some(owner),
            threads: Vec::new(),
            multi_threading_initialized: false,
            bindings,
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    /// The state object, cloned for use outside the context lock
    pub(crate) fn language_state(&self) -> Result<LanguageState, PolyglotError> {
        self.language_state.clone().ok_or_else(|| {
            PolyglotError::Internal(format!(
                "Language '{}' has no context state in state {}.",
                self.id, self.state
            ))
        })
    }

    /// Move to `next`, which must be the direct successor of the current state
    pub(crate) fn advance(&mut self, next: SlotState) -> Result<(), PolyglotError> {
        if self.state.successor() != Some(next) {
            tracing::error!(
                language = %self.id,
                from = %self.state,
                to = %next,
                "illegal slot transition"
            );
            return Err(PolyglotError::Internal(format!(
                "Illegal state transition of language '{}' from {} to {}.",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next == SlotState::Disposed {
            self.language_state = None;
        }
        Ok(())
    }

    /// Roll a failed thread initialization back to `Created`
    pub(crate) fn reset_threads(&mut self) {
        if self.state == SlotState::ThreadInitialized {
            self.state = SlotState::Created;
        }
        self.threads.clear();
    }

    /// Dispose a slot whose initialization never completed. Only valid from
    /// `Created` or `ThreadInitialized`.
    pub(crate) fn abandon(&mut self) -> Result<(), PolyglotError> {
        match self.state {
            SlotState::Created | SlotState::ThreadInitialized => {
                tracing::debug!(
                    language = %self.id,
                    from = %self.state,
                    "disposing partially initialized language"
                );
                self.state = SlotState::Disposed;
                self.language_state = None;
                Ok(())
            }
            state => Err(PolyglotError::Internal(format!(
                "Language '{}' cannot be abandoned in state {}.",
                self.id, state
            ))),
        }
    }
}
