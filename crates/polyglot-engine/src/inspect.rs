//! Context inspection
//!
//! Point-in-time views of a context's internal state, for tests and
//! diagnostics.

use serde::Serialize;

use crate::context::Lifecycle;
use crate::slot::SlotState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageSnapshot {
    pub id: String,
    pub state: SlotState,
    /// Threads `initialize_thread` ran for
    pub initialized_threads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub id: u64,
    pub lifecycle: Lifecycle,
    pub single_threaded: bool,
    pub cancelling: bool,
    /// Languages in creation order
    pub languages: Vec<LanguageSnapshot>,
    /// Threads the context keeps per-thread state for
    pub known_threads: usize,
    /// Threads inside the context right now
    pub active_threads: usize,
    /// Threads started by languages that have not finished yet
    pub language_threads: usize,
    /// Inner contexts that are not closed yet
    pub inner_contexts: usize,
}

impl ContextSnapshot {
    pub fn state_of(&self, language: &str) -> SlotState {
        self.languages
            .iter()
            .find(|snapshot| snapshot.id == language)
            .map_or(SlotState::Uncreated, |snapshot| snapshot.state)
    }

    /// Language ids in creation order
    pub fn creation_order(&self) -> Vec<&str> {
        self.languages.iter().map(|snapshot| snapshot.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            id: 1,
            lifecycle: Lifecycle::Open,
            single_threaded: true,
            cancelling: false,
            languages: vec![
                LanguageSnapshot {
                    id: "b".into(),
                    state: SlotState::ContextInitialized,
                    initialized_threads: 1,
                },
                LanguageSnapshot {
                    id: "a".into(),
                    state: SlotState::Created,
                    initialized_threads: 0,
                },
            ],
            known_threads: 1,
            active_threads: 0,
            language_threads: 0,
            inner_contexts: 0,
        }
    }

    #[test]
    fn test_state_lookup() {
        let snapshot = snapshot();

        assert_eq!(snapshot.state_of("b"), SlotState::ContextInitialized);
        assert_eq!(snapshot.state_of("missing"), SlotState::Uncreated);
        assert_eq!(snapshot.creation_order(), ["b", "a"]);
    }

    #[test]
    fn test_serializes_to_json() {
        let json = serde_json::to_value(snapshot()).unwrap();

        assert_eq!(json["lifecycle"], "open");
        assert_eq!(json["languages"][0]["state"], "context_initialized");
    }
}
