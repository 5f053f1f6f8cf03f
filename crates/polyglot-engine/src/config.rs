//! Engine Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often a waiting closer re-checks the context (milliseconds)
    pub close_poll_interval_ms: u64,

    /// Polls after which a waiting closer logs the stuck threads and
    /// re-sends interrupts
    pub close_escalation_rounds: u32,

    /// Hard bound for a cancelling close waiting on guest threads (milliseconds)
    pub cancel_timeout_ms: u64,

    /// How long `enter` waits for exclusive access when a language refuses
    /// multi-threaded access (milliseconds)
    pub thread_access_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            close_poll_interval_ms: 50,
            close_escalation_rounds: 40,
            cancel_timeout_ms: 60_000,
            thread_access_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn close_poll_interval(&self) -> Duration {
        Duration::from_millis(self.close_poll_interval_ms.max(1))
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn thread_access_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_access_timeout_ms)
    }

    pub(crate) fn escalation_rounds(&self) -> u32 {
        self.close_escalation_rounds.max(1)
    }
}
