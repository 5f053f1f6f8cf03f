//! Engine errors
//!
//! One error type for every public operation. [`PolyglotError::kind`]
//! tells "my code's bug" apart from "a language broke its contract".

use std::sync::Arc;

use polyglot_security::SecurityError;

/// Result of a language callback.
pub type GuestResult<T> = anyhow::Result<T>;

/// Broad classification of a [`PolyglotError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broken language installation (duplicate id, dependency cycle)
    Configuration,
    /// Language not visible under the current access policy
    Access,
    /// Disallowed operation for the current lifecycle state
    Lifecycle,
    /// Operation on a closed context or engine
    Closed,
    /// Execution stopped by a cancelling close
    Cancelled,
    /// A language refused access from the current thread
    ThreadAccess,
    /// A language callback or guest code failed
    Guest,
    /// A language or the caller violated a contract the engine relies on
    Internal,
}

/// Installation errors detected while building a registry or resolving
/// dependency order
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Duplicate language id '{0}' found in language sources.")]
    DuplicateLanguage(String),

    #[error("Language '{language}' depends on '{dependency}' which is not installed.")]
    UnknownDependency { language: String, dependency: String },

    #[error("Cyclic dependency between languages: {}.", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Cyclic access to language '{0}' while its context is being created.")]
    CyclicCreation(String),
}

/// Polyglot engine error
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolyglotError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Access(#[from] SecurityError),

    #[error("{0}")]
    Lifecycle(String),

    #[error("The Context is already closed.")]
    ContextClosed,

    #[error("The Engine is already closed.")]
    EngineClosed,

    #[error("Context execution was cancelled.")]
    Cancelled,

    #[error("{0}")]
    ThreadAccess(String),

    #[error("Error in language '{language}': {error}")]
    Guest {
        language: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PolyglotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Access(_) => ErrorKind::Access,
            Self::Lifecycle(_) => ErrorKind::Lifecycle,
            Self::ContextClosed | Self::EngineClosed => ErrorKind::Closed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ThreadAccess(_) => ErrorKind::ThreadAccess,
            Self::Guest { .. } => ErrorKind::Guest,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wrap an error returned by a language callback.
    ///
    /// Engine errors propagated by the callback with `?` keep their kind.
    pub(crate) fn from_guest(language: &str, error: anyhow::Error) -> Self {
        match error.downcast::<PolyglotError>() {
            Ok(engine_error) => engine_error,
            Err(error) => Self::Guest {
                language: language.to_string(),
                error: Arc::new(error),
            },
        }
    }

    /// Wrap an error returned by a callback that must not fail (dispose phase)
    pub(crate) fn contract_violation(language: &str, phase: &str, error: anyhow::Error) -> Self {
        Self::Internal(format!(
            "Language '{language}' failed during {phase}, which must not run guest code: {error:#}"
        ))
    }

    pub(crate) fn enter_leave_mismatch() -> Self {
        Self::Internal(
            "Cannot leave context that is currently not entered. Forgot to enter or leave a \
             context?"
                .to_string(),
        )
    }
}
