//! Polyglot Security
//!
//! Access control for the polyglot engine.
//!
//! Features:
//! - Embedder permission modes (none, all, custom grants)
//! - Per-language visible-language sets
//! - Polyglot bindings (shared namespace) permissions
//! - Embedder language filter

pub mod access;
pub mod policy;

pub use access::{AccessGrants, PolyglotAccess, PolyglotAccessBuilder};
pub use policy::{AccessPolicy, LanguageFilter, LanguageGraph, Requester};

/// Security error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("A language with id '{id}' is not installed. Installed languages are: {installed}.")]
    NotInstalled { id: String, installed: String },

    #[error("Access to language '{target}' is not permitted from {requester}.")]
    NotPermitted { requester: String, target: String },

    #[error("Language '{target}' was rejected by the context language filter.")]
    Filtered { target: String },

    #[error(
        "Polyglot bindings are not accessible for language '{language}'. Use PolyglotAccess to \
         allow bindings access."
    )]
    BindingsDenied { language: String },
}
