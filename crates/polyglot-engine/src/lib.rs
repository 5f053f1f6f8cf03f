//! Polyglot Engine
//!
//! Hosts several independently implemented guest languages in one process
//! and manages their per-context state.
//!
//! # Features
//! - Dependency-ordered creation, initialization and teardown of languages
//! - Nested and concurrent enter/leave of contexts from host threads
//! - Race-free concurrent close, with cancellation of running guest code
//! - Access control for cross-language evaluation and symbol exchange
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use polyglot_engine::{
//!     Context, Env, GuestCode, GuestResult, Language, LanguageDescriptor, LanguageRegistration,
//!     LanguageRegistry, Source, Value,
//! };
//!
//! struct Upper;
//!
//! impl Language for Upper {
//!     fn parse(&self, _env: &Env, source: &Source) -> GuestResult<GuestCode> {
//!         let text = source.code().to_uppercase();
//!         Ok(GuestCode::new(move |_env, _args| Ok(Value::from(text.as_str()))))
//!     }
//! }
//!
//! let registry = LanguageRegistry::builder()
//!     .register(LanguageRegistration::new(LanguageDescriptor::new("upper"), || Arc::new(Upper)))
//!     .build()?;
//!
//! let context = Context::builder().registry(registry).build()?;
//! assert_eq!(context.eval("upper", "hi")?, Value::from("HI"));
//! context.close()?;
//! let err = context.eval("upper", "hi").unwrap_err();
//! assert_eq!(err.to_string(), "The Context is already closed.");
//! # Ok::<(), polyglot_engine::PolyglotError>(())
//! ```

mod bindings;
mod cancel;
mod config;
mod context;
mod engine;
mod env;
mod error;
mod inspect;
mod language;
mod registry;
mod slot;
mod thread_local;

pub use bindings::Bindings;
pub use config::EngineConfig;
pub use context::{Context, ContextBuilder, ContextScope, Lifecycle};
pub use engine::{Engine, EngineBuilder};
pub use env::{Env, Executable};
pub use error::{ConfigError, ErrorKind, GuestResult, PolyglotError};
pub use inspect::{ContextSnapshot, LanguageSnapshot};
pub use language::{
    ContextPolicy, GuestCode, Language, LanguageDescriptor, LanguageProvider, LanguageRegistration,
    LanguageState, Source, Value,
};
pub use registry::{LanguageRegistry, LanguageRegistryBuilder, LanguageSource};
pub use slot::SlotState;
pub use thread_local::{ContextId, ContextThreadLocal, ThreadKey};

// Access control lives in its own crate
pub use polyglot_security as security;
pub use polyglot_security::{PolyglotAccess, PolyglotAccessBuilder};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
