//! Guest language model
//!
//! A guest language is a data-driven [`LanguageDescriptor`] plus one
//! implementation of the [`Language`] lifecycle trait. Every callback has a
//! no-op default except [`Language::parse`].
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use polyglot_engine::{
//!     Env, GuestCode, GuestResult, Language, LanguageDescriptor, LanguageRegistration, Source,
//!     Value,
//! };
//!
//! struct Echo;
//!
//! impl Language for Echo {
//!     fn parse(&self, _env: &Env, source: &Source) -> GuestResult<GuestCode> {
//!         let code = source.code().to_string();
//!         Ok(GuestCode::new(move |_env, _args| Ok(Value::String(code.clone()))))
//!     }
//! }
//!
//! let registration =
//!     LanguageRegistration::new(LanguageDescriptor::new("echo"), || Arc::new(Echo));
//! assert_eq!(registration.descriptor().id(), "echo");
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::env::Env;
use crate::error::GuestResult;
use crate::thread_local::ThreadKey;

/// Opaque per-context state object created by a language
pub type LanguageState = Arc<dyn Any + Send + Sync>;

/// Creates language instances; the engine decides how often, based on the
/// descriptor's [`ContextPolicy`].
pub type LanguageProvider = Arc<dyn Fn() -> Arc<dyn Language> + Send + Sync>;

/// Whether one language instance may serve several contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextPolicy {
    /// A fresh instance for every context
    #[default]
    Exclusive,
    /// One instance for all contexts of an engine, concurrently
    Shared,
    /// Instances are handed to a new context once their previous context closed
    Reuse,
}

/// Immutable description of an installed language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageDescriptor {
    id: String,
    name: String,
    version: String,
    dependencies: Vec<String>,
    internal: bool,
    context_policy: ContextPolicy,
}

impl LanguageDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "1.0".to_string(),
            dependencies: Vec::new(),
            internal: false,
            context_policy: ContextPolicy::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Languages that must be initialized before this one
    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Mark as dependency-only; the embedder cannot reach it directly
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn context_policy(mut self, policy: ContextPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub fn version_string(&self) -> &str {
        &self.version
    }

    pub fn dependency_ids(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn policy(&self) -> ContextPolicy {
        self.context_policy
    }
}

/// A descriptor paired with the provider of its implementation
#[derive(Clone)]
pub struct LanguageRegistration {
    descriptor: LanguageDescriptor,
    provider: LanguageProvider,
}

impl fmt::Debug for LanguageRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageRegistration")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl LanguageRegistration {
    pub fn new<F>(descriptor: LanguageDescriptor, provider: F) -> Self
    where
        F: Fn() -> Arc<dyn Language> + Send + Sync + 'static,
    {
        Self { descriptor, provider: Arc::new(provider) }
    }

    pub fn descriptor(&self) -> &LanguageDescriptor {
        &self.descriptor
    }

    pub(crate) fn instantiate(&self) -> Arc<dyn Language> {
        (self.provider)()
    }
}

/// Lifecycle callbacks implemented by a guest language.
///
/// For one context the engine calls, per language and strictly in order:
/// `create_context`, `initialize_thread` (every thread), `initialize_context`,
/// optionally `initialize_multi_threading`, `finalize_context`,
/// `dispose_thread` (every thread), `dispose_context`.
///
/// Callbacks run on the thread that triggered them, with the context entered.
pub trait Language: Send + Sync {
    /// Create the per-context state. Dependencies are already initialized,
    /// dependents are not and must not be touched.
    fn create_context(&self, _env: &Env) -> GuestResult<LanguageState> {
        Ok(Arc::new(()))
    }

    fn initialize_context(&self, _env: &Env, _state: &LanguageState) -> GuestResult<()> {
        Ok(())
    }

    fn initialize_thread(
        &self,
        _env: &Env,
        _state: &LanguageState,
        _thread: ThreadKey,
    ) -> GuestResult<()> {
        Ok(())
    }

    /// Called once, when a second thread becomes active in the context
    fn initialize_multi_threading(&self, _env: &Env, _state: &LanguageState) -> GuestResult<()> {
        Ok(())
    }

    /// Whether `thread` may run code of this language. By default only
    /// single-threaded access is allowed.
    fn is_thread_access_allowed(&self, _thread: ThreadKey, single_threaded: bool) -> bool {
        single_threaded
    }

    /// Last chance to run guest code; may activate other languages
    fn finalize_context(&self, _env: &Env, _state: &LanguageState) -> GuestResult<()> {
        Ok(())
    }

    fn dispose_thread(
        &self,
        _env: &Env,
        _state: &LanguageState,
        _thread: ThreadKey,
    ) -> GuestResult<()> {
        Ok(())
    }

    /// Release resources. Running guest code here is a contract violation.
    fn dispose_context(&self, _env: &Env, _state: &LanguageState) -> GuestResult<()> {
        Ok(())
    }

    fn parse(&self, env: &Env, source: &Source) -> GuestResult<GuestCode>;
}

type GuestFn = dyn Fn(&Env, &[Value]) -> GuestResult<Value> + Send + Sync;

/// Code produced by [`Language::parse`]
#[derive(Clone)]
pub struct GuestCode {
    call: Arc<GuestFn>,
}

impl GuestCode {
    pub fn new<F>(call: F) -> Self
    where
        F: Fn(&Env, &[Value]) -> GuestResult<Value> + Send + Sync + 'static,
    {
        Self { call: Arc::new(call) }
    }

    pub(crate) fn invoke(&self, env: &Env, args: &[Value]) -> GuestResult<Value> {
        (self.call)(env, args)
    }
}

impl fmt::Debug for GuestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuestCode")
    }
}

/// Guest source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    language: String,
    name: String,
    code: String,
}

impl Source {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            name: "Unnamed".to_string(),
            code: code.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Value exchanged between the host and guest languages
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
