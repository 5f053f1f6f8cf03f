//! Language environment
//!
//! [`Env`] is what a language sees of the context it runs in. It is handed
//! to every lifecycle callback and to guest code, and gates everything a
//! language does to other languages through the context's access policy.
//!
//! Once the context is being cancelled every operation fails with
//! [`PolyglotError::Cancelled`], so guest code cannot swallow the cancel.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use polyglot_security::Requester;

use crate::bindings::Bindings;
use crate::context::{Context, ContextShared};
use crate::error::{GuestResult, PolyglotError};
use crate::language::{GuestCode, Language, Source, Value};
use crate::thread_local::{ContextId, ThreadKey};

#[derive(Clone)]
pub struct Env {
    context: Arc<ContextShared>,
    language: Arc<str>,
    instance: Arc<dyn Language>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("context", &self.context.id)
            .field("language", &self.language)
            .finish()
    }
}

impl Env {
    pub(crate) fn new(
        context: Arc<ContextShared>,
        language: &str,
        instance: Arc<dyn Language>,
    ) -> Self {
        Self {
            context,
            language: Arc::from(language),
            instance,
        }
    }

    pub(crate) fn instance(&self) -> &Arc<dyn Language> {
        &self.instance
    }

    /// Id of the language this environment belongs to
    pub fn language_id(&self) -> &str {
        &self.language
    }

    pub fn context_id(&self) -> ContextId {
        self.context.id
    }

    /// Embedder handle of the owning context
    pub fn context(&self) -> Context {
        Context {
            shared: Arc::clone(&self.context),
        }
    }

    pub fn current_thread(&self) -> ThreadKey {
        ThreadKey::current()
    }

    fn requester(&self) -> Requester<'_> {
        Requester::Language(&self.language)
    }

    /// Initialize a language visible to this one
    pub fn initialize(&self, language: &str) -> Result<bool, PolyglotError> {
        self.check_cancelled()?;
        self.context.check_access(self.requester(), language)?;
        let _entered = self.context.enter_if_needed()?;
        self.context.ensure_initialized(language)
    }

    /// Parse code of a visible language, initializing it if needed
    pub fn parse(&self, source: &Source) -> Result<Executable, PolyglotError> {
        self.check_cancelled()?;
        self.context.parse(self.requester(), source)
    }

    pub fn eval(&self, language: &str, code: &str) -> Result<Value, PolyglotError> {
        self.parse(&Source::new(language, code))?.execute(&[])
    }

    /// Top-level symbols of this language
    pub fn bindings(&self) -> Result<Bindings, PolyglotError> {
        self.bindings_of(&self.language)
    }

    /// Top-level symbols of another visible language
    pub fn bindings_of(&self, language: &str) -> Result<Bindings, PolyglotError> {
        self.check_cancelled()?;
        self.context.language_bindings(self.requester(), language)
    }

    /// Publish a symbol in the polyglot bindings
    pub fn export_symbol(&self, name: &str, value: impl Into<Value>) -> Result<(), PolyglotError> {
        self.check_cancelled()?;
        self.context.policy.check_bindings_access(&self.language)?;
        self.context.polyglot_bindings.put(name, value)?;
        Ok(())
    }

    /// Look up a symbol in the polyglot bindings
    pub fn import_symbol(&self, name: &str) -> Result<Option<Value>, PolyglotError> {
        self.check_cancelled()?;
        self.context.policy.check_bindings_access(&self.language)?;
        self.context.polyglot_bindings.get(name)
    }

    /// Create an inner context on the same engine. It has the access rules
    /// of this context and is closed before this context's languages are
    /// finalized.
    pub fn new_inner_context(&self) -> Result<Context, PolyglotError> {
        self.check_cancelled()?;
        self.context.create_inner()
    }

    /// Run `body` on a new thread entered into this context. A normal close
    /// waits for the thread to finish; a cancelling close interrupts it.
    pub fn create_thread<F>(&self, body: F) -> Result<(), PolyglotError>
    where
        F: FnOnce(&Env) -> GuestResult<()> + Send + 'static,
    {
        self.check_cancelled()?;
        self.context.spawn_language_thread(self.clone(), body)
    }

    /// Fails once the context is being cancelled
    pub fn check_cancelled(&self) -> Result<(), PolyglotError> {
        self.context.cancel.check()
    }

    /// Sleep that is cut short by a cancelling close
    pub fn sleep(&self, duration: Duration) -> Result<(), PolyglotError> {
        self.context.cancel.sleep(duration)
    }

    /// Park the current thread for at most `timeout`. Returns early when the
    /// thread is unparked, and fails if that was a cancel.
    pub fn park_timeout(&self, timeout: Duration) -> Result<(), PolyglotError> {
        self.check_cancelled()?;
        thread::park_timeout(timeout);
        self.check_cancelled()
    }
}

/// Parsed guest code bound to its context
#[derive(Clone)]
pub struct Executable {
    env: Env,
    code: GuestCode,
    name: String,
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("language", &self.env.language)
            .field("name", &self.name)
            .finish()
    }
}

impl Executable {
    pub(crate) fn new(env: Env, code: GuestCode, name: &str) -> Self {
        Self {
            env,
            code,
            name: name.to_string(),
        }
    }

    pub fn language(&self) -> &str {
        self.env.language_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the code with the context entered on the calling thread
    pub fn execute(&self, args: &[Value]) -> Result<Value, PolyglotError> {
        let context = &self.env.context;
        let _entered = context.enter_if_needed()?;
        {
            let inner = context.inner.lock();
            context.check_running(&inner, ThreadKey::current())?;
        }
        self.code
            .invoke(&self.env, args)
            .map_err(|error| PolyglotError::from_guest(self.language(), error))
    }
}
