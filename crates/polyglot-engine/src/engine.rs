//! Polyglot Engine
//!
//! Shared configuration, language registry and language instances backing
//! one or more contexts.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::context::{Context, ContextBuilder, ContextShared, EXECUTING_ON_OTHER_THREAD};
use crate::error::PolyglotError;
use crate::language::{ContextPolicy, Language, LanguageRegistration};
use crate::registry::LanguageRegistry;
use crate::thread_local::{ContextId, ContextThreadLocal};

/// Handle to an engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    pub(crate) shared: Arc<EngineShared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("languages", &self.shared.registry.ids())
            .field("closed", &self.is_closed())
            .field("bound", &self.shared.bound)
            .finish()
    }
}

impl Engine {
    pub fn builder(registry: LanguageRegistry) -> EngineBuilder {
        EngineBuilder {
            registry,
            config: EngineConfig::default(),
        }
    }

    /// Create an engine with the default configuration
    pub fn create(registry: LanguageRegistry) -> Self {
        Self::builder(registry).build()
    }

    pub(crate) fn bound(registry: LanguageRegistry, config: EngineConfig) -> Self {
        Self::new(registry, config, true)
    }

    fn new(registry: LanguageRegistry, config: EngineConfig, bound: bool) -> Self {
        tracing::info!(
            languages = registry.len(),
            bound,
            "polyglot engine {} created",
            crate::VERSION
        );
        Self {
            shared: Arc::new(EngineShared {
                registry,
                config,
                local: ContextThreadLocal::new(),
                contexts: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                bound,
                pool: Mutex::new(InstancePool::default()),
            }),
        }
    }

    /// Start building a context on this engine
    pub fn context_builder(&self) -> ContextBuilder {
        Context::builder().engine(self)
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Thread to entered-context binding shared by this engine's contexts
    pub fn thread_local(&self) -> &ContextThreadLocal {
        &self.shared.local
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of contexts created on this engine that are not closed yet
    pub fn context_count(&self) -> usize {
        self.shared.live_contexts().len()
    }

    /// How many instances of `language` this engine has created so far
    pub fn instances_created(&self, language: &str) -> usize {
        self.shared.pool.lock().created.get(language).copied().unwrap_or(0)
    }

    /// Close every context of this engine and reject new ones.
    ///
    /// Fails if a context is still executing on another thread.
    pub fn close(&self) -> Result<(), PolyglotError> {
        self.shared.close(false)
    }

    /// Cancel and close every context of this engine
    pub fn close_cancel(&self) -> Result<(), PolyglotError> {
        self.shared.close(true)
    }
}

pub struct EngineBuilder {
    registry: LanguageRegistry,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.registry, self.config, false)
    }
}

pub(crate) struct EngineShared {
    pub(crate) registry: LanguageRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) local: ContextThreadLocal,
    contexts: Mutex<Vec<Weak<ContextShared>>>,
    closed: AtomicBool,
    /// Created implicitly for a single context and closed with it
    pub(crate) bound: bool,
    pool: Mutex<InstancePool>,
}

/// Language instances kept across contexts according to their [`ContextPolicy`]
#[derive(Default)]
struct InstancePool {
    shared: HashMap<String, Arc<dyn Language>>,
    idle: HashMap<String, Vec<Arc<dyn Language>>>,
    created: HashMap<String, usize>,
}

impl InstancePool {
    fn instantiate(&mut self, registration: &LanguageRegistration) -> Arc<dyn Language> {
        *self.created.entry(registration.descriptor().id().to_string()).or_default() += 1;
        registration.instantiate()
    }
}

impl EngineShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Track a new context. Fails once the engine started closing.
    pub(crate) fn register_context(
        &self,
        context: &Arc<ContextShared>,
    ) -> Result<(), PolyglotError> {
        let mut contexts = self.contexts.lock();
        if self.is_closed() {
            return Err(PolyglotError::EngineClosed);
        }
        contexts.retain(|weak| weak.strong_count() > 0);
        contexts.push(Arc::downgrade(context));
        Ok(())
    }

    pub(crate) fn unregister_context(&self, id: ContextId) {
        self.contexts
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|context| context.id != id));
    }

    fn live_contexts(&self) -> Vec<Arc<ContextShared>> {
        self.contexts
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|context| !context.is_closed())
            .collect()
    }

    /// Language instance for a new context slot
    pub(crate) fn acquire_instance(
        &self,
        registration: &LanguageRegistration,
    ) -> Arc<dyn Language> {
        let id = registration.descriptor().id();
        let mut pool = self.pool.lock();
        match registration.descriptor().policy() {
            ContextPolicy::Exclusive => pool.instantiate(registration),
            ContextPolicy::Shared => {
                if let Some(instance) = pool.shared.get(id) {
                    return Arc::clone(instance);
                }
                let instance = pool.instantiate(registration);
                pool.shared.insert(id.to_string(), Arc::clone(&instance));
                instance
            }
            ContextPolicy::Reuse => match pool.idle.get_mut(id).and_then(Vec::pop) {
                Some(instance) => {
                    tracing::debug!(language = id, "reusing language instance");
                    instance
                }
                None => pool.instantiate(registration),
            },
        }
    }

    /// Hand back the instance of a disposed slot
    pub(crate) fn release_instance(&self, id: &str, instance: Arc<dyn Language>) {
        let policy = self.registry.descriptor(id).map(|descriptor| descriptor.policy());
        if policy == Some(ContextPolicy::Reuse) && !self.is_closed() {
            self.pool.lock().idle.entry(id.to_string()).or_default().push(instance);
        }
    }

    pub(crate) fn close(&self, cancel: bool) -> Result<(), PolyglotError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(cancel, bound = self.bound, "closing polyglot engine");
        }

        let contexts: Vec<_> = self.contexts.lock().iter().filter_map(Weak::upgrade).collect();
        let mut first_error = None;
        for context in contexts {
            let result = match context.close(cancel) {
                Ok(true) => Ok(()),
                Ok(false) => Err(PolyglotError::Lifecycle(EXECUTING_ON_OTHER_THREAD.to_string())),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                tracing::warn!(
                    context = %context.id,
                    %error,
                    "context failed to close with its engine"
                );
                first_error.get_or_insert(error);
            }
        }

        let mut pool = self.pool.lock();
        pool.shared.clear();
        pool.idle.clear();
        drop(pool);

        first_error.map_or(Ok(()), Err)
    }
}
