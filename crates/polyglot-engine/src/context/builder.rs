//! Context builder

use std::sync::Arc;

use polyglot_security::{AccessPolicy, LanguageFilter, PolyglotAccess, Requester};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::PolyglotError;
use crate::registry::LanguageRegistry;

use super::{Context, ContextShared};

/// Options of a new context.
///
/// A context either runs on an explicit [`Engine`] or, when only a registry
/// is given, on an engine of its own that is closed together with it.
#[derive(Default)]
pub struct ContextBuilder {
    engine: Option<Engine>,
    registry: Option<LanguageRegistry>,
    config: EngineConfig,
    permitted: Vec<String>,
    access: PolyglotAccess,
    filter: Option<LanguageFilter>,
}

impl ContextBuilder {
    pub fn engine(mut self, engine: &Engine) -> Self {
        self.engine = Some(engine.clone());
        self
    }

    /// Languages for the implicitly created engine
    pub fn registry(mut self, registry: LanguageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Configuration of the implicitly created engine
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict the embedder to these languages. All public languages are
    /// permitted when none are given.
    pub fn permitted_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permitted = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_polyglot_access(mut self, access: PolyglotAccess) -> Self {
        self.access = access;
        self
    }

    /// Hide languages whose id the filter rejects
    pub fn language_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn build(self) -> Result<Context, PolyglotError> {
        let engine = match (self.engine, self.registry) {
            (Some(engine), _) => engine,
            (None, Some(registry)) => Engine::bound(registry, self.config),
            (None, None) => {
                return Err(PolyglotError::Lifecycle(
                    "A context needs an engine or a language registry.".to_string(),
                ));
            }
        };
        if engine.is_closed() {
            return Err(PolyglotError::EngineClosed);
        }

        let mut policy =
            AccessPolicy::new(self.access).with_permitted(self.permitted.iter().cloned());
        if let Some(filter) = self.filter {
            policy = policy.with_filter(filter);
        }
        for id in &self.permitted {
            // only public, installed ids can be permitted
            policy
                .check_language_access(engine.registry(), Requester::Host, id)
                .or_else(|error| match error {
                    polyglot_security::SecurityError::Filtered { .. } => Ok(()),
                    error => Err(error),
                })?;
        }

        let shared = ContextShared::new(Arc::clone(&engine.shared), policy, None);
        engine.shared.register_context(&shared)?;
        tracing::info!(context = %shared.id, "context created");
        Ok(Context { shared })
    }
}
