//! Language registry
//!
//! Static catalog of installed languages, built once from one or more
//! [`LanguageSource`]s and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use polyglot_security::LanguageGraph;

use crate::error::ConfigError;
use crate::language::{LanguageDescriptor, LanguageRegistration};

/// A discovery unit contributing languages, comparable to a loader
pub trait LanguageSource {
    fn languages(&self) -> Vec<LanguageRegistration>;
}

impl LanguageSource for Vec<LanguageRegistration> {
    fn languages(&self) -> Vec<LanguageRegistration> {
        self.clone()
    }
}

/// Immutable id -> language map, cheap to clone and share between threads
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    languages: HashMap<String, LanguageRegistration>,
    /// Registration order, for deterministic listings
    ids: Vec<String>,
}

impl LanguageRegistry {
    pub fn builder() -> LanguageRegistryBuilder {
        LanguageRegistryBuilder::default()
    }

    /// Build from independently discovered sources. Any id provided twice,
    /// within one source or across sources, fails the whole build.
    pub fn discover(sources: &[&dyn LanguageSource]) -> Result<Self, ConfigError> {
        sources
            .iter()
            .flat_map(|source| source.languages())
            .fold(Self::builder(), LanguageRegistryBuilder::register)
            .build()
    }

    pub fn get(&self, id: &str) -> Option<&LanguageRegistration> {
        self.inner.languages.get(id)
    }

    pub fn descriptor(&self, id: &str) -> Option<&LanguageDescriptor> {
        self.get(id).map(LanguageRegistration::descriptor)
    }

    /// Installed ids in registration order
    pub fn ids(&self) -> &[String] {
        &self.inner.ids
    }

    pub fn len(&self) -> usize {
        self.inner.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ids.is_empty()
    }

    /// Order in which `id` and its transitive dependencies must be created
    /// and initialized: dependencies first, `id` last.
    ///
    /// Fails on the first dependency cycle reachable from `id`, before any
    /// state is touched, so the same request fails the same way every time.
    pub fn initialization_order(&self, id: &str) -> Result<Vec<String>, ConfigError> {
        let mut order = Vec::new();
        let mut path = Vec::new();
        self.visit(id, &mut path, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        id: &str,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        if order.iter().any(|done| done == id) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|open| open == id) {
            let mut cycle = path[start..].to_vec();
            cycle.push(id.to_string());
            return Err(ConfigError::CyclicDependency(cycle));
        }

        path.push(id.to_string());
        if let Some(descriptor) = self.descriptor(id) {
            for dependency in descriptor.dependency_ids() {
                self.visit(dependency, path, order)?;
            }
        }
        path.pop();
        order.push(id.to_string());
        Ok(())
    }
}

impl LanguageGraph for LanguageRegistry {
    fn language_ids(&self) -> Vec<&str> {
        self.inner.ids.iter().map(String::as_str).collect()
    }

    fn dependencies(&self, id: &str) -> &[String] {
        self.descriptor(id).map(LanguageDescriptor::dependency_ids).unwrap_or(&[])
    }

    fn is_internal(&self, id: &str) -> bool {
        self.descriptor(id).is_some_and(LanguageDescriptor::is_internal)
    }

    fn contains(&self, id: &str) -> bool {
        self.inner.languages.contains_key(id)
    }
}

/// Collects registrations; validation happens in [`Self::build`]
#[derive(Debug, Default)]
pub struct LanguageRegistryBuilder {
    registrations: Vec<LanguageRegistration>,
}

impl LanguageRegistryBuilder {
    pub fn register(mut self, registration: LanguageRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn build(self) -> Result<LanguageRegistry, ConfigError> {
        let mut languages = HashMap::with_capacity(self.registrations.len());
        let mut ids = Vec::with_capacity(self.registrations.len());

        for registration in self.registrations {
            let id = registration.descriptor().id().to_string();
            if languages.contains_key(&id) {
                tracing::error!(language = %id, "duplicate language id");
                return Err(ConfigError::DuplicateLanguage(id));
            }
            ids.push(id.clone());
            languages.insert(id, registration);
        }

        for id in &ids {
            let descriptor = languages[id].descriptor();
            for dependency in descriptor.dependency_ids() {
                if !languages.contains_key(dependency) {
                    return Err(ConfigError::UnknownDependency {
                        language: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        tracing::debug!(languages = ids.len(), "language registry built");
        Ok(LanguageRegistry {
            inner: Arc::new(RegistryInner { languages, ids }),
        })
    }
}
