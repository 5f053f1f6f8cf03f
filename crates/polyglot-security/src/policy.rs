//! Access policy
//!
//! Evaluates whether a requester (the embedder or a language) may see,
//! initialize or exchange symbols with a language.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::{PolyglotAccess, SecurityError};

/// Embedder-supplied filter over language ids. Returning `false` hides the
/// language from the embedder and from granted (non-dependency) access.
pub type LanguageFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Read-only view of the installed languages and their dependency graph
pub trait LanguageGraph {
    /// All installed language ids, public and internal
    fn language_ids(&self) -> Vec<&str>;

    /// Declared dependencies of `id`, empty if unknown
    fn dependencies(&self, id: &str) -> &[String];

    /// Whether `id` is a dependency-only language
    fn is_internal(&self, id: &str) -> bool;

    fn contains(&self, id: &str) -> bool {
        self.language_ids().contains(&id)
    }
}

/// Who is asking for access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester<'a> {
    /// The embedding API surface
    Host,
    /// Code of an installed language
    Language(&'a str),
}

impl fmt::Display for Requester<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requester::Host => write!(f, "the host"),
            Requester::Language(id) => write!(f, "'{id}'"),
        }
    }
}

/// Access rules of one context
#[derive(Clone, Default)]
pub struct AccessPolicy {
    access: PolyglotAccess,
    /// Public languages the embedder permits; empty permits all of them
    permitted: BTreeSet<String>,
    filter: Option<LanguageFilter>,
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("access", &self.access)
            .field("permitted", &self.permitted)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl AccessPolicy {
    pub fn new(access: PolyglotAccess) -> Self {
        Self { access, ..Self::default() }
    }

    /// Restrict the embedder to the given public languages
    pub fn with_permitted<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permitted = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, filter: LanguageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn access(&self) -> &PolyglotAccess {
        &self.access
    }

    fn passes_filter(&self, id: &str) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(id))
    }

    /// Whether the embedder may use a public language at all
    fn is_usable_public(&self, graph: &dyn LanguageGraph, id: &str) -> bool {
        !graph.is_internal(id)
            && (self.permitted.is_empty() || self.permitted.contains(id))
            && self.passes_filter(id)
    }

    /// Languages visible to `requester`:
    /// granted languages ∪ own dependencies ∪ internal languages ∪ itself
    pub fn visible_languages(
        &self,
        graph: &dyn LanguageGraph,
        requester: &str,
    ) -> BTreeSet<String> {
        let mut visible = BTreeSet::new();
        visible.insert(requester.to_string());
        visible.extend(graph.dependencies(requester).iter().cloned());

        for id in graph.language_ids() {
            if graph.is_internal(id) {
                visible.insert(id.to_string());
            }
        }

        let granted: Vec<&str> = match &self.access {
            PolyglotAccess::None => Vec::new(),
            PolyglotAccess::All => graph.language_ids(),
            PolyglotAccess::Custom(_) => self
                .access
                .granted_targets(requester)
                .map(|targets| targets.iter().map(String::as_str).collect())
                .unwrap_or_default(),
        };
        for id in granted {
            if graph.contains(id) && self.is_usable_public(graph, id) {
                visible.insert(id.to_string());
            }
        }

        visible
    }

    /// Check that `requester` may initialize or evaluate `target`
    pub fn check_language_access(
        &self,
        graph: &dyn LanguageGraph,
        requester: Requester<'_>,
        target: &str,
    ) -> Result<(), SecurityError> {
        if !graph.contains(target) || (requester == Requester::Host && graph.is_internal(target)) {
            return Err(not_installed(graph, target));
        }

        match requester {
            Requester::Host => {
                if !self.passes_filter(target) {
                    tracing::debug!(target_language = target, "language rejected by filter");
                    return Err(SecurityError::Filtered { target: target.to_string() });
                }
                if !self.is_usable_public(graph, target) {
                    return Err(SecurityError::NotPermitted {
                        requester: requester.to_string(),
                        target: target.to_string(),
                    });
                }
                Ok(())
            }
            Requester::Language(from) => {
                if self.visible_languages(graph, from).contains(target) {
                    Ok(())
                } else {
                    tracing::debug!(from, target_language = target, "language access denied");
                    Err(SecurityError::NotPermitted {
                        requester: requester.to_string(),
                        target: target.to_string(),
                    })
                }
            }
        }
    }

    /// Check that `language` may export to or import from the polyglot bindings
    pub fn check_bindings_access(&self, language: &str) -> Result<(), SecurityError> {
        if self.access.allows_bindings(language) {
            Ok(())
        } else {
            Err(SecurityError::BindingsDenied { language: language.to_string() })
        }
    }
}

fn not_installed(graph: &dyn LanguageGraph, id: &str) -> SecurityError {
    let mut public: Vec<&str> = graph
        .language_ids()
        .into_iter()
        .filter(|id| !graph.is_internal(id))
        .collect();
    public.sort_unstable();
    SecurityError::NotInstalled {
        id: id.to_string(),
        installed: public.join(", "),
    }
}
