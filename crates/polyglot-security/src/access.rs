//! Polyglot access
//!
//! Embedder-declared permissions for cross-language evaluation and for the
//! shared polyglot bindings.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Permission mode declared by the embedder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolyglotAccess {
    /// No language may see another (apart from its dependencies and
    /// internal languages) and bindings are closed.
    #[default]
    None,
    /// Every public language may see every other one and use the bindings.
    All,
    /// Explicit grants.
    Custom(AccessGrants),
}

/// Explicit grants of a custom access mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrants {
    /// requester -> languages it may evaluate
    #[serde(default)]
    pub eval: BTreeMap<String, BTreeSet<String>>,
    /// languages that may export/import polyglot bindings
    #[serde(default)]
    pub bindings: BTreeSet<String>,
}

impl PolyglotAccess {
    /// Start a custom access declaration
    pub fn builder() -> PolyglotAccessBuilder {
        PolyglotAccessBuilder::default()
    }

    /// Whether the embedder granted `from` evaluation access to `to`.
    ///
    /// `All` grants every pair. Dependencies and internal languages are not
    /// considered here; see [`crate::AccessPolicy::visible_languages`].
    pub fn allows_eval(&self, from: &str, to: &str) -> bool {
        match self {
            Self::None => from == to,
            Self::All => true,
            Self::Custom(grants) => {
                from == to || grants.eval.get(from).is_some_and(|targets| targets.contains(to))
            }
        }
    }

    /// Whether `language` may export to or import from the polyglot bindings
    pub fn allows_bindings(&self, language: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Custom(grants) => grants.bindings.contains(language),
        }
    }

    /// Languages `from` was explicitly granted, if the mode lists them
    pub(crate) fn granted_targets(&self, from: &str) -> Option<&BTreeSet<String>> {
        match self {
            Self::Custom(grants) => grants.eval.get(from),
            _ => None,
        }
    }
}

/// Builder for [`PolyglotAccess::Custom`]
#[derive(Debug, Default)]
pub struct PolyglotAccessBuilder {
    grants: AccessGrants,
}

impl PolyglotAccessBuilder {
    /// Allow `from` to evaluate code of `to`. The grant is one-directional.
    pub fn allow_eval(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.grants.eval.entry(from.into()).or_default().insert(to.into());
        self
    }

    /// Allow every listed language to evaluate every other listed language
    pub fn allow_eval_between<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = languages.into_iter().map(Into::into).collect();
        for from in &ids {
            for to in &ids {
                if from != to {
                    self.grants.eval.entry(from.clone()).or_default().insert(to.clone());
                }
            }
        }
        self
    }

    /// Allow `language` to export and import polyglot bindings
    pub fn allow_bindings_access(mut self, language: impl Into<String>) -> Self {
        self.grants.bindings.insert(language.into());
        self
    }

    pub fn build(self) -> PolyglotAccess {
        PolyglotAccess::Custom(self.grants)
    }
}
