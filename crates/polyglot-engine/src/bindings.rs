//! Symbol bindings
//!
//! Name to [`Value`] tables. Every language slot owns one; the context owns
//! one more, the polyglot bindings, shared by all languages with bindings
//! access. A handle stops working once its context is closed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::PolyglotError;
use crate::language::Value;

#[derive(Debug, Clone)]
pub struct Bindings {
    symbols: Arc<RwLock<BTreeMap<String, Value>>>,
    closed: Arc<AtomicBool>,
}

impl Bindings {
    pub(crate) fn new(closed: Arc<AtomicBool>) -> Self {
        Self {
            symbols: Arc::new(RwLock::new(BTreeMap::new())),
            closed,
        }
    }

    fn check_open(&self) -> Result<(), PolyglotError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PolyglotError::ContextClosed)
        } else {
            Ok(())
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<Value>, PolyglotError> {
        self.check_open()?;
        Ok(self.symbols.read().get(name).cloned())
    }

    /// Insert or replace a symbol, returning the previous value
    pub fn put(
        &self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, PolyglotError> {
        self.check_open()?;
        Ok(self.symbols.write().insert(name.into(), value.into()))
    }

    pub fn remove(&self, name: &str) -> Result<Option<Value>, PolyglotError> {
        self.check_open()?;
        Ok(self.symbols.write().remove(name))
    }

    pub fn contains(&self, name: &str) -> Result<bool, PolyglotError> {
        self.check_open()?;
        Ok(self.symbols.read().contains_key(name))
    }

    /// Symbol names in sorted order
    pub fn keys(&self) -> Result<Vec<String>, PolyglotError> {
        self.check_open()?;
        Ok(self.symbols.read().keys().cloned().collect())
    }

    pub(crate) fn clear(&self) {
        self.symbols.write().clear();
    }
}
