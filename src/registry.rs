//! Method registry — name → handler lookup shared with the receiver.
//!
//! DESIGN
//! ======
//! The registry is a cheap cloneable handle over `Arc<RwLock<..>>`. Clones
//! observe the same entries, so a registry populated at startup can be handed
//! to one or more receivers. Guards are taken for the duration of a single
//! operation and never held across an await.
//!
//! Names are unique. Registration order is kept and reported by
//! [`MethodRegistry::names`] and [`MethodRegistry::handles`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use frames::{Arguments, ProtocolError};

use crate::method::{Method, MethodResult, sync_method};

/// Registration-time failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A method with this name is already registered.
    #[error("method '{0}' is already registered")]
    Duplicate(String),
    /// The empty name is reserved for cancellation signals.
    #[error("method name cannot be empty")]
    EmptyName,
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    methods: HashMap<String, Arc<dyn Method>>,
}

/// Shared table of callable methods.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    inner: Arc<RwLock<Entries>>,
}

static GLOBAL: OnceLock<MethodRegistry> = OnceLock::new();

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry instance.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Register `method` under `name`. Returns `self` so calls chain with `?`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] if the name is taken and
    /// [`RegistryError::EmptyName`] for `""`.
    pub fn register(&self, name: impl Into<String>, method: impl Method) -> Result<&Self, RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut entries = self.write();
        if entries.methods.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        entries.methods.insert(name.clone(), Arc::new(method));
        entries.order.push(name);
        Ok(self)
    }

    /// Register a blocking function. Its body runs on the receiver loop.
    ///
    /// # Errors
    ///
    /// Same as [`MethodRegistry::register`].
    pub fn register_sync<F>(&self, name: impl Into<String>, f: F) -> Result<&Self, RegistryError>
    where
        F: Fn(Arguments) -> MethodResult + Send + Sync + 'static,
    {
        self.register(name, sync_method(f))
    }

    /// Look up a method by name.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownMethod`] when nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Method>, ProtocolError> {
        self.read()
            .methods
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownMethod(name.to_owned()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().methods.contains_key(name)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut entries = self.write();
        entries.order.clear();
        entries.methods.clear();
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Registered handles in registration order.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<dyn Method>> {
        let entries = self.read();
        entries
            .order
            .iter()
            .filter_map(|name| entries.methods.get(name).cloned())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }

    // A panicking registrant leaves the table consistent, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry").field("names", &self.names()).finish()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
