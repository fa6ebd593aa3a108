//! Explicitly constructed application context.

use std::sync::{Arc, Mutex};

#[cfg(test)]
use mockall::automock;

use crate::storage::StorageManager;

/// Cached "profile exists" flag owned by the presentation layer.
#[cfg_attr(test, automock)]
pub trait ProfileCache: Send + Sync {
    fn set_profile_exists(&self, exists: bool);
}

/// Process-local [`ProfileCache`].
#[derive(Debug, Default)]
pub struct InMemoryProfileCache {
    exists: Mutex<Option<bool>>,
}

impl InMemoryProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the flag has been set once.
    pub fn profile_exists(&self) -> Option<bool> {
        *self.exists.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProfileCache for InMemoryProfileCache {
    fn set_profile_exists(&self, exists: bool) {
        *self.exists.lock().unwrap_or_else(|e| e.into_inner()) = Some(exists);
    }
}

/// Shared collaborators handed to every component that needs them.
#[derive(Clone)]
pub struct AppContext {
    pub storage: StorageManager,
    pub profile_cache: Arc<dyn ProfileCache>,
}

impl AppContext {
    pub fn new(storage: StorageManager, profile_cache: Arc<dyn ProfileCache>) -> Self {
        Self {
            storage,
            profile_cache,
        }
    }
}
