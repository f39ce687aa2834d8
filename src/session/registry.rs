//! Session registry owned by one backend instance.

use super::handle::Handle;
use super::state::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Concurrent map from session id to live handle.
///
/// Reads are shared; register and remove take the write lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Handle>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle`, unless a handle with the same id is already present.
    ///
    /// Returns the handle that ends up registered.
    pub fn register(&self, handle: Arc<Handle>) -> Arc<Handle> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(handle.id().clone())
            .or_insert(handle)
            .clone()
    }

    /// Looks up a handle.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Handle>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Removes and returns a handle.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Handle>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Removes `handle` only if it is still the registered instance for its id.
    pub fn remove_if_same(&self, handle: &Arc<Handle>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(handle.id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<Handle>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Removes and returns every handle.
    pub fn drain(&self) -> Vec<Arc<Handle>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }

    /// Number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no handle is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
