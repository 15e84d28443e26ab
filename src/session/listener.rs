//! Session listeners and the name registry used to resolve replicated ones
use std::sync::Arc;

use dashmap::DashMap;

/// Callbacks for session lifecycle and attribute changes
pub trait SessionListener: Send + Sync + 'static {
    /// Registry name; peers resolve replicated listeners by this name
    fn name(&self) -> &str;

    /// Whether add/remove of this listener is replicated to peers
    fn is_replicated(&self) -> bool {
        true
    }

    fn session_created(&self, _session_id: &str) {}

    fn session_destroyed(&self, _session_id: &str) {}

    fn attribute_set(&self, _session_id: &str, _name: &str) {}

    fn attribute_removed(&self, _session_id: &str, _name: &str) {}
}

impl std::fmt::Debug for dyn SessionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionListener({})", self.name())
    }
}

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Arc<dyn SessionListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.insert(listener.name().to_string(), listener);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn SessionListener>> {
        self.listeners.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
