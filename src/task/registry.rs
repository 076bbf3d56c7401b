//! Family-tagged registry of in-flight tasks.
//!
//! Every running task registers its [`Monitor`] under the family key of the
//! queue that runs it.  Cancelling a family cancels all of them at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use super::Monitor;

/// Identifies one registration within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

#[derive(Default)]
pub struct TaskRegistry {
    families: Mutex<HashMap<String, HashMap<HandleId, Monitor>>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh monitor under `family`.
    pub fn register(&self, family: &str) -> (HandleId, Monitor) {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let monitor = Monitor::new();
        self.families
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(family.to_string())
            .or_default()
            .insert(id, monitor.clone());
        (id, monitor)
    }

    pub fn unregister(&self, family: &str, id: HandleId) {
        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handles) = families.get_mut(family) {
            handles.remove(&id);
            if handles.is_empty() {
                families.remove(family);
            }
        }
    }

    /// Cancel every task currently registered under `family`.
    pub fn cancel_family(&self, family: &str) -> usize {
        let families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handles) = families.get(family) else {
            return 0;
        };
        for monitor in handles.values() {
            monitor.cancel();
        }
        debug!(family, count = handles.len(), "cancelled task family");
        handles.len()
    }

    pub fn active(&self, family: &str) -> usize {
        self.families
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(family)
            .map_or(0, HashMap::len)
    }

    pub fn cancel_all(&self) -> usize {
        let families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for monitor in families.values().flat_map(HashMap::values) {
            monitor.cancel();
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_family_only_touches_that_family() {
        let registry = TaskRegistry::new();
        let (_, a1) = registry.register("reload");
        let (_, a2) = registry.register("reload");
        let (_, b) = registry.register("save");

        assert_eq!(registry.cancel_family("reload"), 2);
        assert!(a1.is_cancelled());
        assert!(a2.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(registry.cancel_family("unknown"), 0);
    }

    #[test]
    fn unregister_drops_the_handle() {
        let registry = TaskRegistry::new();
        let (id, _) = registry.register("f");
        assert_eq!(registry.active("f"), 1);

        registry.unregister("f", id);
        assert_eq!(registry.active("f"), 0);
        assert_eq!(registry.cancel_all(), 0);
    }
}
