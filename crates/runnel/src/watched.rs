//! The set of modules re-imported before every run.

use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexSet;

use crate::reload;

/// Shared, insertion-ordered set of watched module names.
///
/// Cloning yields another handle to the same set, so a filesystem watcher can
/// hold one while the orchestrator holds another.
#[derive(Debug, Clone, Default)]
pub struct WatchedModules {
    inner: Arc<Mutex<IndexSet<String>>>,
}

impl WatchedModules {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexSet<String>> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Add modules to the set. Names already present keep their position.
    pub fn watch<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().extend(modules.into_iter().map(Into::into));
    }

    /// Remove modules from the set.
    pub fn unwatch<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.lock();
        for module in modules {
            set.shift_remove(module.as_ref());
        }
    }

    /// Whether `module` is watched.
    pub fn contains(&self, module: &str) -> bool {
        self.lock().contains(module)
    }

    /// Number of watched modules.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The watched names in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// The reload script for the current set, or `None` when it is empty.
    pub fn reload_script(&self) -> Option<String> {
        let set = self.lock();
        (!set.is_empty()).then(|| reload::reload_script(set.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_keeps_insertion_order() {
        let watched = WatchedModules::new();
        watched.watch(["b", "a", "b", "c"]);

        assert_eq!(watched.snapshot(), vec!["b", "a", "c"]);
        assert_eq!(watched.len(), 3);
    }

    #[test]
    fn test_unwatch_preserves_order_of_rest() {
        let watched = WatchedModules::new();
        watched.watch(["a", "b", "c"]);
        watched.unwatch(["b", "missing"]);

        assert_eq!(watched.snapshot(), vec!["a", "c"]);
        assert!(!watched.contains("b"));
    }

    #[test]
    fn test_clones_share_state() {
        let watched = WatchedModules::new();
        let other = watched.clone();
        other.watch(["helpers"]);

        assert!(watched.contains("helpers"));
    }

    #[test]
    fn test_reload_script_only_when_non_empty() {
        let watched = WatchedModules::new();
        assert!(watched.reload_script().is_none());

        watched.watch(["helpers"]);
        let script = watched.reload_script();
        assert!(script.is_some_and(|s| s.contains(r#""helpers""#)));
    }
}
