use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::cancellation::{self, CancellationToken};

/// Parent→child query graph used for cascade cancellation (spec section 4.6).
///
/// Edges are parent→child only; there are no back-pointers, matching spec
/// section 9's "strictly tree-shaped" ownership note. Owned by the
/// [`crate::query_client::QueryClient`] alongside the cache and breaker
/// registry.
#[derive(Default)]
pub struct DependencyManager {
    children: Mutex<HashMap<String, HashSet<String>>>,
}

impl DependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `child` as dependent on `parent`. Idempotent.
    pub fn register(&self, parent: &str, child: &str) {
        self.children
            .lock()
            .expect("dependency manager poisoned")
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
    }

    pub fn unregister(&self, parent: &str, child: &str) {
        let mut children = self.children.lock().expect("dependency manager poisoned");
        if let Some(set) = children.get_mut(parent) {
            set.remove(child);
            if set.is_empty() {
                children.remove(parent);
            }
        }
    }

    /// Drops every edge rooted at `parent`, without touching anything
    /// downstream of its former children (a child can still be a parent of
    /// its own children, which keep their own edges).
    pub fn remove_parent(&self, parent: &str) {
        self.children.lock().expect("dependency manager poisoned").remove(parent);
    }

    pub fn children_of(&self, parent: &str) -> Vec<String> {
        self.children
            .lock()
            .expect("dependency manager poisoned")
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancels every direct child of `parent`'s token, per spec section 4.6:
    /// "each registered child's Query ... receives `cancel()`". `lookup`
    /// resolves a child key to its live token, if the child's Query still
    /// exists; missing children are skipped.
    pub fn cascade_cancel(&self, parent: &str, lookup: impl Fn(&str) -> Option<CancellationToken>) {
        let children = self.children_of(parent);
        let tokens = children.iter().filter_map(|key| lookup(key));
        cancellation::cascade(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_children() {
        let manager = DependencyManager::new();
        manager.register("parent", "child-a");
        manager.register("parent", "child-b");
        let mut children = manager.children_of("parent");
        children.sort();
        assert_eq!(children, vec!["child-a", "child-b"]);
    }

    #[test]
    fn unregister_removes_single_edge() {
        let manager = DependencyManager::new();
        manager.register("parent", "child-a");
        manager.register("parent", "child-b");
        manager.unregister("parent", "child-a");
        assert_eq!(manager.children_of("parent"), vec!["child-b".to_string()]);
    }

    #[test]
    fn remove_parent_drops_all_edges() {
        let manager = DependencyManager::new();
        manager.register("parent", "child-a");
        manager.remove_parent("parent");
        assert!(manager.children_of("parent").is_empty());
    }

    #[test]
    fn cascade_cancel_cancels_every_live_child() {
        let manager = DependencyManager::new();
        manager.register("parent", "child-a");
        manager.register("parent", "child-b");

        let token_a = CancellationToken::new();
        let token_a_clone = token_a.clone();

        manager.cascade_cancel("parent", move |key| match key {
            "child-a" => Some(token_a_clone.clone()),
            _ => None,
        });

        assert!(token_a.is_cancelled());
    }
}
