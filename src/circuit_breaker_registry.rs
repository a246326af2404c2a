use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerOptions};

/// Process-wide (per-[`crate::query_client::QueryClient`]) map from scope to
/// breaker (spec section 4.5/9). No breaker is ever silently destroyed: once
/// created for a scope it lives for the lifetime of the client.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
    open_callbacks: Arc<Mutex<Vec<Arc<dyn Fn(&str) + Send + Sync>>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        CircuitBreakerRegistry {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            open_callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the shared breaker for `scope`, creating it with `options` if
    /// this is the first time `scope` has been seen. `options` is ignored on
    /// subsequent calls for the same scope (the first caller wins, matching
    /// the teacher's "get or create" pattern used throughout `QueryCache`).
    pub fn get_or_create(&self, scope: &str, options: CircuitBreakerOptions) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry poisoned");
        if let Some(existing) = breakers.get(scope) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(scope, options));
        for callback in self.open_callbacks.lock().expect("registry poisoned").iter() {
            let callback = callback.clone();
            breaker.on_open(move |scope| callback(scope));
        }
        breakers.insert(scope.to_string(), breaker.clone());
        breaker
    }

    /// Registers a callback invoked whenever any breaker (present or future)
    /// opens. Used by the observer plane to surface breaker-open lifecycle
    /// events without every call site having to know which scopes exist.
    pub fn on_any_open(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        let callback: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(callback);
        for breaker in self.breakers.lock().expect("registry poisoned").values() {
            let callback = callback.clone();
            breaker.on_open(move |scope| callback(scope));
        }
        self.open_callbacks.lock().expect("registry poisoned").push(callback);
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
