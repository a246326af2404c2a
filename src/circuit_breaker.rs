use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::QueryCacheError;
use crate::instant::Instant;

/// Options for a single [`CircuitBreaker`] (spec section 3/4.5).
#[derive(Clone)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    /// Error kinds that neither count as a success nor a failure.
    pub ignore_exceptions: std::sync::Arc<dyn Fn(&QueryCacheError) -> bool + Send + Sync>,
}

impl std::fmt::Debug for CircuitBreakerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerOptions")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        CircuitBreakerOptions {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            ignore_exceptions: std::sync::Arc::new(|_| false),
        }
    }
}

/// The three-state breaker state machine (spec section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    reset_at: Option<Instant>,
    /// Set while a probe request is outstanding in `HalfOpen`, so a second
    /// concurrent caller does not also get admitted (spec's "at-most-one
    /// probe" property).
    probe_in_flight: bool,
}

/// Per-scope failure shedding. One `CircuitBreaker` exists per scope string
/// (default: the query key), held by [`crate::circuit_breaker_registry::CircuitBreakerRegistry`].
///
/// Mutation is guarded by a single `std::sync::Mutex`, matching spec section
/// 5's requirement of "a single reentrant guard per CircuitBreaker" — no
/// `.await` happens while the lock is held, so a plain `Mutex` (not
/// `tokio::sync::Mutex`) is sufficient and cheaper.
pub struct CircuitBreaker {
    scope: String,
    options: CircuitBreakerOptions,
    inner: Mutex<Inner>,
    on_open: Mutex<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl CircuitBreaker {
    pub fn new(scope: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        CircuitBreaker {
            scope: scope.into(),
            options,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                reset_at: None,
                probe_in_flight: false,
            }),
            on_open: Mutex::new(Vec::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker poisoned").state
    }

    pub fn on_open(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.on_open.lock().expect("breaker poisoned").push(Box::new(callback));
    }

    fn fire_open_callbacks(&self) {
        for callback in self.on_open.lock().expect("breaker poisoned").iter() {
            callback(&self.scope);
        }
    }

    /// Gates a request. Returns `Ok(())` if the request may proceed
    /// (possibly as the single `HalfOpen` probe), or
    /// `Err(CircuitBreakerOpen)` if it must fail fast.
    pub fn allow_request(&self) -> Result<(), QueryCacheError> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let past_reset = inner.reset_at.is_some_and(|t| Instant::now() >= t);
                if past_reset {
                    inner.state = BreakerState::HalfOpen;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.probe_in_flight = true;
                    info!(scope = %self.scope, "circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(QueryCacheError::CircuitBreakerOpen {
                        scope: self.scope.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(QueryCacheError::CircuitBreakerOpen {
                        scope: self.scope.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records the outcome of a request admitted by `allow_request`. `error`
    /// is `None` for success. Errors for which `ignore_exceptions` returns
    /// true are recorded as neither success nor failure.
    pub fn record_outcome(&self, error: Option<&QueryCacheError>) {
        if let Some(err) = error {
            if (self.options.ignore_exceptions)(err) {
                let mut inner = self.inner.lock().expect("breaker poisoned");
                inner.probe_in_flight = false;
                return;
            }
        }

        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.probe_in_flight = false;
        match (inner.state, error) {
            (BreakerState::Closed, None) => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            (BreakerState::Closed, Some(_)) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.options.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            (BreakerState::HalfOpen, None) => {
                inner.success_count += 1;
                if inner.success_count >= self.options.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(scope = %self.scope, "circuit breaker closed after successful probe");
                }
            }
            (BreakerState::HalfOpen, Some(_)) => {
                self.trip(&mut inner);
            }
            (BreakerState::Open, _) => {
                warn!(scope = %self.scope, "recorded outcome while breaker open, ignoring");
            }
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.reset_at = Some(Instant::now().plus(self.options.reset_timeout));
        inner.failure_count = 0;
        inner.success_count = 0;
        self.fire_open_callbacks();
        warn!(scope = %self.scope, "circuit breaker open");
    }
}
