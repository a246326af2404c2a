use std::{sync::Arc, time::Duration};

use dyn_clone::DynClone;

use crate::error::QueryCacheError;

/// A composable retry/backoff policy.
///
/// This is the teacher's `Schedule` trait (`schedule.rs`), generalized from
/// `Rc`-based single-threaded combinators to `Arc`-based ones so it can cross
/// `tokio::spawn` boundaries, and specialized to `QueryCacheError` in place
/// of a generic error type. The combinator set (`union`, `intersect`,
/// `clamp`, `take`) is unchanged: spec section 4.3's retry loop is exactly
/// `Schedules::exponential(initial_retry_delay, retry_backoff_multiplier)
/// .take(max_retries)`.
pub trait RetrySchedule: DynClone + Send {
    /// Returns the delay before the next attempt, or `None` to stop
    /// retrying. `error` is the failure that just occurred.
    fn next(&mut self, error: &QueryCacheError) -> Option<Duration>;

    fn clamp(self, min: Duration, max: Duration) -> Clamp<Self>
    where
        Self: Sized,
    {
        Clamp {
            schedule: self,
            min: Some(min),
            max: Some(max),
        }
    }

    fn take(self, n: u32) -> Take<Self>
    where
        Self: Sized,
    {
        Take { schedule: self, n }
    }
}

dyn_clone::clone_trait_object!(RetrySchedule);

/// A boxed, type-erased schedule. `QueryOptions::performance` stores one of
/// these so different queries can carry different retry policies.
pub type BoxedSchedule = Box<dyn RetrySchedule>;

#[derive(Clone)]
pub struct Exponential {
    base: Duration,
    factor: f64,
    attempt: u32,
}

impl RetrySchedule for Exponential {
    fn next(&mut self, _error: &QueryCacheError) -> Option<Duration> {
        let attempt = self.attempt;
        self.attempt += 1;
        if attempt == 0 {
            Some(self.base)
        } else {
            Some(self.base.mul_f64(self.factor.powi(attempt as i32)))
        }
    }
}

#[derive(Clone)]
pub struct Take<A> {
    schedule: A,
    n: u32,
}

impl<A: RetrySchedule> RetrySchedule for Take<A> {
    fn next(&mut self, error: &QueryCacheError) -> Option<Duration> {
        if self.n == 0 {
            return None;
        }
        self.n -= 1;
        self.schedule.next(error)
    }
}

#[derive(Clone)]
pub struct Clamp<A> {
    schedule: A,
    min: Option<Duration>,
    max: Option<Duration>,
}

impl<A: RetrySchedule> RetrySchedule for Clamp<A> {
    fn next(&mut self, error: &QueryCacheError) -> Option<Duration> {
        self.schedule.next(error).map(|d| {
            let d = self.min.map_or(d, |min| d.max(min));
            self.max.map_or(d, |max| d.min(max))
        })
    }
}

/// Constructs the standard exponential backoff schedule from
/// `QueryOptions::performance`: `initial_retry_delay * backoff_multiplier^n`,
/// stopped after `max_retries` attempts.
pub fn exponential_backoff(
    initial_retry_delay: Duration,
    backoff_multiplier: f64,
    max_retries: u32,
) -> BoxedSchedule {
    Box::new(
        Exponential {
            base: initial_retry_delay,
            factor: backoff_multiplier,
            attempt: 0,
        }
        .take(max_retries),
    )
}

/// Never retries (`max_retries == 0`).
pub fn no_retry() -> BoxedSchedule {
    Box::new(Exponential {
        base: Duration::ZERO,
        factor: 1.0,
        attempt: 0,
    }
    .take(0))
}

/// Runs `attempt` in a loop, sleeping between failures as directed by
/// `schedule`, until it succeeds or the schedule is exhausted. Retry does
/// not apply to cancellation, timeout, or `CircuitBreakerOpen` — those are
/// returned immediately (spec section 4.3).
pub async fn retry<T, F, Fut>(
    mut schedule: BoxedSchedule,
    mut attempt: F,
) -> Result<T, QueryCacheError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, QueryCacheError>>,
{
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() || err.is_circuit_breaker_open() || err.is_timeout() => return Err(err),
            Err(err) => match schedule.next(&err) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(err),
            },
        }
    }
}

/// Wraps a fallible async closure so `Arc<dyn Fn>` storage (used by
/// `QueryOptions`) can hold it.
pub type SharedFuture<T> =
    Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<T, QueryCacheError>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> QueryCacheError {
        QueryCacheError::FetchFailed {
            key: "k".into(),
            source: Box::new(std::io::Error::other("boom")),
        }
    }

    #[test]
    fn exponential_doubles() {
        let mut schedule = exponential_backoff(Duration::from_millis(100), 2.0, 10);
        assert_eq!(schedule.next(&err()), Some(Duration::from_millis(100)));
        assert_eq!(schedule.next(&err()), Some(Duration::from_millis(200)));
        assert_eq!(schedule.next(&err()), Some(Duration::from_millis(400)));
    }

    #[test]
    fn take_stops_after_n() {
        let mut schedule = exponential_backoff(Duration::from_millis(10), 2.0, 2);
        assert!(schedule.next(&err()).is_some());
        assert!(schedule.next(&err()).is_some());
        assert!(schedule.next(&err()).is_none());
    }

    #[test]
    fn no_retry_stops_immediately() {
        let mut schedule = no_retry();
        assert!(schedule.next(&err()).is_none());
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let schedule = exponential_backoff(Duration::from_millis(1), 1.0, 5);
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry(schedule, || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(err())
                } else {
                    Ok::<_, QueryCacheError>(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_does_not_retry_circuit_breaker_open() {
        let schedule = exponential_backoff(Duration::from_millis(1), 1.0, 5);
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = retry(schedule, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                Err(QueryCacheError::CircuitBreakerOpen {
                    scope: "s".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
