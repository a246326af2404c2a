use std::sync::Arc;

use tracing::warn;

use crate::query_options::{PerformanceOptions, QueryOptions};

/// Applies `options.data_transformer`, if any, to a freshly fetched value
/// (spec section 4.3). Runs on a `tokio::task::spawn_blocking` worker when
/// `performance.auto_isolate` is set and the value's estimated size meets
/// `isolate_threshold`; otherwise runs inline. Either way, a transformer
/// that panics falls back silently to the untransformed value (spec: "on
/// any transform failure fall back to the original") — a clone of `value`
/// is kept on hand so the original survives a panic on either path.
pub(crate) async fn apply_transform<V>(options: &QueryOptions<V>, size_bytes: usize, value: V) -> V
where
    V: Clone + Send + 'static,
{
    let Some(transformer) = options.data_transformer.clone() else {
        return value;
    };
    if !options.performance.enable_data_transform {
        return value;
    }

    if should_isolate(&options.performance, size_bytes) {
        run_isolated(transformer, value).await
    } else {
        run_inline(transformer, value)
    }
}

fn should_isolate(performance: &PerformanceOptions, size_bytes: usize) -> bool {
    performance.auto_isolate
        && performance
            .isolate_threshold
            .is_some_and(|threshold| size_bytes >= threshold)
}

fn run_inline<V: Clone>(transformer: Arc<dyn Fn(V) -> V + Send + Sync>, value: V) -> V {
    let fallback = value.clone();
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| transformer(value))) {
        Ok(transformed) => transformed,
        Err(_) => {
            warn!("data transform panicked inline, falling back to the untransformed value");
            fallback
        }
    }
}

async fn run_isolated<V>(transformer: Arc<dyn Fn(V) -> V + Send + Sync>, value: V) -> V
where
    V: Clone + Send + 'static,
{
    let fallback = value.clone();
    let handle = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| transformer(value)))
    });
    match handle.await {
        Ok(Ok(transformed)) => transformed,
        Ok(Err(_)) => {
            warn!("data transform worker panicked, falling back to the untransformed value");
            fallback
        }
        Err(join_err) => {
            warn!(error = %join_err, "data transform worker was cancelled, falling back to the untransformed value");
            fallback
        }
    }
}
