//! Bounded worker pool for order-independent work items.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

use crate::error::{MigrateError, Result};

/// Run `job` over every item with at most `workers` running at once.
///
/// Each job runs on its own task. A failing or panicking job surfaces as an
/// `Err` next to its item; the other jobs keep running. Results come back in
/// input order.
pub async fn run_bounded<I, T, F, Fut>(items: Vec<I>, workers: usize, job: F) -> Vec<(I, Result<T>)>
where
    I: Clone,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let semaphore = semaphore.clone();
        let work = job(item.clone());
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| MigrateError::pool(e.to_string(), "acquiring worker slot"))?;
            work.await
        });
        handles.push((item, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (item, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Worker task failed: {}", e);
                Err(MigrateError::pool(e.to_string(), "worker task"))
            }
        };
        results.push((item, result));
    }
    results
}
