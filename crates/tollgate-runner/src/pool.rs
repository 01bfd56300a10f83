//! Bounded fan-out for independent worker calls.
//!
//! ```text
//! jobs ──► JoinSet::spawn × N ──► Semaphore(limit) ──► results[request order]
//! ```
//!
//! Every job runs to completion even after one fails; the first failure (in
//! completion order) is reported alongside the ordered results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::worker::WorkerError;

/// Results of a bounded batch.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// One entry per job, in submission order.
    pub results: Vec<Result<T, WorkerError>>,
    /// Index of the job that failed first, if any did.
    pub first_error: Option<usize>,
}

impl<T> PoolOutcome<T> {
    pub fn all_ok(&self) -> bool {
        self.first_error.is_none()
    }
}

/// Run `jobs` with at most `limit` in flight.
pub async fn run_bounded<T, F>(limit: usize, jobs: Vec<F>) -> PoolOutcome<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, WorkerError>> + Send + 'static,
{
    let total = jobs.len();
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut join_set: JoinSet<Result<T, WorkerError>> = JoinSet::new();
    let mut index_of = HashMap::with_capacity(total);

    for (index, job) in jobs.into_iter().enumerate() {
        let sem = sem.clone();
        let handle = join_set.spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| WorkerError::Join(e.to_string()))?;
            job.await
        });
        index_of.insert(handle.id(), index);
    }

    let mut slots: Vec<Option<Result<T, WorkerError>>> = (0..total).map(|_| None).collect();
    let mut first_error = None;

    while let Some(joined) = join_set.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => (e.id(), Err(WorkerError::from(e))),
        };
        let Some(&index) = index_of.get(&id) else {
            continue;
        };
        if let Err(e) = &result {
            warn!(job = index, error = %e, "Pool job failed");
            first_error.get_or_insert(index);
        } else {
            debug!(job = index, "Pool job finished");
        }
        slots[index] = Some(result);
    }

    let results = slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(WorkerError::Join("job lost".into()))))
        .collect();
    PoolOutcome {
        results,
        first_error,
    }
}
