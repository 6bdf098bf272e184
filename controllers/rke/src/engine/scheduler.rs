//! Bounded task scheduling over hosts
//!
//! A layer is released as a set of tasks. Parallel layers run at most
//! `fan_out` tasks at once; serial layers stop at the first failure.
//! Cancellation is observed before each task starts, so in-flight Docker
//! calls always run to completion.

use crate::error::EngineError;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs host tasks under the fan-out limit
#[derive(Debug, Clone)]
pub struct Scheduler {
    fan_out: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(fan_out: usize, cancel: CancellationToken) -> Self {
        Self {
            fan_out: fan_out.max(1),
            cancel,
        }
    }

    /// Fail with `EngineError::Cancelled` once the run was cancelled
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Cancelled` after cancellation.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `task` for every item concurrently, results in input order
    pub async fn run_parallel<T, R, F, Fut>(&self, items: impl IntoIterator<Item = T>, task: F) -> Vec<Result<R, EngineError>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        let semaphore = Semaphore::new(self.fan_out);
        let semaphore = &semaphore;
        let task = &task;
        let mut running: FuturesUnordered<_> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) if !self.cancel.is_cancelled() => task(item).await,
                    _ => Err(EngineError::Cancelled),
                };
                (i, result)
            })
            .collect();

        let mut results = Vec::with_capacity(running.len());
        while let Some(done) = running.next().await {
            results.push(done);
        }
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Run `task` for each item in order, stopping at the first error
    ///
    /// # Errors
    ///
    /// Returns the first task error, or `EngineError::Cancelled`.
    pub async fn run_serial<T, R, F, Fut>(&self, items: impl IntoIterator<Item = T>, task: F) -> Result<Vec<R>, EngineError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        let mut out = Vec::new();
        for item in items {
            self.checkpoint()?;
            out.push(task(item).await?);
        }
        Ok(out)
    }
}

/// Join a layer: the first fatal error aborts, non-fatal ones are returned
///
/// # Errors
///
/// Returns the first error that is not `EngineError::is_non_fatal`.
pub fn barrier<R>(layer: &str, results: Vec<Result<R, EngineError>>) -> Result<(Vec<R>, Vec<EngineError>), EngineError> {
    let mut done = Vec::new();
    let mut recorded = Vec::new();
    let mut fatal = None;
    for result in results {
        match result {
            Ok(r) => done.push(r),
            Err(e) if e.is_non_fatal() => {
                warn!("[{}] {}", layer, e);
                recorded.push(e);
            }
            Err(e) => {
                if fatal.is_none() {
                    fatal = Some(e);
                } else {
                    warn!("[{}] {}", layer, e);
                }
            }
        }
    }
    if let Some(e) = fatal {
        return Err(e);
    }
    debug!("[{}] Barrier passed: {} done, {} recorded", layer, done.len(), recorded.len());
    Ok((done, recorded))
}
