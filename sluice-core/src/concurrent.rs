//! Independent reads run side by side.
//!
//! Each query runs as its own tokio task in its own connection scope; no
//! connection is ever shared between tasks. Results come back in input
//! order whatever order the tasks finish in. Nothing is implied about the
//! order in which the tasks' transactions commit.
//!
//! Two failure policies are offered:
//!
//! - [`FetchCoordinator::fetch_all`] waits for every query to settle and
//!   reports each outcome separately.
//! - [`FetchCoordinator::try_fetch_all`] returns on the first failure and
//!   aborts the queries still running.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{DbError, Result};
use crate::retry::{self, RetryPolicy};
use crate::row::{Row, Value};
use crate::scope::ConnectionScope;

/// How [`FetchCoordinator::fetch`] reacts to a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Wait for every query, report each result.
    #[default]
    SettleAll,
    /// Return the first failure, abort the rest.
    FailFast,
}

/// One read to run.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QuerySpec {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl From<&str> for QuerySpec {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

type Settled = BoxFuture<'static, (usize, Result<Vec<Row>>)>;

/// Aborts every task it tracks when dropped. Aborting a finished task is
/// a no-op.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub struct FetchCoordinator {
    scope: ConnectionScope,
    max_in_flight: usize,
    retry: Option<RetryPolicy>,
    deadline: Option<Instant>,
}

impl FetchCoordinator {
    /// At most one query per CPU in flight by default.
    pub fn new(scope: ConnectionScope) -> Self {
        Self {
            scope,
            max_in_flight: num_cpus::get().max(1),
            retry: None,
            deadline: None,
        }
    }

    /// Cap on concurrently open scopes; values below 1 are raised to 1.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Retry each query independently under `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Fail every query still unsettled at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Run every query; one result per query, in input order.
    pub async fn fetch_all(&self, queries: Vec<QuerySpec>) -> Vec<Result<Vec<Row>>> {
        let total = queries.len();
        let started = Instant::now();
        let (mut pending, _guard) = self.spawn_all(queries);

        let mut slots: Vec<Option<Result<Vec<Row>>>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = pending.next().await {
            if let Err(err) = &outcome {
                debug!(index, error = %err, "query failed");
            }
            slots[index] = Some(outcome);
        }

        let results: Vec<_> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(DbError::TaskFailed {
                        index,
                        reason: "task never settled".to_string(),
                    })
                })
            })
            .collect();
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            queries = total,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "concurrent fetch settled"
        );
        results
    }

    /// Run every query; the first failure is returned as soon as it is
    /// observed and the queries still in flight are aborted.
    pub async fn try_fetch_all(&self, queries: Vec<QuerySpec>) -> Result<Vec<Vec<Row>>> {
        let total = queries.len();
        let started = Instant::now();
        let (mut pending, _guard) = self.spawn_all(queries);

        let mut slots: Vec<Option<Vec<Row>>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = pending.next().await {
            match outcome {
                Ok(rows) => slots[index] = Some(rows),
                Err(err) => {
                    warn!(
                        index,
                        error = %err,
                        unsettled = pending.len(),
                        "query failed, aborting remaining fetches"
                    );
                    return Err(err);
                }
            }
        }

        info!(
            queries = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "concurrent fetch completed"
        );
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| DbError::TaskFailed {
                    index,
                    reason: "task never settled".to_string(),
                })
            })
            .collect()
    }

    /// Dispatch on `policy`. Under fail-fast the outer error is the first
    /// failure; under settle-all the outer result is always `Ok`.
    pub async fn fetch(
        &self,
        queries: Vec<QuerySpec>,
        policy: FailurePolicy,
    ) -> Result<Vec<Result<Vec<Row>>>> {
        match policy {
            FailurePolicy::SettleAll => Ok(self.fetch_all(queries).await),
            FailurePolicy::FailFast => Ok(self
                .try_fetch_all(queries)
                .await?
                .into_iter()
                .map(Ok)
                .collect()),
        }
    }

    fn spawn_all(&self, queries: Vec<QuerySpec>) -> (FuturesUnordered<Settled>, AbortOnDrop) {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let pending = FuturesUnordered::new();
        let mut aborts = Vec::with_capacity(queries.len());

        for (index, spec) in queries.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let scope = self.scope.clone();
            let policy = self.retry.clone();
            let deadline = self.deadline;

            let work = async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| DbError::TaskFailed {
                    index,
                    reason: "coordinator shut down".to_string(),
                })?;
                let fetch = async {
                    match &policy {
                        Some(policy) => {
                            scope
                                .fetch_all_with_retry(policy, &spec.sql, &spec.params)
                                .await
                        }
                        None => scope.fetch_all(&spec.sql, &spec.params).await,
                    }
                };
                match deadline {
                    Some(deadline) => retry::with_deadline(deadline, fetch).await,
                    None => fetch.await,
                }
            };

            let handle = tokio::spawn(work.instrument(info_span!("fetch_task", index)));
            aborts.push(handle.abort_handle());
            pending.push(
                handle
                    .map(move |joined| (index, settle(index, joined)))
                    .boxed(),
            );
        }

        (pending, AbortOnDrop(aborts))
    }
}

fn settle(index: usize, joined: std::result::Result<Result<Vec<Row>>, JoinError>) -> Result<Vec<Row>> {
    joined.unwrap_or_else(|err| {
        Err(DbError::TaskFailed {
            index,
            reason: err.to_string(),
        })
    })
}
