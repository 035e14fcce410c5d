use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, info_span, warn};

use crate::error::{Error, Result};
use crate::scope::Scope;

/// Why one scope produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub scope: String,
    pub operation: String,
    pub kind: &'static str,
    pub message: String,
}

impl FailureRecord {
    pub fn new(scope: &Scope, operation: &str, error: &Error) -> Self {
        Self {
            scope: scope.to_string(),
            operation: operation.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Results and failures of one fan-out, both in input scope order.
#[derive(Debug)]
pub struct Collected<T> {
    pub results: Vec<T>,
    pub failures: Vec<FailureRecord>,
}

impl<T> Default for Collected<T> {
    fn default() -> Self {
        Self {
            results: vec![],
            failures: vec![],
        }
    }
}

/// Runs one operation per scope with bounded concurrency. A failing or
/// timed-out scope becomes a `FailureRecord`; siblings always run.
pub struct Collector {
    max_concurrency: usize,
    scope_timeout: Duration,
    deadline: Option<(Instant, Duration)>,
}

impl Collector {
    pub fn builder() -> CollectorBuilder {
        CollectorBuilder {
            max_concurrency: 8,
            scope_timeout: Duration::from_secs(60),
            deadline: None,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, scopes: Vec<Scope>, op: F) -> Collected<T>
    where
        F: Fn(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let sem = Semaphore::new(self.max_concurrency);

        let futures: Vec<_> = scopes
            .into_iter()
            .map(|scope| {
                let span = info_span!("scope", scope = %scope, operation);
                let sem = &sem;
                let op = &op;
                async move {
                    let label = scope.clone();
                    let outcome = self.run_one(sem, scope, op).await;
                    match outcome {
                        Ok(value) => {
                            debug!("scope succeeded");
                            Ok(value)
                        }
                        Err(e) => {
                            warn!(
                                operation,
                                scope = %label,
                                kind = e.kind(),
                                error = %e,
                                "scope failed"
                            );
                            Err(FailureRecord::new(&label, operation, &e))
                        }
                    }
                }
                .instrument(span)
            })
            .collect();

        let mut collected = Collected::default();
        for outcome in join_all(futures).await {
            match outcome {
                Ok(value) => collected.results.push(value),
                Err(failure) => collected.failures.push(failure),
            }
        }
        collected
    }

    async fn run_one<T, F, Fut>(&self, sem: &Semaphore, scope: Scope, op: &F) -> Result<T>
    where
        F: Fn(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = match self.deadline {
            Some((deadline, budget)) => timeout_at(deadline, sem.acquire())
                .await
                .map_err(|_| Error::Timeout(budget))?,
            None => sem.acquire().await,
        }
        .map_err(|_| Error::Internal("scope semaphore closed".into()))?;

        debug!("scope running");
        let scope_deadline = Instant::now() + self.scope_timeout;
        let (limit, budget) = match self.deadline {
            Some((deadline, budget)) if deadline < scope_deadline => (deadline, budget),
            _ => (scope_deadline, self.scope_timeout),
        };

        timeout_at(limit, op(scope))
            .await
            .map_err(|_| Error::Timeout(budget))?
    }
}

pub struct CollectorBuilder {
    max_concurrency: usize,
    scope_timeout: Duration,
    deadline: Option<(Instant, Duration)>,
}

impl CollectorBuilder {
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn scope_timeout(mut self, timeout: Duration) -> Self {
        self.scope_timeout = timeout;
        self
    }

    /// Overall request budget counted from `started`; pending and running
    /// scopes past it are recorded as timeouts.
    pub fn request_deadline(mut self, started: Instant, budget: Duration) -> Self {
        self.deadline = Some((started + budget, budget));
        self
    }

    pub fn build(self) -> Collector {
        Collector {
            max_concurrency: self.max_concurrency,
            scope_timeout: self.scope_timeout,
            deadline: self.deadline,
        }
    }
}
