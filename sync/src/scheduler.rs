//! Rate-limited request lane.
//!
//! Every outbound backend call goes through one [`RequestScheduler`]. A
//! single worker task runs submissions one at a time in submission order,
//! spaces the start of consecutive attempts by at least `min_interval`, and
//! retries quota and transient failures with backoff.

use crate::config::{RetryPolicy, SyncConfig};
use crate::error::{BackendError, BackendResult, ErrorClass, SyncError, SyncResult};
use checkin_engine::{now_millis, Timestamp};
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Counters kept by the lane.
#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    quota_errors: AtomicU64,
    transient_errors: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    queue_depth: AtomicUsize,
    last_success: AtomicU64,
}

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// Attempts started, retries included
    pub requests: u64,
    /// Attempts that were retries
    pub retries: u64,
    /// Attempts that failed with a quota error
    pub quota_errors: u64,
    /// Attempts that failed with a transient error
    pub transient_errors: u64,
    /// Operations that ended in an error
    pub failures: u64,
    /// Operations that ran out of time
    pub timeouts: u64,
    /// Submissions queued or running
    pub queue_depth: usize,
    /// When an operation last succeeded
    pub last_success: Option<Timestamp>,
}

/// A type-erased submission the worker can run.
trait Job: Send {
    fn run<'a>(self: Box<Self>, lane: &'a mut Lane) -> BoxFuture<'a, ()>;
}

struct Submission<T, F> {
    name: String,
    op: F,
    reply: oneshot::Sender<SyncResult<T>>,
}

impl<T, F, Fut> Job for Submission<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = BackendResult<T>> + Send + 'static,
{
    fn run<'a>(self: Box<Self>, lane: &'a mut Lane) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Submission { name, op, reply } = *self;
            let result = lane.execute(&name, op).await;
            if reply.send(result).is_err() {
                debug!(op = %name, "submitter dropped before the result was ready");
            }
        })
    }
}

/// State owned by the worker task.
struct Lane {
    min_interval: Duration,
    retry: RetryPolicy,
    operation_timeout: Duration,
    last_start: Option<Instant>,
    counters: Arc<Counters>,
}

impl Lane {
    /// Run `op` with retries until it succeeds, fails for good, or the next
    /// attempt could not start within the operation budget.
    ///
    /// The budget is only checked between attempts. A call that has started
    /// always runs to completion.
    async fn execute<T, F, Fut>(&mut self, name: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let deadline = Instant::now() + self.operation_timeout;
        let mut retry = 0u32;
        loop {
            if !self.pace(deadline).await {
                return Err(self.timed_out(name, retry));
            }
            self.counters.requests.fetch_add(1, Ordering::Relaxed);

            let err = match op().await {
                Ok(value) => {
                    self.counters
                        .last_success
                        .store(now_millis(), Ordering::Relaxed);
                    if retry > 0 {
                        debug!(op = %name, retries = retry, "operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.count_error(&err);
            match self.next_delay(&err, retry) {
                Some(delay) if Instant::now() + delay < deadline => {
                    retry += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        op = %name,
                        class = %err.class,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "backend call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Some(_) => {
                    debug!(op = %name, error = %err.message, "no time left for another attempt");
                    return Err(self.timed_out(name, retry + 1));
                }
                None => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(op = %name, class = %err.class, error = %err.message, "operation failed");
                    return Err(if err.is_retryable() {
                        SyncError::RetriesExhausted {
                            op: name.to_string(),
                            attempts: retry + 1,
                            last: err,
                        }
                    } else {
                        SyncError::Permanent {
                            op: name.to_string(),
                            source: err,
                        }
                    });
                }
            }
        }
    }

    fn timed_out(&self, name: &str, attempts: u32) -> SyncError {
        let budget = self.operation_timeout;
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        error!(
            op = %name,
            attempts,
            budget_ms = budget.as_millis() as u64,
            "operation ran out of time"
        );
        SyncError::Timeout {
            op: name.to_string(),
            after: budget,
        }
    }

    /// Backoff before the next retry, or `None` if the error is final.
    fn next_delay(&self, err: &BackendError, retries_done: u32) -> Option<Duration> {
        if retries_done >= self.retry.max_retries {
            return None;
        }
        self.retry.delay_for(err.class, retries_done + 1)
    }

    fn count_error(&self, err: &BackendError) {
        let counter = match err.class {
            ErrorClass::QuotaExceeded => &self.counters.quota_errors,
            ErrorClass::Transient => &self.counters.transient_errors,
            ErrorClass::Permanent => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait until `min_interval` has passed since the previous attempt started.
    ///
    /// Returns false without waiting if that moment is past `deadline`.
    async fn pace(&mut self, deadline: Instant) -> bool {
        let now = Instant::now();
        let ready = match self.last_start {
            Some(previous) => (previous + self.min_interval).max(now),
            None => now,
        };
        if ready >= deadline {
            return false;
        }
        if ready > now {
            sleep_until(ready).await;
        }
        self.last_start = Some(Instant::now());
        true
    }
}

async fn run_worker(mut queue: mpsc::UnboundedReceiver<Box<dyn Job>>, mut lane: Lane) {
    info!(
        min_interval_ms = lane.min_interval.as_millis() as u64,
        max_retries = lane.retry.max_retries,
        "request scheduler started"
    );
    while let Some(job) = queue.recv().await {
        job.run(&mut lane).await;
        lane.counters.queue_depth.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("request scheduler stopped");
}

/// Handle to the request lane. Cheap to clone; the worker stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct RequestScheduler {
    queue: mpsc::UnboundedSender<Box<dyn Job>>,
    counters: Arc<Counters>,
}

impl RequestScheduler {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(config: &SyncConfig) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let retry = config.retry.clone().floored_at(config.min_interval);
        if retry != config.retry {
            warn!(
                base_ms = retry.quota_backoff_base.as_millis() as u64,
                "quota backoff base raised above the minimum interval"
            );
        }
        let lane = Lane {
            min_interval: config.min_interval,
            retry,
            operation_timeout: config.operation_timeout,
            last_start: None,
            counters: Arc::clone(&counters),
        };
        tokio::spawn(run_worker(receiver, lane));
        Self { queue, counters }
    }

    /// Queue `op` and wait for its final result.
    ///
    /// The submission is enqueued when this is called, not when the returned
    /// future is first polled, so submission order is call order. `op` is
    /// invoked once per attempt and must build a fresh call each time.
    pub fn submit<T, F, Fut>(
        &self,
        name: impl Into<String>,
        op: F,
    ) -> impl Future<Output = SyncResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job = Submission {
            name: name.into(),
            op,
            reply,
        };

        self.counters.queue_depth.fetch_add(1, Ordering::SeqCst);
        let queued = self.queue.send(Box::new(job)).is_ok();
        if !queued {
            self.counters.queue_depth.fetch_sub(1, Ordering::SeqCst);
        }

        async move {
            if !queued {
                return Err(SyncError::SchedulerClosed);
            }
            result.await.unwrap_or(Err(SyncError::SchedulerClosed))
        }
    }

    /// Submissions queued or running.
    pub fn queue_depth(&self) -> usize {
        self.counters.queue_depth.load(Ordering::SeqCst)
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        let last_success = c.last_success.load(Ordering::Relaxed);
        SchedulerStats {
            requests: c.requests.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            quota_errors: c.quota_errors.load(Ordering::Relaxed),
            transient_errors: c.transient_errors.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            queue_depth: c.queue_depth.load(Ordering::SeqCst),
            last_success: (last_success > 0).then_some(last_success),
        }
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}
