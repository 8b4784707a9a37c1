//! Priority request scheduler with circuit breaking and category backoff.
//!
//! All tracker calls flow through one scheduler: a priority queue drained
//! by a fixed pool of workers, gated by a shared [`CircuitBreaker`] and a
//! scheduler-wide rate-limit pause. Failed attempts are classified once,
//! then either re-queued after the category backoff delay or returned to
//! the caller as a [`ClassifiedError`].

pub mod backoff;
mod circuit_breaker;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::api::RateLimitInfo;
use crate::classify::{ClassifiedError, ErrorClassifier, ErrorContext, FailureCategory};
use crate::{TrackerError, TrackerResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent in-flight tracker calls (worker pool size)
    pub max_concurrent: usize,

    /// Per-attempt timeout. Expiry abandons the in-flight call; its final
    /// remote state is unknown and callers must consult replay safety
    /// before re-creating anything.
    pub request_timeout: Duration,

    /// Categories for which a critical-priority submission that exhausts
    /// its retries may fall back to a degraded result, when the caller
    /// supplied one. Empty by default: exhaustion fails to the caller.
    pub degrade_on: HashSet<FailureCategory>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            request_timeout: Duration::from_secs(30),
            degrade_on: HashSet::new(),
        }
    }
}

/// Priority band. Strict ordering between bands; FIFO within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

type OpFn<T> = Box<dyn Fn() -> BoxFuture<'static, TrackerResult<T>> + Send + Sync>;

/// Outcome of one attempt: `None` when the job completed (result already
/// sent to the submitter), or the job plus the delay before re-queueing.
type AttemptOutcome = Option<(BoxedJob, Duration)>;

#[async_trait]
trait RunnableJob: Send {
    async fn attempt(self: Box<Self>, shared: &Shared) -> AttemptOutcome;

    /// Fail the job without running it (scheduler shut down)
    fn abandon(self: Box<Self>);
}

type BoxedJob = Box<dyn RunnableJob>;

struct SubmittedJob<T> {
    op: OpFn<T>,
    tx: Option<oneshot::Sender<Result<T, ClassifiedError>>>,
    context: ErrorContext,
    priority: Priority,
    retry_count: u32,
    fallback: Option<T>,
}

impl<T: Send + 'static> SubmittedJob<T> {
    fn send(&mut self, result: Result<T, ClassifiedError>) {
        if let Some(tx) = self.tx.take() {
            // Submitter may have dropped the receiver; nothing to do then
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl<T: Send + 'static> RunnableJob for SubmittedJob<T> {
    async fn attempt(mut self: Box<Self>, shared: &Shared) -> AttemptOutcome {
        // Breaker gate: refuse before touching the tracker
        if let Err(refusal) = shared.breaker.check() {
            let mut classified = shared.classifier.classify(refusal, self.context.clone());
            classified.retry_count = self.retry_count;
            debug!(
                operation = %self.context.operation,
                target = %self.context.target,
                "submission refused by open circuit"
            );
            self.send(Err(classified));
            return None;
        }

        let attempt = tokio::time::timeout(shared.config.request_timeout, (self.op)()).await;
        let error = match attempt {
            Ok(Ok(value)) => {
                shared.breaker.record_success();
                self.send(Ok(value));
                return None;
            }
            Ok(Err(e)) => e,
            // The in-flight call is abandoned; its remote outcome is
            // unknown. Replay safety is the store's job, not ours.
            Err(_) => TrackerError::Timeout(format!(
                "no response within {}",
                humantime::format_duration(shared.config.request_timeout)
            )),
        };

        let mut classified = shared.classifier.classify(error, self.context.clone());
        classified.retry_count = self.retry_count;
        let category = classified.classification.category;
        shared.breaker.record_failure(category);

        if category == FailureCategory::RateLimited {
            // One throttled response pauses the whole queue, not just
            // this job
            shared.pause_for(backoff::retry_delay(&classified, self.retry_count));
        }

        if classified.can_retry() {
            let delay = backoff::retry_delay(&classified, self.retry_count);
            warn!(
                operation = %self.context.operation,
                target = %self.context.target,
                category = %category,
                attempt = self.retry_count + 1,
                delay = %humantime::format_duration(delay),
                "attempt failed, re-queueing"
            );
            self.retry_count += 1;
            return Some((self as BoxedJob, delay));
        }

        if self.priority == Priority::Critical && shared.config.degrade_on.contains(&category) {
            if let Some(fallback) = self.fallback.take() {
                warn!(
                    operation = %self.context.operation,
                    target = %self.context.target,
                    category = %category,
                    "retries exhausted, degrading to fallback result"
                );
                self.send(Ok(fallback));
                return None;
            }
        }

        self.send(Err(classified));
        None
    }

    fn abandon(mut self: Box<Self>) {
        let classified =
            ErrorClassifier::new().classify(TrackerError::Interrupted, self.context.clone());
        self.send(Err(classified));
    }
}

struct QueuedJob {
    priority: Priority,
    seq: u64,
    job: BoxedJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher band first, then older sequence number first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    notify: Notify,
    pause_until: Mutex<Option<tokio::time::Instant>>,
    breaker: CircuitBreaker,
    classifier: ErrorClassifier,
    config: SchedulerConfig,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, priority: Priority, job: BoxedJob) {
        let abandoned = {
            let mut q = self.lock_queue();
            if q.shutdown {
                Some(job)
            } else {
                let seq = q.next_seq;
                q.next_seq += 1;
                q.heap.push(QueuedJob { priority, seq, job });
                None
            }
        };
        match abandoned {
            Some(job) => job.abandon(),
            None => self.notify.notify_one(),
        }
    }

    fn pause_for(&self, delay: Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        let mut pause = self.pause_until.lock().unwrap_or_else(|e| e.into_inner());
        // Keep the later deadline if several throttles overlap
        if pause.map_or(true, |existing| deadline > existing) {
            info!(
                pause = %humantime::format_duration(delay),
                "rate limit pressure, pausing scheduler queue"
            );
            *pause = Some(deadline);
        }
    }

    fn pause_deadline(&self) -> Option<tokio::time::Instant> {
        let mut pause = self.pause_until.lock().unwrap_or_else(|e| e.into_inner());
        match *pause {
            Some(deadline) if deadline > tokio::time::Instant::now() => Some(deadline),
            Some(_) => {
                *pause = None;
                None
            }
            None => None,
        }
    }
}

/// Shared entry point for all tracker calls. Construct once per workflow
/// (requires a running tokio runtime) and share behind an `Arc`.
pub struct RequestScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig, breaker_config: CircuitBreakerConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
            pause_until: Mutex::new(None),
            breaker: CircuitBreaker::new(breaker_config),
            classifier: ErrorClassifier::new(),
            config,
        });

        let pool_size = shared.config.max_concurrent.max(1);
        let workers = (0..pool_size)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    debug!(worker, "scheduler worker started");
                    worker_loop(shared).await;
                    debug!(worker, "scheduler worker stopped");
                })
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Submit an operation and wait for its final outcome. The factory is
    /// invoked once per attempt; retries re-enter the queue at the same
    /// priority after the category backoff delay.
    pub async fn submit<T, F, Fut>(
        &self,
        operation: F,
        context: ErrorContext,
        priority: Priority,
    ) -> Result<T, ClassifiedError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TrackerResult<T>> + Send + 'static,
    {
        self.submit_inner(operation, context, priority, None).await
    }

    /// Like [`submit`](Self::submit), but with a degraded result to return
    /// if a critical-priority submission exhausts its retries on a
    /// category listed in `SchedulerConfig::degrade_on`.
    pub async fn submit_with_fallback<T, F, Fut>(
        &self,
        operation: F,
        fallback: T,
        context: ErrorContext,
        priority: Priority,
    ) -> Result<T, ClassifiedError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TrackerResult<T>> + Send + 'static,
    {
        self.submit_inner(operation, context, priority, Some(fallback))
            .await
    }

    async fn submit_inner<T, F, Fut>(
        &self,
        operation: F,
        context: ErrorContext,
        priority: Priority,
        fallback: Option<T>,
    ) -> Result<T, ClassifiedError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TrackerResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let op: OpFn<T> = Box::new(move || operation().boxed());
        let job = SubmittedJob {
            op,
            tx: Some(tx),
            context: context.clone(),
            priority,
            retry_count: 0,
            fallback,
        };
        self.shared.push(priority, Box::new(job));

        match rx.await {
            Ok(result) => result,
            // Sender dropped without a result; only happens mid-shutdown
            Err(_) => Err(self
                .shared
                .classifier
                .classify(TrackerError::Interrupted, context)),
        }
    }

    /// Feed observed rate-limit headers into the scheduler. An exhausted
    /// window pauses the whole queue until the reported reset time.
    pub fn record_rate_limit(&self, info: &RateLimitInfo) {
        if !info.exhausted() {
            return;
        }
        let wait = (info.reset_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.shared.pause_for(wait);
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.lock_queue().heap.len()
    }

    /// Stop intake and wait for in-flight and already-queued work to
    /// finish. Retries that would re-queue after shutdown fail with an
    /// interrupted classification instead.
    pub async fn shutdown(&self) {
        {
            let mut q = self.shared.lock_queue();
            q.shutdown = true;
        }
        self.shared.notify.notify_waiters();

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            // Worker tasks never panic; a join error still must not take
            // shutdown down with it
            let _ = handle.await;
        }
        info!("scheduler shut down");
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        if let Some(deadline) = shared.pause_deadline() {
            tokio::time::sleep_until(deadline).await;
            continue;
        }

        // Arm the wakeup before inspecting the queue so a push between
        // the pop and the await is never missed
        let notified = shared.notify.notified();

        let popped = {
            let mut q = shared.lock_queue();
            match q.heap.pop() {
                Some(entry) => Some(entry),
                None if q.shutdown => return,
                None => None,
            }
        };

        match popped {
            Some(entry) => {
                if let Some((job, delay)) = entry.job.attempt(&shared).await {
                    let shared = Arc::clone(&shared);
                    let priority = entry.priority;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.push(priority, job);
                    });
                }
            }
            None => notified.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationContext;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn ctx(operation: &str) -> ErrorContext {
        ErrorContext::new(operation, "task-1", CorrelationContext::root("wf-test"))
    }

    fn scheduler(max_concurrent: usize) -> RequestScheduler {
        RequestScheduler::new(
            SchedulerConfig {
                max_concurrent,
                request_timeout: Duration::from_secs(5),
                degrade_on: HashSet::new(),
            },
            CircuitBreakerConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_returns_operation_result() {
        let sched = scheduler(2);
        let result = sched
            .submit(|| async { Ok::<_, TrackerError>(7u32) }, ctx("get_issue"), Priority::Medium)
            .await;
        assert_eq!(result.unwrap(), 7);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_until_success() {
        let sched = scheduler(2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = sched
            .submit(
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                            Err(TrackerError::Http {
                                status: 502,
                                message: "bad gateway".to_string(),
                            })
                        } else {
                            Ok(99u32)
                        }
                    }
                },
                ctx("create_issue"),
                Priority::High,
            )
            .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_never_retried() {
        let sched = scheduler(2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, _> = sched
            .submit(
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, AtomicOrdering::SeqCst);
                        Err(TrackerError::Http {
                            status: 422,
                            message: "invalid payload".to_string(),
                        })
                    }
                },
                ctx("create_issue"),
                Priority::Medium,
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.classification.category, FailureCategory::Validation);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_classified_and_retried_to_exhaustion() {
        let sched = RequestScheduler::new(
            SchedulerConfig {
                max_concurrent: 1,
                request_timeout: Duration::from_millis(100),
                degrade_on: HashSet::new(),
            },
            CircuitBreakerConfig {
                failure_threshold: 100,
                open_timeout: Duration::from_secs(30),
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, _> = sched
            .submit(
                move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(0u32)
                    }
                },
                ctx("update_issue"),
                Priority::Medium,
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.classification.category, FailureCategory::Timeout);
        // Initial attempt plus the full timeout retry budget
        assert_eq!(
            calls.load(AtomicOrdering::SeqCst),
            1 + err.classification.max_retries
        );
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_invoking_operation() {
        let sched = RequestScheduler::new(
            SchedulerConfig::default(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(300),
            },
        );
        sched.breaker().record_failure(FailureCategory::Server);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, _> = sched
            .submit(
                move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    async move { Ok(1u32) }
                },
                ctx("create_issue"),
                Priority::Medium,
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.classification.category, FailureCategory::CircuitBreaker);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_bands_drain_in_order() {
        let sched = Arc::new(scheduler(1));
        let gate = Arc::new(Notify::new());
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so the queue backs up
        let blocker = {
            let sched = Arc::clone(&sched);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                sched
                    .submit(
                        move || {
                            let gate = Arc::clone(&gate);
                            async move {
                                gate.notified().await;
                                Ok::<_, TrackerError>(())
                            }
                        },
                        ctx("blocker"),
                        Priority::Critical,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut waiters = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("medium", Priority::Medium),
        ] {
            let sched = Arc::clone(&sched);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                sched
                    .submit(
                        move || {
                            let order = Arc::clone(&order);
                            async move {
                                order.lock().unwrap().push(label);
                                Ok::<_, TrackerError>(())
                            }
                        },
                        ctx(label),
                        priority,
                    )
                    .await
            }));
            // Let each submission land in the queue before the next
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        gate.notify_one();
        blocker.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["critical", "medium", "low"]);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rate_limit_window_pauses_queue() {
        let sched = scheduler(2);
        sched.record_rate_limit(&RateLimitInfo {
            remaining: 0,
            limit: 60,
            reset_at: chrono::Utc::now() + chrono::Duration::seconds(2),
        });

        let started = tokio::time::Instant::now();
        let result = sched
            .submit(|| async { Ok::<_, TrackerError>(()) }, ctx("list_issues"), Priority::High)
            .await;
        result.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1500));
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_submission_degrades_to_fallback() {
        let sched = RequestScheduler::new(
            SchedulerConfig {
                max_concurrent: 1,
                request_timeout: Duration::from_secs(5),
                degrade_on: [FailureCategory::Server].into_iter().collect(),
            },
            CircuitBreakerConfig {
                failure_threshold: 100,
                open_timeout: Duration::from_secs(30),
            },
        );
        let result = sched
            .submit_with_fallback(
                || async {
                    Err::<u32, _>(TrackerError::Http {
                        status: 500,
                        message: "boom".to_string(),
                    })
                },
                42u32,
                ctx("create_issue"),
                Priority::Critical,
            )
            .await;
        assert_eq!(result.unwrap(), 42);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_shutdown_is_interrupted() {
        let sched = scheduler(1);
        sched.shutdown().await;

        let result: Result<u32, _> = sched
            .submit(|| async { Ok(5u32) }, ctx("get_issue"), Priority::Low)
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err.error, TrackerError::Interrupted));
    }
}
