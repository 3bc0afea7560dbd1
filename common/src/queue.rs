//! Bounded task queue
//!
//! Runs at most `width` tasks at a time on the tokio runtime. Tasks are admitted as soon as a slot
//! frees up, in no particular order. Clones of a queue share the same slots and bookkeeping, so a
//! running task may push more work onto the queue it runs on; [`TaskQueue::join`] waits for those
//! too.
//!
//! What happens when a task fails is decided up front by the [`ErrorPolicy`]:
//!
//! - [`ErrorPolicy::AbortBatch`]: the first failure marks the queue aborted. Tasks that have not
//!   started yet are dropped without running, tasks already running are left to finish, and
//!   `join` returns the first failure.
//! - [`ErrorPolicy::LogAndContinue`]: failures are logged and counted, `join` succeeds.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use tracing::Instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    AbortBatch,
    LogAndContinue,
}

enum Outcome {
    Done,
    Failed(anyhow::Error),
    Cancelled,
}

#[derive(Debug, Default)]
struct Settled {
    settled: usize,
}

#[derive(Debug)]
struct Inner {
    slots: Arc<tokio::sync::Semaphore>,
    policy: ErrorPolicy,
    aborted: AtomicBool,
    pushed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    outcomes_tx: tokio::sync::mpsc::UnboundedSender<Outcome>,
    outcomes_rx: tokio::sync::Mutex<(tokio::sync::mpsc::UnboundedReceiver<Outcome>, Settled)>,
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done => write!(f, "Done"),
            Outcome::Failed(error) => write!(f, "Failed({error:#})"),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl TaskQueue {
    pub fn new(width: usize, policy: ErrorPolicy) -> Self {
        let (outcomes_tx, outcomes_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(tokio::sync::Semaphore::new(width.max(1))),
                policy,
                aborted: AtomicBool::new(false),
                pushed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                outcomes_tx,
                outcomes_rx: tokio::sync::Mutex::new((outcomes_rx, Settled::default())),
            }),
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.inner.policy
    }

    /// True once a task failed under [`ErrorPolicy::AbortBatch`].
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Number of tasks that failed so far.
    pub fn failures(&self) -> usize {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Number of tasks dropped without running because the batch was aborted.
    pub fn cancelled(&self) -> usize {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Enqueues `task`. Must be called from within a tokio runtime.
    ///
    /// The task runs in the span that is current when it is pushed.
    pub fn push<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.pushed.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = match inner.slots.clone().acquire_owned().await {
                Ok(_permit) if !inner.aborted.load(Ordering::Acquire) => {
                    let outcome = match std::panic::AssertUnwindSafe(task).catch_unwind().await {
                        Ok(Ok(())) => Outcome::Done,
                        Ok(Err(error)) => Outcome::Failed(error),
                        Err(payload) => Outcome::Failed(anyhow::anyhow!(
                            "task panicked: {}",
                            panic_message(payload.as_ref())
                        )),
                    };
                    if let Outcome::Failed(ref error) = outcome {
                        // mark the queue before the slot is released so that no queued task starts
                        inner.failed.fetch_add(1, Ordering::AcqRel);
                        match inner.policy {
                            ErrorPolicy::AbortBatch => inner.aborted.store(true, Ordering::Release),
                            ErrorPolicy::LogAndContinue => tracing::error!("{:#}", error),
                        }
                    }
                    outcome
                }
                _ => {
                    inner.cancelled.fetch_add(1, Ordering::AcqRel);
                    Outcome::Cancelled
                }
            };
            // the receiver lives in `inner`, which this task keeps alive
            let _ = inner.outcomes_tx.send(outcome);
        }
        .in_current_span());
    }

    /// Waits until every pushed task settled and returns all failures.
    async fn drain(&self) -> Vec<anyhow::Error> {
        let mut guard = self.inner.outcomes_rx.lock().await;
        let (receiver, settled) = &mut *guard;
        let mut failures = vec![];
        while settled.settled < self.inner.pushed.load(Ordering::Acquire) {
            match receiver.recv().await {
                Some(outcome) => {
                    settled.settled += 1;
                    match outcome {
                        Outcome::Done | Outcome::Cancelled => {}
                        Outcome::Failed(error) => failures.push(error),
                    }
                }
                None => break,
            }
        }
        let cancelled = self.cancelled();
        if cancelled > 0 {
            tracing::debug!("{} queued task(s) dropped after a failure", cancelled);
        }
        failures
    }

    /// Waits for all pushed tasks, including ones pushed while waiting.
    ///
    /// Under [`ErrorPolicy::AbortBatch`] returns the first failure once in-flight tasks settled;
    /// further failures are logged. Under [`ErrorPolicy::LogAndContinue`] always succeeds.
    pub async fn join(&self) -> anyhow::Result<()> {
        let mut failures = self.drain().await.into_iter();
        match (self.inner.policy, failures.next()) {
            (ErrorPolicy::AbortBatch, Some(first)) => {
                for other in failures {
                    tracing::error!("additional failure: {:#}", other);
                }
                Err(first)
            }
            _ => Ok(()),
        }
    }

    /// Like [`TaskQueue::join`] but never fails, returning every failure instead.
    pub async fn join_settled(&self) -> Vec<anyhow::Error> {
        self.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn concurrency_never_exceeds_width() -> anyhow::Result<()> {
        let queue = TaskQueue::new(3, ErrorPolicy::AbortBatch);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            queue.push(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.join().await?;
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[tokio::test]
    async fn join_waits_for_tasks_pushed_by_tasks() -> anyhow::Result<()> {
        let queue = TaskQueue::new(2, ErrorPolicy::AbortBatch);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let child_queue = queue.clone();
            let done = done.clone();
            queue.push(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let done_child = done.clone();
                child_queue.push(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done_child.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.join().await?;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn abort_batch_skips_queued_tasks() {
        let queue = TaskQueue::new(1, ErrorPolicy::AbortBatch);
        let started = Arc::new(AtomicUsize::new(0));
        queue.push(async { Err(anyhow::anyhow!("boom")) });
        for _ in 0..5 {
            let started = started.clone();
            queue.push(async move {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let error = queue.join().await.unwrap_err();
        assert_eq!(error.to_string(), "boom");
        assert!(queue.is_aborted());
        // the failing task held the only slot, nothing queued behind it may run
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(queue.failures(), 1);
        // join returned only after every queued task was dropped
        assert_eq!(queue.cancelled(), 5);
    }

    #[tokio::test]
    async fn abort_batch_lets_in_flight_tasks_settle() {
        let queue = TaskQueue::new(2, ErrorPolicy::AbortBatch);
        let finished = Arc::new(AtomicBool::new(false));
        {
            let finished = finished.clone();
            queue.push(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.push(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(anyhow::anyhow!("boom"))
        });
        assert!(queue.join().await.is_err());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[traced_test]
    async fn log_and_continue_runs_everything() -> anyhow::Result<()> {
        let queue = TaskQueue::new(2, ErrorPolicy::LogAndContinue);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let done = done.clone();
            queue.push(async move {
                done.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    return Err(anyhow::anyhow!("entry {} failed", i));
                }
                Ok(())
            });
        }
        queue.join().await?;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(queue.failures(), 5);
        assert!(!queue.is_aborted());
        Ok(())
    }

    #[tokio::test]
    async fn join_settled_collects_failures() {
        let queue = TaskQueue::new(4, ErrorPolicy::AbortBatch);
        queue.push(async { Err(anyhow::anyhow!("first")) });
        queue.push(async { Ok(()) });
        let failures = queue.join_settled().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].to_string(), "first");
    }

    #[tokio::test]
    async fn panicking_task_becomes_failure() {
        let queue = TaskQueue::new(1, ErrorPolicy::AbortBatch);
        queue.push(async { panic!("kaboom") });
        let error = queue.join().await.unwrap_err();
        assert!(error.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn empty_queue_joins_immediately() -> anyhow::Result<()> {
        TaskQueue::new(10, ErrorPolicy::AbortBatch).join().await
    }
}
