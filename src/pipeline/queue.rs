//! Bounded conversion queue.
//!
//! ## Shape
//!
//! ```text
//! submit ──▶ mpsc (FIFO) ──▶ worker 0 ──▶ ToolRunner
//!                       ├──▶ worker 1 ──▶ ToolRunner
//!                       └──▶ worker N-1
//! ```
//!
//! `concurrency` workers share one receiver behind a fair mutex, so tasks
//! leave the channel in submission order and at most `concurrency`
//! subprocesses exist at any instant, however many requests are in flight.
//!
//! ## Staleness
//!
//! A worker checks a task's age when it dequeues it. A task older than the
//! staleness threshold fails with [`ThumbError::QueueTimeout`] and the tool
//! is never started for it: under overload the waiting client is answered
//! quickly instead of receiving a conversion after it has given up.

use crate::config::{ConversionCommand, ProxyConfig};
use crate::error::ThumbError;
use crate::pipeline::runner::{ToolInvocation, ToolRunner};
use crate::transform::TransformSpec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

/// A single conversion owned by one request.
#[derive(Debug, Clone)]
pub struct ConversionTask {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub transform: TransformSpec,
    pub enqueued_at: Instant,
}

impl ConversionTask {
    /// A task stamped with the current instant.
    pub fn new(source: &Path, destination: &Path, transform: TransformSpec) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            transform,
            enqueued_at: Instant::now(),
        }
    }

    pub fn with_enqueued_at(mut self, at: Instant) -> Self {
        self.enqueued_at = at;
        self
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Fixed settings shared by every worker.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub command: ConversionCommand,
    pub concurrency: usize,
    pub staleness: Duration,
    pub execution_timeout: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ThumbError> {
        Ok(Self {
            command: config.conversion_command()?,
            concurrency: config.concurrency.max(1),
            staleness: config.staleness(),
            execution_timeout: config.convert_timeout(),
        })
    }
}

struct Job {
    task: ConversionTask,
    reply: oneshot::Sender<Result<Instant, ThumbError>>,
}

/// Handle to the worker pool. Cheap to clone; the workers stop once every
/// handle is dropped and the backlog has drained.
#[derive(Debug, Clone)]
pub struct ConversionQueue {
    sender: mpsc::UnboundedSender<Job>,
    concurrency: usize,
}

impl ConversionQueue {
    /// Spawn the workers on the current tokio runtime.
    pub fn start(settings: QueueSettings, runner: Arc<dyn ToolRunner>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let concurrency = settings.concurrency.max(1);
        let settings = Arc::new(settings);

        for id in 0..concurrency {
            tokio::spawn(work(
                id,
                Arc::clone(&receiver),
                Arc::clone(&runner),
                Arc::clone(&settings),
            ));
        }
        debug!("Conversion queue started with {} workers", concurrency);

        Self {
            sender,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue `task` and wait for its outcome.
    ///
    /// On success returns the instant a worker took the task off the queue,
    /// which splits queue wait from conversion time in the request trace.
    ///
    /// # Errors
    /// - [`ThumbError::QueueTimeout`] if the task went stale before a worker took it
    /// - [`ThumbError::ConversionFailed`] from the runner
    /// - [`ThumbError::Internal`] if the workers are gone or the runner panicked
    pub async fn submit(&self, task: ConversionTask) -> Result<Instant, ThumbError> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Job { task, reply })
            .map_err(|_| ThumbError::Internal("conversion queue is shut down".into()))?;
        outcome
            .await
            .map_err(|_| ThumbError::Internal("conversion worker dropped the task".into()))?
    }
}

async fn work(
    id: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    runner: Arc<dyn ToolRunner>,
    settings: Arc<QueueSettings>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            debug!("Conversion worker {} stopping", id);
            return;
        };

        // The requester is gone and its temp files with it; running the
        // tool now would only leave an orphaned output file behind.
        if job.reply.is_closed() {
            debug!("Worker {}: skipping abandoned task {}", id, job.task.source.display());
            continue;
        }

        let dequeued_at = Instant::now();
        let destination = job.task.destination.clone();
        let result = execute_isolated(id, job.task, &runner, &settings)
            .await
            .map(|()| dequeued_at);

        if job.reply.send(result).is_err() {
            // Abandoned while running: the tool may have recreated the file.
            if let Err(e) = tokio::fs::remove_file(&destination).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete {}: {}", destination.display(), e);
                }
            }
        }
    }
}

/// Run one task on its own tokio task so a panicking runner fails that job
/// and the worker keeps serving the queue.
async fn execute_isolated(
    id: usize,
    task: ConversionTask,
    runner: &Arc<dyn ToolRunner>,
    settings: &Arc<QueueSettings>,
) -> Result<(), ThumbError> {
    let runner = Arc::clone(runner);
    let settings = Arc::clone(settings);
    let source = task.source.clone();

    tokio::spawn(async move { execute(id, &task, runner.as_ref(), &settings).await })
        .await
        .unwrap_or_else(|e| {
            error!("Worker {}: conversion of {} aborted: {}", id, source.display(), e);
            Err(ThumbError::Internal(format!("conversion task aborted: {e}")))
        })
}

async fn execute(
    id: usize,
    task: &ConversionTask,
    runner: &dyn ToolRunner,
    settings: &QueueSettings,
) -> Result<(), ThumbError> {
    let age = task.age();
    if age > settings.staleness {
        warn!(
            "Worker {}: giving up on {} after waiting {}ms",
            id,
            task.source.display(),
            age.as_millis()
        );
        return Err(ThumbError::QueueTimeout {
            waited_ms: age.as_millis() as u64,
        });
    }

    let invocation =
        ToolInvocation::new(&settings.command, &task.transform, &task.source, &task.destination);
    debug!("Worker {}: {}", id, invocation.command_line());
    runner.run(&invocation, settings.execution_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Counts spawns and tracks how many runs overlap.
    #[derive(Default)]
    struct CountingRunner {
        delay: Duration,
        spawns: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: StdMutex<Vec<ToolInvocation>>,
    }

    impl CountingRunner {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ToolRunner for CountingRunner {
        async fn run(&self, invocation: &ToolInvocation, _timeout: Duration) -> Result<(), ThumbError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(invocation.clone());
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(concurrency: usize, staleness: Duration) -> QueueSettings {
        QueueSettings {
            command: ConversionCommand::parse("convert").unwrap(),
            concurrency,
            staleness,
            execution_timeout: Duration::from_secs(5),
        }
    }

    fn task(name: &str) -> ConversionTask {
        ConversionTask::new(
            Path::new(&format!("/scratch/{name}.jpg")),
            Path::new(&format!("/scratch/{name}-out.jpg")),
            transform::parse("w10", 2000).unwrap(),
        )
    }

    #[tokio::test]
    async fn stale_task_never_reaches_the_tool() {
        let runner = CountingRunner::with_delay(Duration::ZERO);
        let queue = ConversionQueue::start(
            settings(1, Duration::from_millis(10)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        let old = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .expect("monotonic clock older than 1s");
        let err = queue.submit(task("old").with_enqueued_at(old)).await.unwrap_err();

        assert!(matches!(err, ThumbError::QueueTimeout { .. }), "got: {err:?}");
        assert_eq!(runner.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overloaded_queue_times_out_waiting_task() {
        let runner = CountingRunner::with_delay(Duration::from_millis(300));
        let queue = ConversionQueue::start(
            settings(1, Duration::from_millis(100)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        let (first, second) = tokio::join!(queue.submit(task("a")), queue.submit(task("b")));
        assert!(first.is_ok());
        assert!(matches!(second, Err(ThumbError::QueueTimeout { .. })));
        assert_eq!(runner.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let runner = CountingRunner::with_delay(Duration::from_millis(50));
        let queue = ConversionQueue::start(
            settings(2, Duration::from_secs(30)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        let results = join_all((0..5).map(|i| queue.submit(task(&format!("t{i}"))))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(runner.spawns.load(Ordering::SeqCst), 5);
        let peak = runner.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency was {peak}");
        assert_eq!(queue.concurrency(), 2);
    }

    #[tokio::test]
    async fn single_worker_is_fifo() {
        let runner = CountingRunner::with_delay(Duration::from_millis(5));
        let queue = ConversionQueue::start(
            settings(1, Duration::from_secs(30)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        join_all(["a", "b", "c", "d"].map(|n| queue.submit(task(n)))).await;

        let order: Vec<_> = runner
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.source.clone())
            .collect();
        assert_eq!(
            order,
            ["a", "b", "c", "d"].map(|n| PathBuf::from(format!("/scratch/{n}.jpg")))
        );
    }

    #[tokio::test]
    async fn runner_receives_assembled_arguments() {
        let runner = CountingRunner::with_delay(Duration::ZERO);
        let queue = ConversionQueue::start(
            settings(1, Duration::from_secs(30)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        queue.submit(task("x")).await.unwrap();

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].program, "convert");
        assert_eq!(
            seen[0].args,
            vec!["/scratch/x.jpg", "-resize", "10x", "+profile", "*", "/scratch/x-out.jpg"]
        );
    }

    #[tokio::test]
    async fn runner_failure_is_returned() {
        struct Failing;
        #[async_trait]
        impl ToolRunner for Failing {
            async fn run(&self, _: &ToolInvocation, _: Duration) -> Result<(), ThumbError> {
                Err(ThumbError::ConversionFailed {
                    reason: "exit status 1".into(),
                    stderr: "no decode delegate".into(),
                })
            }
        }

        let queue = ConversionQueue::start(settings(1, Duration::from_secs(30)), Arc::new(Failing));
        let err = queue.submit(task("x")).await.unwrap_err();
        assert!(matches!(err, ThumbError::ConversionFailed { .. }));
    }

    #[tokio::test]
    async fn dequeue_instant_marks_end_of_wait() {
        let runner = CountingRunner::with_delay(Duration::from_millis(150));
        let queue = ConversionQueue::start(
            settings(1, Duration::from_secs(30)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        let before = Instant::now();
        let (first, second) = tokio::join!(queue.submit(task("a")), queue.submit(task("b")));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first >= before);
        assert!(second > first);
        // "b" sat behind "a" for the whole of a's conversion.
        assert!(
            second.duration_since(before) >= Duration::from_millis(140),
            "waited only {:?}",
            second.duration_since(before)
        );
    }

    #[tokio::test]
    async fn panicking_runner_does_not_shrink_the_pool() {
        #[derive(Default)]
        struct PanicsOnce {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl ToolRunner for PanicsOnce {
            async fn run(&self, _: &ToolInvocation, _: Duration) -> Result<(), ThumbError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("converter binding blew up");
                }
                Ok(())
            }
        }

        let runner = Arc::new(PanicsOnce::default());
        let queue = ConversionQueue::start(
            settings(1, Duration::from_secs(30)),
            runner.clone() as Arc<dyn ToolRunner>,
        );

        let err = queue.submit(task("boom")).await.unwrap_err();
        assert!(matches!(err, ThumbError::Internal(_)), "got: {err:?}");

        // The single worker is still alive and picks up the next task.
        tokio_test::assert_ok!(queue.submit(task("after")).await);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }
}
