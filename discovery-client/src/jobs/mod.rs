//! One-shot jobs against the coordination store.
//!
//! Jobs are queued on a bounded channel and executed one at a time by a
//! dedicated coordination loop with its own session. A job that reports
//! failure stays current and is retried on the next tick until its attempts
//! run out; the caller waits on the returned `JobHandle`.

mod build_path;

pub use build_path::BuildPathJob;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use crate::config::DiscoveryConfig;
use crate::coordination::{CoordinationLoop, LoopHandle, Pass, ProcessingTask};
use crate::error::JobError;
use crate::store::{CoordinationStore, Session, StoreResult};

pub const JOB_QUEUE_CAPACITY: usize = 20;

/// A unit of work executed against a live session.
#[async_trait]
pub trait CoordinationJob: Send + 'static {
    /// Returns false when the attempt failed and should be retried.
    async fn execute(&mut self, session: &dyn Session) -> StoreResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Running = 0,
    Done = 1,
    Cancelled = 2,
    Failed = 3,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => JobState::Done,
            2 => JobState::Cancelled,
            3 => JobState::Failed,
            _ => JobState::Running,
        }
    }
}

#[derive(Default)]
struct JobStatus {
    state: AtomicU8,
    cancel_requested: AtomicBool,
}

impl JobStatus {
    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Completion side of a queued job, with the job type erased.
#[async_trait]
trait QueuedJob: Send {
    fn max_attempts(&self) -> u32;

    fn is_cancel_requested(&self) -> bool;

    async fn execute(&mut self, session: &dyn Session) -> StoreResult<bool>;

    fn complete(self: Box<Self>, state: JobState);
}

struct JobWrapper<J> {
    job: J,
    max_attempts: u32,
    status: Arc<JobStatus>,
    /// `None` tells the waiter the job failed
    done_tx: oneshot::Sender<Option<J>>,
}

#[async_trait]
impl<J: CoordinationJob> QueuedJob for JobWrapper<J> {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn is_cancel_requested(&self) -> bool {
        self.status.cancel_requested.load(Ordering::SeqCst)
    }

    async fn execute(&mut self, session: &dyn Session) -> StoreResult<bool> {
        self.job.execute(session).await
    }

    fn complete(self: Box<Self>, state: JobState) {
        let JobWrapper {
            job,
            status,
            done_tx,
            ..
        } = *self;
        status.state.store(state as u8, Ordering::SeqCst);
        let result = match state {
            JobState::Done | JobState::Cancelled => Some(job),
            JobState::Failed | JobState::Running => None,
        };
        let _ = done_tx.send(result);
    }
}

/// Waits for the outcome of a submitted job.
pub struct JobHandle<J> {
    status: Arc<JobStatus>,
    done_rx: Option<oneshot::Receiver<Option<J>>>,
}

impl<J> JobHandle<J> {
    /// Asks the processor to skip the job. Only honored before an attempt
    /// starts. Returns false if the job was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.status.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == JobState::Cancelled
    }

    pub fn is_done(&self) -> bool {
        self.state() == JobState::Done
    }

    /// Waits for completion. Done and cancelled jobs are handed back.
    pub async fn get(mut self) -> Result<J, JobError> {
        let Some(done_rx) = self.done_rx.take() else {
            return Err(JobError::ProcessorGone);
        };
        Self::outcome(done_rx.await)
    }

    pub async fn get_timeout(&mut self, timeout: Duration) -> Result<J, JobError> {
        let Some(done_rx) = self.done_rx.as_mut() else {
            return Err(JobError::ProcessorGone);
        };
        let result = tokio::time::timeout(timeout, done_rx)
            .await
            .map_err(|_| JobError::Timeout)?;
        self.done_rx = None;
        Self::outcome(result)
    }

    fn outcome(result: Result<Option<J>, oneshot::error::RecvError>) -> Result<J, JobError> {
        match result {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(JobError::Failed),
            Err(_) => Err(JobError::ProcessorGone),
        }
    }
}

struct JobRunner {
    rx: mpsc::Receiver<Box<dyn QueuedJob>>,
    queued: Arc<AtomicUsize>,
    current: Option<Box<dyn QueuedJob>>,
    attempts_left: u32,
}

impl JobRunner {
    /// Returns whether the current job is finished, successfully or not.
    fn process_retry(&mut self) -> bool {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        if self.attempts_left > 0 {
            return false;
        }
        if let Some(job) = self.current.take() {
            debug!("Job failed, no attempts left");
            job.complete(JobState::Failed);
        }
        true
    }
}

#[async_trait]
impl ProcessingTask for JobRunner {
    fn determine_current_generation(&mut self, generation: &AtomicU64, _tick: u64) -> u64 {
        if self.queued.load(Ordering::SeqCst) > 0 {
            generation.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            generation.load(Ordering::SeqCst)
        }
    }

    async fn do_work(&mut self, session: &dyn Session, _pass: Pass) -> StoreResult<bool> {
        if self.current.is_none() {
            match self.rx.try_recv() {
                Ok(job) => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.attempts_left = job.max_attempts();
                    self.current = Some(job);
                }
                Err(_) => return Ok(true),
            }
        }

        let Some(job) = self.current.as_mut() else {
            return Ok(true);
        };

        if job.is_cancel_requested() {
            if let Some(job) = self.current.take() {
                job.complete(JobState::Cancelled);
            }
            return Ok(true);
        }

        match job.execute(session).await {
            Ok(true) => {
                if let Some(job) = self.current.take() {
                    job.complete(JobState::Done);
                }
                Ok(true)
            }
            Ok(false) => Ok(self.process_retry()),
            Err(e) => {
                self.process_retry();
                Err(e)
            }
        }
    }
}

/// Bounded job queue with its own coordination loop.
pub struct JobProcessor {
    tx: mpsc::Sender<Box<dyn QueuedJob>>,
    queued: Arc<AtomicUsize>,
    store: Arc<dyn CoordinationStore>,
    tick_interval: Duration,
    session_timeout: Duration,
    runner: Mutex<Option<JobRunner>>,
    handle: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &DiscoveryConfig) -> Self {
        let (tx, rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let queued = Arc::new(AtomicUsize::new(0));
        let runner = JobRunner {
            rx,
            queued: Arc::clone(&queued),
            current: None,
            attempts_left: 0,
        };
        Self {
            tx,
            queued,
            store,
            tick_interval: config.tick_interval(),
            session_timeout: config.session_timeout(),
            runner: Mutex::new(Some(runner)),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawns the processing loop. Only the first call has an effect.
    pub async fn start(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runner) = runner else {
            warn!("Job processor was already started");
            return;
        };

        let driver = CoordinationLoop::new(
            "job-processor",
            Arc::clone(&self.store),
            runner,
            self.tick_interval,
            self.session_timeout,
        );
        *self.handle.lock().await = Some(driver.spawn());
    }

    /// Stops the loop. Jobs still queued are dropped and their handles
    /// report `ProcessorGone`.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }

    fn wrap<J: CoordinationJob>(job: J, max_attempts: u32) -> (Box<dyn QueuedJob>, JobHandle<J>) {
        let status = Arc::new(JobStatus::default());
        let (done_tx, done_rx) = oneshot::channel();
        let wrapper: Box<dyn QueuedJob> = Box::new(JobWrapper {
            job,
            max_attempts: max_attempts.max(1),
            status: Arc::clone(&status),
            done_tx,
        });
        let handle = JobHandle {
            status,
            done_rx: Some(done_rx),
        };
        (wrapper, handle)
    }

    /// Queues `job` without waiting. `max_attempts` bounds how often it is
    /// executed. Returns `None` if the queue is full.
    pub fn submit_job<J: CoordinationJob>(&self, job: J, max_attempts: u32) -> Option<JobHandle<J>> {
        let (wrapper, handle) = Self::wrap(job, max_attempts);
        self.queued.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(wrapper) {
            Ok(()) => Some(handle),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Like `submit_job`, but waits up to `timeout` for room in the queue.
    pub async fn submit_job_timeout<J: CoordinationJob>(
        &self,
        job: J,
        max_attempts: u32,
        timeout: Duration,
    ) -> Option<JobHandle<J>> {
        let (wrapper, handle) = Self::wrap(job, max_attempts);
        self.queued.fetch_add(1, Ordering::SeqCst);
        match self.tx.send_timeout(wrapper, timeout).await {
            Ok(()) => Some(handle),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}
