//! Per-job-type worker pools: intake queue, worker tasks, retry/timeout
//! policy, and the autoscaling controller.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::caps::Capabilities;
use crate::error::JobError;
use crate::job::{Ctx, Job, JobOutcome, JobResult};
use crate::runnable::{ChangeEvent, Runnable};

/// Tuning for one pool. `pool_size` is the minimum (and initial) worker
/// count; `autoscale_max` of 0 disables the scaling controller.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub(crate) pool_size: usize,
    pub(crate) autoscale_max: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retries: u32,
    pub(crate) pre_warm: bool,
    pub(crate) scaler: ScalerConfig,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 1,
            autoscale_max: 0,
            timeout: None,
            retries: 0,
            pre_warm: false,
            scaler: ScalerConfig::default(),
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n.max(1);
        self
    }

    pub fn autoscale_max(mut self, n: usize) -> Self {
        self.autoscale_max = n;
        self
    }

    pub fn timeout(mut self, budget: Duration) -> Self {
        self.timeout = Some(budget);
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n;
        self
    }

    pub fn pre_warm(mut self, enabled: bool) -> Self {
        self.pre_warm = enabled;
        self
    }

    pub fn scaler(mut self, config: ScalerConfig) -> Self {
        self.scaler = config;
        self
    }

    fn max_workers(&self) -> usize {
        self.autoscale_max.max(self.pool_size)
    }
}

/// Autoscaler tuning: the controller samples queue-depth-to-worker ratio on
/// a fixed interval; a streak of high samples adds one worker, a streak of
/// low samples removes one.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub sample_interval: Duration,
    pub high_water: f64,
    pub low_water: f64,
    pub grow_after: u32,
    pub shrink_after: u32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(250),
            high_water: 2.0,
            low_water: 0.5,
            grow_after: 2,
            shrink_after: 3,
        }
    }
}

struct QueuedJob {
    job: Job,
    tx: tokio::sync::oneshot::Sender<JobOutcome>,
}

/// State shared between the pool handle, its workers, and the autoscaler.
struct PoolShared {
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    depth: AtomicUsize,
    service_ewma_us: AtomicU64,
    closed: AtomicBool,
}

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// All workers for one job type.
pub(crate) struct Pool {
    job_type: String,
    options: PoolOptions,
    runnable: Arc<dyn Runnable>,
    default_caps: Capabilities,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    shared: Arc<PoolShared>,
    workers: parking_lot::Mutex<Vec<WorkerHandle>>,
    started: AtomicBool,
    scaler_shutdown: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl Pool {
    pub(crate) fn new(
        job_type: impl Into<String>,
        runnable: Arc<dyn Runnable>,
        default_caps: Capabilities,
        options: PoolOptions,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            job_type: job_type.into(),
            options,
            runnable,
            default_caps,
            queue_tx,
            shared: Arc::new(PoolShared {
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                depth: AtomicUsize::new(0),
                service_ewma_us: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            workers: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            scaler_shutdown: parking_lot::Mutex::new(None),
        });
        if pool.options.pre_warm {
            Pool::ensure_started(&pool);
        }
        pool
    }

    /// Enqueue one job and hand back its promise. Fails fast (through the
    /// promise) when the pool is shut down.
    pub(crate) fn submit(this: &Arc<Self>, mut job: Job) -> JobResult {
        if this.shared.closed.load(Ordering::SeqCst) {
            return JobResult::ready_err(job.id, JobError::PoolClosed);
        }
        // A per-job capability override inherits the pool's dispatcher so
        // chained submissions stay within the same scheduler.
        if let Some(override_caps) = &mut job.caps {
            if override_caps.dispatch.is_none() {
                override_caps.dispatch = this.default_caps.dispatch.clone();
            }
        }
        Pool::ensure_started(this);

        let (result, tx) = JobResult::pair(job.id);
        this.shared.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = this.queue_tx.send(QueuedJob { job, tx }) {
            this.shared.depth.fetch_sub(1, Ordering::SeqCst);
            let _ = rejected.0.tx.send(Err(JobError::PoolClosed));
        }
        result
    }

    fn ensure_started(this: &Arc<Self>) {
        if this.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..this.options.pool_size {
            this.spawn_worker();
        }
        if this.options.autoscale_max > 0 {
            Pool::spawn_scaler(this);
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn seat(&self) -> WorkerSeat {
        WorkerSeat {
            job_type: self.job_type.clone(),
            runnable: self.runnable.clone(),
            default_caps: self.default_caps.clone(),
            options: self.options.clone(),
            shared: self.shared.clone(),
        }
    }

    fn spawn_worker(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let seat = self.seat();
        let join = tokio::spawn(worker_loop(seat, shutdown_rx));
        self.workers.lock().push(WorkerHandle {
            shutdown: shutdown_tx,
            join,
        });
    }

    fn retire_worker(&self) {
        if let Some(handle) = self.workers.lock().pop() {
            let _ = handle.shutdown.send(true);
        }
    }

    fn spawn_scaler(this: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *this.scaler_shutdown.lock() = Some(shutdown_tx);

        let weak = Arc::downgrade(this);
        let config = this.options.scaler.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.sample_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut high_streak = 0u32;
            let mut low_streak = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {}
                }
                let Some(pool) = weak.upgrade() else { break };
                if pool.shared.closed.load(Ordering::SeqCst) {
                    break;
                }

                let workers = pool.worker_count();
                let depth = pool.shared.depth.load(Ordering::SeqCst);
                let ratio = depth as f64 / workers.max(1) as f64;
                if ratio >= config.high_water {
                    high_streak += 1;
                    low_streak = 0;
                } else if ratio <= config.low_water {
                    low_streak += 1;
                    high_streak = 0;
                } else {
                    high_streak = 0;
                    low_streak = 0;
                }

                if high_streak >= config.grow_after && workers < pool.options.max_workers() {
                    tracing::debug!(
                        job_type = %pool.job_type,
                        depth,
                        workers,
                        service_ewma_us = pool.shared.service_ewma_us.load(Ordering::Relaxed),
                        "queue pressure high, adding worker"
                    );
                    pool.spawn_worker();
                    high_streak = 0;
                } else if low_streak >= config.shrink_after && workers > pool.options.pool_size {
                    tracing::debug!(
                        job_type = %pool.job_type,
                        depth,
                        workers,
                        "queue pressure low, removing worker"
                    );
                    pool.retire_worker();
                    // Stay armed so a long idle stretch keeps shrinking.
                    low_streak = config.shrink_after;
                }
            }
        });
    }

    /// Stop accepting work, signal every worker, and wait for them to drain
    /// the queue and exit.
    pub(crate) async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.scaler_shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        for handle in &handles {
            let _ = handle.shutdown.send(true);
        }
        for handle in handles {
            let _ = handle.join.await;
        }
    }
}

/// Everything one worker task needs, cloned out of the pool so worker tasks
/// hold no strong reference back to it.
struct WorkerSeat {
    job_type: String,
    runnable: Arc<dyn Runnable>,
    default_caps: Capabilities,
    options: PoolOptions,
    shared: Arc<PoolShared>,
}

async fn worker_loop(seat: WorkerSeat, mut shutdown: watch::Receiver<bool>) {
    // A startup failure is fatal to the pool: close it and keep failing
    // whatever still arrives so no promise is left dangling.
    let startup_err = seat.runnable.on_change(ChangeEvent::WorkerAdded).await.err();
    if let Some(err) = &startup_err {
        tracing::error!(job_type = %seat.job_type, %err, "worker startup failed, closing pool");
        seat.shared.closed.store(true, Ordering::SeqCst);
    }

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => None,
            queued = async { seat.shared.queue_rx.lock().await.recv().await } => queued,
        };
        let Some(queued) = next else { break };
        match &startup_err {
            None => seat.process(queued).await,
            Some(err) => seat.reject(queued, err),
        }
    }

    if seat.shared.closed.load(Ordering::SeqCst) {
        // Shutdown path: drain whatever is still queued before exiting.
        loop {
            let queued = seat.shared.queue_rx.lock().await.try_recv();
            match (queued, &startup_err) {
                (Ok(queued), None) => seat.process(queued).await,
                (Ok(queued), Some(err)) => seat.reject(queued, err),
                (Err(_), _) => break,
            }
        }
    }

    if startup_err.is_none() {
        if let Err(err) = seat.runnable.on_change(ChangeEvent::WorkerRemoved).await {
            tracing::warn!(job_type = %seat.job_type, %err, "worker teardown reported an error");
        }
    }
}

impl WorkerSeat {
    async fn process(&self, queued: QueuedJob) {
        let QueuedJob { mut job, tx } = queued;
        self.shared.depth.fetch_sub(1, Ordering::SeqCst);
        let caps = job.caps.take().unwrap_or_else(|| self.default_caps.clone());
        let started = Instant::now();

        let outcome = loop {
            let ctx = Ctx::new(job.id, caps.clone(), self.options.timeout);
            match self.run_once(&job, ctx).await {
                Err(JobError::Transient(msg)) if job.retries_done < self.options.retries => {
                    job.retries_done += 1;
                    tracing::debug!(
                        job_type = %self.job_type,
                        job_id = %job.id,
                        retry = job.retries_done,
                        "retrying after transient failure: {msg}"
                    );
                    continue;
                }
                Err(JobError::Timeout(budget)) => {
                    // Resolve the promise first; the tainted instance is
                    // recycled before this worker serves another job.
                    let _ = tx.send(Err(JobError::Timeout(budget)));
                    self.recycle().await;
                    self.record_service_time(started.elapsed());
                    return;
                }
                other => break other,
            }
        };

        self.record_service_time(started.elapsed());
        let _ = tx.send(outcome);
    }

    async fn run_once(&self, job: &Job, ctx: Ctx) -> JobOutcome {
        let fut = self.runnable.run(job.clone(), ctx);
        match self.options.timeout {
            Some(budget) => match tokio::time::timeout(budget, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(JobError::Timeout(budget)),
            },
            None => fut.await,
        }
    }

    async fn recycle(&self) {
        if let Err(err) = self.runnable.on_change(ChangeEvent::WorkerRemoved).await {
            tracing::warn!(job_type = %self.job_type, %err, "failed to retire instance after timeout");
        }
        if let Err(err) = self.runnable.on_change(ChangeEvent::WorkerAdded).await {
            tracing::warn!(job_type = %self.job_type, %err, "failed to replace instance after timeout");
        }
    }

    fn reject(&self, queued: QueuedJob, cause: &JobError) {
        self.shared.depth.fetch_sub(1, Ordering::SeqCst);
        let _ = queued.tx.send(Err(JobError::fatal(format!(
            "pool failed to start: {cause}"
        ))));
    }

    fn record_service_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        let prev = self.shared.service_ewma_us.load(Ordering::Relaxed);
        let next = if prev == 0 { sample } else { (prev * 4 + sample) / 5 };
        self.shared.service_ewma_us.store(next, Ordering::Relaxed);
    }
}
