//! hive: an autoscaling job scheduler with a sandboxed WebAssembly worker
//! runtime.
//!
//! Work is submitted as [`Job`]s and routed to per-job-type pools of
//! cooperative workers; each submit returns a one-shot [`JobResult`] promise.
//! A worker body is anything implementing [`Runnable`] — a native function or
//! a pooled instance of a WebAssembly module executed inside wasmtime with a
//! capability-bounded host-call surface (see [`wasm`]).
//!
//! ```no_run
//! use hive::{Hive, PoolOptions};
//!
//! # async fn demo() -> Result<(), hive::JobError> {
//! let hive = Hive::new();
//! let echo = hive.register(
//!     "echo",
//!     hive::FnRunnable::new(|job, _ctx| Ok(Some(job.payload))),
//!     PoolOptions::default(),
//! );
//! let out = echo(b"hello".to_vec()).then().await?;
//! assert_eq!(out.as_deref(), Some(b"hello".as_ref()));
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod caps;
mod core;
mod error;
mod job;
mod pool;
mod runnable;
pub mod schedule;
pub mod wasm;

use std::sync::Arc;

use bus::{Message, MessageBus, MSG_TYPE_JOB_ERR, MSG_TYPE_NIL, MSG_TYPE_RESULT, MSG_TYPE_RUN_ERR};

pub use caps::Capabilities;
pub use error::{JobError, RunErr};
pub use job::{Ctx, Job, JobOutcome, JobResult};
pub use pool::{PoolOptions, ScalerConfig};
pub use runnable::{ChangeEvent, FnRunnable, Runnable};
pub use schedule::{Every, Schedule};
pub use wasm::{ModuleRef, WasmConfig, WasmRunnable};

/// Convenience submitter returned by [`Hive::register`]: builds a job of the
/// registered type from raw payload bytes and submits it.
pub type JobFunc = Arc<dyn Fn(Vec<u8>) -> JobResult + Send + Sync>;

/// The main control object: a scheduler with a default capability table.
///
/// Must be created and used inside a tokio runtime; workers, autoscalers, and
/// schedule watchers run as tokio tasks.
pub struct Hive {
    core: Arc<core::Core>,
    default_caps: Capabilities,
}

impl Default for Hive {
    fn default() -> Self {
        Self::new()
    }
}

impl Hive {
    /// A fresh scheduler with default capabilities.
    pub fn new() -> Self {
        Self::with_caps(Capabilities::default())
    }

    /// A fresh scheduler whose registrations default to `caps`.
    pub fn with_caps(mut caps: Capabilities) -> Self {
        let core = core::Core::new();
        caps.dispatch = Some(core::Core::dispatcher(&core));
        Self {
            core,
            default_caps: caps,
        }
    }

    /// Register a runnable for `job_type` with the scheduler's default
    /// capabilities and return a shortcut submitter for that type.
    pub fn register(
        &self,
        job_type: &str,
        runnable: impl Runnable + 'static,
        options: PoolOptions,
    ) -> JobFunc {
        self.register_with_caps(job_type, runnable, self.default_caps.clone(), options)
    }

    /// Register a runnable with a custom capability table.
    pub fn register_with_caps(
        &self,
        job_type: &str,
        runnable: impl Runnable + 'static,
        caps: Capabilities,
        options: PoolOptions,
    ) -> JobFunc {
        core::Core::register(&self.core, job_type, Arc::new(runnable), caps, options);

        let core = self.core.clone();
        let job_type = job_type.to_string();
        Arc::new(move |payload: Vec<u8>| core.do_job(Job::new(job_type.clone(), payload)))
    }

    /// Submit a job and get its result promise.
    pub fn do_job(&self, job: Job) -> JobResult {
        self.core.do_job(job)
    }

    /// Submit a job with a per-job capability override. Passing the worker's
    /// defaults is equivalent to [`Hive::do_job`].
    pub fn do_job_with_caps(&self, mut job: Job, caps: Capabilities) -> JobResult {
        job.caps = Some(caps);
        self.core.do_job(job)
    }

    /// Shorthand job constructor.
    pub fn job(&self, job_type: &str, payload: impl Into<Vec<u8>>) -> Job {
        Job::new(job_type, payload)
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.core.has_worker(job_type)
    }

    /// Watch a schedule and submit the jobs it synthesizes.
    pub fn schedule(&self, schedule: impl Schedule + 'static) {
        core::Core::watch(&self.core, Arc::new(schedule));
    }

    /// Subscribe to `msg_type` on `bus`; each inbound message becomes a job
    /// of the same type, and its outcome is published as a reply:
    /// result bytes on `hive.result`, an empty `hive.nil` for jobs returning
    /// nothing, `hive.runerr` for guest run errors, `hive.joberr` otherwise.
    pub fn listen(&self, bus: Arc<dyn MessageBus>, msg_type: &str) {
        let mut rx = bus.subscribe(msg_type);
        let core = self.core.clone();
        let msg_type = msg_type.to_string();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let result = core.do_job(Job::new(msg_type.clone(), msg.payload.clone()));
                let reply = match result.then().await {
                    Ok(Some(bytes)) => Message::reply(&msg, MSG_TYPE_RESULT, bytes),
                    Ok(None) => Message::reply(&msg, MSG_TYPE_NIL, Vec::new()),
                    Err(JobError::Run(run_err)) => {
                        tracing::warn!(msg_id = %msg.uuid, %run_err, "job from message returned a run error");
                        let body = serde_json::to_vec(&run_err)
                            .unwrap_or_else(|_| run_err.to_string().into_bytes());
                        Message::reply(&msg, MSG_TYPE_RUN_ERR, body)
                    }
                    Err(err) => {
                        tracing::warn!(msg_id = %msg.uuid, %err, "job from message failed");
                        Message::reply(&msg, MSG_TYPE_JOB_ERR, err.to_string().into_bytes())
                    }
                };
                bus.publish(reply);
            }
        });
    }

    /// Drain every pool, then stop. Subsequent submits fail with
    /// [`JobError::PoolClosed`].
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
