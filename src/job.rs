//! Jobs, their one-shot result promises, and the execution context handed to
//! a runnable.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::caps::Capabilities;
use crate::error::JobError;

/// Outcome of one job: optional result bytes, or a classified error.
pub type JobOutcome = Result<Option<Vec<u8>>, JobError>;

/// One unit of work, routed to the pool registered for its type.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub(crate) caps: Option<Capabilities>,
    pub(crate) retries_done: u32,
}

impl Job {
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload: payload.into(),
            caps: None,
            retries_done: 0,
        }
    }

    /// Build a job whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(
        job_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(job_type, serde_json::to_vec(value)?))
    }

    /// How many times this job has been re-run after a transient failure.
    pub fn retries_done(&self) -> u32 {
        self.retries_done
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("payload_len", &self.payload.len())
            .field("retries_done", &self.retries_done)
            .finish()
    }
}

/// One-shot promise for a job's outcome. Resolves exactly once, even if the
/// worker serving the job dies (the dropped sender surfaces as `Fatal`).
pub struct JobResult {
    job_id: Uuid,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobResult {
    pub(crate) fn pair(job_id: Uuid) -> (Self, oneshot::Sender<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { job_id, rx }, tx)
    }

    /// A promise that is already resolved, used for synchronous submit
    /// failures such as `NoWorker` and `PoolClosed`.
    pub(crate) fn ready_err(job_id: Uuid, err: JobError) -> Self {
        let (result, tx) = Self::pair(job_id);
        let _ = tx.send(Err(err));
        result
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Await the job's outcome.
    pub async fn then(self) -> JobOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::fatal("worker dropped the job result")),
        }
    }
}

/// Per-job execution context passed to `Runnable::run`.
#[derive(Clone)]
pub struct Ctx {
    pub job_id: Uuid,
    pub caps: Capabilities,
    /// Wall-clock budget for this run, when the pool sets one.
    pub deadline: Option<Duration>,
}

impl Ctx {
    pub fn new(job_id: Uuid, caps: Capabilities, deadline: Option<Duration>) -> Self {
        Self {
            job_id,
            caps,
            deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_err_resolves_immediately() {
        let result = JobResult::ready_err(Uuid::new_v4(), JobError::PoolClosed);
        match result.then().await {
            Err(JobError::PoolClosed) => {}
            other => panic!("expected PoolClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_sender_surfaces_as_fatal() {
        let (result, tx) = JobResult::pair(Uuid::new_v4());
        drop(tx);
        match result.then().await {
            Err(JobError::Fatal(msg)) => assert!(msg.contains("dropped")),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }
}
