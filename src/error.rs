//! Error taxonomy for job execution.
//!
//! `JobError` is the classifier a promise consumer ultimately sees; `RunErr`
//! is the structured error a guest module returns through the FFI and is
//! deliberately distinguishable from host-side failures (it is never retried).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error returned by guest code via `return_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("run error (code {code}): {message}")]
pub struct RunErr {
    pub code: i32,
    pub message: String,
}

impl RunErr {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Final classification of a failed job or host call.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// No pool is registered for the job's type.
    #[error("no worker registered for job type '{0}'")]
    NoWorker(String),

    /// The job exceeded its wall-clock budget.
    #[error("job exceeded its {0:?} budget")]
    Timeout(Duration),

    /// Submit against a shut-down scheduler or pool.
    #[error("pool is shut down")]
    PoolClosed,

    /// Recoverable failure; retried until the pool's retry budget runs out.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable execution failure.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Application-level error returned by guest code; never retried.
    #[error(transparent)]
    Run(#[from] RunErr),

    /// A host call arrived while a prior call's staged result was unconsumed.
    #[error("host call attempted with an unconsumed ffi result in flight")]
    ReentrantCall,

    /// A host call carried an identifier that was never issued.
    #[error("unknown instance identifier {0}")]
    InvalidIdentifier(i32),
}

impl JobError {
    pub(crate) fn fatal(msg: impl Into<String>) -> Self {
        JobError::Fatal(msg.into())
    }

    /// Whether the scheduler may re-run the job that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_err_round_trips_through_json() {
        let err = RunErr::new(404, "nothing here");
        let bytes = serde_json::to_vec(&err).expect("serialize");
        let back: RunErr = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(err, back);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(JobError::Transient("flaky".into()).is_transient());
        assert!(!JobError::Run(RunErr::new(1, "app")).is_transient());
        assert!(!JobError::fatal("boom").is_transient());
    }
}
