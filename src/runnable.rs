//! The polymorphic worker body: anything that can execute one job.

use async_trait::async_trait;

use crate::error::JobError;
use crate::job::{Ctx, Job, JobOutcome};

/// Pool membership change delivered to a runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    WorkerAdded,
    WorkerRemoved,
}

/// A uniform interface a worker invokes to execute one job.
///
/// `on_change` fires when the pool adds or removes a worker hosting this
/// runnable, letting it allocate or free instance-specific resources; the
/// WebAssembly runnable grows and shrinks its instance pool here. `run`
/// performs one job with the capability table and deadline carried by `ctx`.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn on_change(&self, _event: ChangeEvent) -> Result<(), JobError> {
        Ok(())
    }

    async fn run(&self, job: Job, ctx: Ctx) -> JobOutcome;
}

/// Adapter turning a plain async-free function into a runnable.
pub struct FnRunnable<F>(F);

impl<F> FnRunnable<F>
where
    F: Fn(Job, Ctx) -> JobOutcome + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Runnable for FnRunnable<F>
where
    F: Fn(Job, Ctx) -> JobOutcome + Send + Sync,
{
    async fn run(&self, job: Job, ctx: Ctx) -> JobOutcome {
        (self.0)(job, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;
    use uuid::Uuid;

    #[tokio::test]
    async fn fn_runnable_echoes() {
        let runnable = FnRunnable::new(|job: Job, _ctx| Ok(Some(job.payload)));
        let job = Job::new("echo", "hello");
        let ctx = Ctx::new(Uuid::new_v4(), Capabilities::default(), None);
        let out = runnable.run(job, ctx).await.expect("run");
        assert_eq!(out.as_deref(), Some(b"hello".as_ref()));
    }
}
