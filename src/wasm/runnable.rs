//! The WebAssembly runnable: one environment, many pooled instances, one
//! guest call per job.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::JobError;
use crate::job::{Ctx, Job, JobOutcome};
use crate::runnable::{ChangeEvent, Runnable};
use crate::wasm::environment::{self, WasmEnvironment};
use crate::wasm::instance::InstanceShared;
use crate::wasm::module_ref::ModuleRef;
use crate::wasm::{deadline_ticks, ident, map_wasm_error, WasmConfig};

/// Clears the bound context and any staged reply when a call ends, however
/// it ends.
struct CallGuard(Arc<InstanceShared>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.unbind();
    }
}

/// Runs jobs by invoking the guest's `run_e` export on a pooled instance of
/// the referenced module.
///
/// The pool grows and shrinks with the workers hosting this runnable: each
/// `WorkerAdded` instantiates one more copy of the module, each
/// `WorkerRemoved` retires one.
pub struct WasmRunnable {
    env: Arc<WasmEnvironment>,
}

impl WasmRunnable {
    pub fn new(module: ModuleRef) -> Self {
        Self::with_config(module, WasmConfig::default())
    }

    pub fn with_config(module: ModuleRef, config: WasmConfig) -> Self {
        Self {
            env: WasmEnvironment::create(module, config),
        }
    }

    /// Number of live instances in this runnable's pool.
    pub fn instance_count(&self) -> usize {
        self.env.instance_count()
    }
}

impl Drop for WasmRunnable {
    fn drop(&mut self) {
        environment::deregister(self.env.uuid());
    }
}

#[async_trait]
impl Runnable for WasmRunnable {
    async fn on_change(&self, event: ChangeEvent) -> Result<(), JobError> {
        match event {
            ChangeEvent::WorkerAdded => self.env.add_instance().await,
            ChangeEvent::WorkerRemoved => self.env.remove_instance().await,
        }
    }

    async fn run(&self, job: Job, ctx: Ctx) -> JobOutcome {
        let lease = self.env.use_instance().await?;
        let ident = ident::issue(self.env.uuid(), lease.index);

        let shared = lease.instance.shared().clone();
        shared.bind(ctx.clone());
        let _call = CallGuard(shared);

        let mut cell = lease.instance.lock_cell().await;
        cell.drain_channels();
        cell.store.set_epoch_deadline(deadline_ticks(ctx.deadline));

        let input_ptr = cell.write_input(&job.payload).await?;
        let instance = cell.instance;
        let run_e = instance
            .get_typed_func::<(i32, i32, i32), ()>(&mut cell.store, "run_e")
            .map_err(|_| JobError::fatal("missing required export: run_e"))?;

        let call = run_e
            .call_async(
                &mut cell.store,
                (input_ptr, job.payload.len() as i32, ident.value()),
            )
            .await;
        if let Err(err) = call {
            return Err(map_wasm_error(err, ctx.deadline));
        }
        cell.deallocate(input_ptr, job.payload.len()).await?;

        // A well-behaved guest published exactly one of these before
        // returning; neither means the job produced nothing.
        if let Ok(run_err) = cell.err_rx.try_recv() {
            return Err(JobError::Run(run_err));
        }
        if let Ok(bytes) = cell.result_rx.try_recv() {
            return Ok(Some(bytes));
        }
        Ok(None)
    }
}
