//! One executable copy of a compiled module: its store, its exclusivity
//! gate, and the shared state host functions reach through the identifier
//! registry.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use wasmtime::{Memory, Store};

use crate::error::{JobError, RunErr};
use crate::job::Ctx;

/// Host-side store state for one instance.
pub(crate) struct InstanceState {
    pub wasi: wasmtime_wasi::preview1::WasiP1Ctx,
    pub shared: Arc<InstanceShared>,
    pub limits: wasmtime::StoreLimits,
}

/// State reachable both from the identifier registry (host functions) and
/// from the gate holder driving the call.
pub(crate) struct InstanceShared {
    ffi_result: parking_lot::Mutex<Option<Vec<u8>>>,
    ctx: parking_lot::RwLock<Option<Ctx>>,
    result_tx: mpsc::Sender<Vec<u8>>,
    err_tx: mpsc::Sender<RunErr>,
}

impl InstanceShared {
    pub(crate) fn channel_pair() -> (Arc<Self>, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<RunErr>) {
        let (result_tx, result_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let shared = Arc::new(Self {
            ffi_result: parking_lot::Mutex::new(None),
            ctx: parking_lot::RwLock::new(None),
            result_tx,
            err_tx,
        });
        (shared, result_rx, err_rx)
    }

    /// Stage a host-call reply for the guest to collect via `get_ffi_result`.
    /// At most one reply may be staged per host→guest cycle.
    pub(crate) fn set_ffi_result(&self, bytes: Vec<u8>) -> Result<(), JobError> {
        let mut slot = self.ffi_result.lock();
        if slot.is_some() {
            return Err(JobError::fatal("instance ffi result is already set"));
        }
        *slot = Some(bytes);
        Ok(())
    }

    pub(crate) fn take_ffi_result(&self) -> Option<Vec<u8>> {
        self.ffi_result.lock().take()
    }

    pub(crate) fn has_ffi_result(&self) -> bool {
        self.ffi_result.lock().is_some()
    }

    /// Bind the per-job context for the upcoming call, clearing any stale
    /// staged reply.
    pub(crate) fn bind(&self, ctx: Ctx) {
        *self.ffi_result.lock() = None;
        *self.ctx.write() = Some(ctx);
    }

    pub(crate) fn unbind(&self) {
        *self.ctx.write() = None;
        *self.ffi_result.lock() = None;
    }

    pub(crate) fn ctx(&self) -> Option<Ctx> {
        self.ctx.read().clone()
    }

    pub(crate) fn publish_result(&self, bytes: Vec<u8>) -> Result<(), JobError> {
        self.result_tx
            .try_send(bytes)
            .map_err(|_| JobError::fatal("result already published for this call"))
    }

    pub(crate) fn publish_error(&self, err: RunErr) -> Result<(), JobError> {
        self.err_tx
            .try_send(err)
            .map_err(|_| JobError::fatal("error already published for this call"))
    }
}

/// The mutable half of an instance; only the gate holder touches it.
pub(crate) struct InstanceCell {
    pub store: Store<InstanceState>,
    pub instance: wasmtime::Instance,
    pub memory: Memory,
    pub result_rx: mpsc::Receiver<Vec<u8>>,
    pub err_rx: mpsc::Receiver<RunErr>,
}

impl InstanceCell {
    /// Discard anything left over from an interrupted previous call.
    pub(crate) fn drain_channels(&mut self) {
        while self.result_rx.try_recv().is_ok() {}
        while self.err_rx.try_recv().is_ok() {}
    }

    /// Copy `data` into guest memory at a guest-allocated location and return
    /// the pointer. The `allocate` export is required from here on.
    pub(crate) async fn write_input(&mut self, data: &[u8]) -> Result<i32, JobError> {
        let allocate = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, "allocate")
            .map_err(|_| JobError::fatal("missing required export: allocate"))?;
        let ptr = allocate
            .call_async(&mut self.store, data.len() as i32)
            .await
            .map_err(|err| JobError::fatal(format!("guest allocate failed: {err:#}")))?;
        self.write_at(ptr, data)?;
        Ok(ptr)
    }

    /// Bounds-checked write into the guest's linear memory.
    pub(crate) fn write_at(&mut self, ptr: i32, data: &[u8]) -> Result<(), JobError> {
        if ptr < 0 {
            return Err(JobError::fatal("guest returned a negative pointer"));
        }
        let start = ptr as usize;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| JobError::fatal("guest write range overflows"))?;
        if end > self.memory.data_size(&self.store) {
            return Err(JobError::fatal("guest write beyond memory bounds"));
        }
        self.memory
            .write(&mut self.store, start, data)
            .map_err(|err| JobError::fatal(format!("guest memory write failed: {err}")))
    }

    /// Hand a host-written region back to the guest. The `deallocate` export
    /// is required from here on.
    pub(crate) async fn deallocate(&mut self, ptr: i32, len: usize) -> Result<(), JobError> {
        let dealloc = self
            .instance
            .get_typed_func::<(i32, i32), ()>(&mut self.store, "deallocate")
            .map_err(|_| JobError::fatal("missing required export: deallocate"))?;
        dealloc
            .call_async(&mut self.store, (ptr, len as i32))
            .await
            .map_err(|err| JobError::fatal(format!("guest deallocate failed: {err:#}")))
    }
}

/// One executable copy of a module, shared between the environment's pool
/// and in-flight FFI lookups.
pub(crate) struct WasmInstance {
    gate: Arc<Semaphore>,
    shared: Arc<InstanceShared>,
    cell: tokio::sync::Mutex<InstanceCell>,
}

impl WasmInstance {
    pub(crate) fn new(cell: InstanceCell, shared: Arc<InstanceShared>) -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(1)),
            shared,
            cell: tokio::sync::Mutex::new(cell),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<InstanceShared> {
        &self.shared
    }

    pub(crate) fn gate(&self) -> &Arc<Semaphore> {
        &self.gate
    }

    /// Close the gate so any late acquirer fails instead of touching a
    /// removed instance.
    pub(crate) fn close_gate(&self) {
        self.gate.close();
    }

    pub(crate) async fn lock_cell(&self) -> tokio::sync::MutexGuard<'_, InstanceCell> {
        self.cell.lock().await
    }
}
