//! Environments: one compiled module plus its pool of instances, registered
//! in a process-wide table so host functions can resolve identifiers back to
//! the instance that issued them.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;
use wasmtime::{Linker, Module, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;

use crate::error::JobError;
use crate::wasm::instance::{InstanceCell, InstanceShared, InstanceState, WasmInstance};
use crate::wasm::module_ref::ModuleRef;
use crate::wasm::{hostfns, shared_engine, WasmConfig, NO_DEADLINE_TICKS};

static ENVIRONMENTS: Lazy<parking_lot::RwLock<HashMap<Uuid, Arc<WasmEnvironment>>>> =
    Lazy::new(|| parking_lot::RwLock::new(HashMap::new()));

pub(crate) fn lookup(uuid: Uuid) -> Option<Arc<WasmEnvironment>> {
    ENVIRONMENTS.read().get(&uuid).cloned()
}

pub(crate) fn deregister(uuid: Uuid) {
    ENVIRONMENTS.write().remove(&uuid);
}

/// Compile-once internals, built on first use. A failure here is fatal to
/// the pool that owns the environment.
struct EnvInternals {
    module: Module,
    linker: Linker<InstanceState>,
}

struct InstancePool {
    instances: Vec<Arc<WasmInstance>>,
    cursor: usize,
}

/// An exclusive lease on one instance: the round-robin pick plus its held
/// exclusivity permit.
pub(crate) struct InstanceLease {
    pub instance: Arc<WasmInstance>,
    pub index: usize,
    _permit: OwnedSemaphorePermit,
}

pub(crate) struct WasmEnvironment {
    uuid: Uuid,
    module_ref: ModuleRef,
    config: WasmConfig,
    internals: OnceCell<EnvInternals>,
    pool: parking_lot::RwLock<InstancePool>,
}

impl WasmEnvironment {
    /// Create an environment and add it to the shared table so guest
    /// callbacks can find their way back to it.
    pub(crate) fn create(module_ref: ModuleRef, config: WasmConfig) -> Arc<Self> {
        let env = Arc::new(Self {
            uuid: Uuid::new_v4(),
            module_ref,
            config,
            internals: OnceCell::new(),
            pool: parking_lot::RwLock::new(InstancePool {
                instances: Vec::new(),
                cursor: 0,
            }),
        });
        ENVIRONMENTS.write().insert(env.uuid, env.clone());
        env
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.pool.read().instances.len()
    }

    fn internals(&self) -> Result<&EnvInternals, JobError> {
        self.internals.get_or_try_init(|| {
            let engine = shared_engine()?;
            let bytes = self
                .module_ref
                .bytes()
                .map_err(|err| JobError::fatal(format!("failed to load module bytes: {err:#}")))?;
            let module = Module::new(engine, &bytes)
                .map_err(|err| JobError::fatal(format!("failed to compile module: {err:#}")))?;

            let mut linker: Linker<InstanceState> = Linker::new(engine);
            wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |state: &mut InstanceState| {
                &mut state.wasi
            })
            .map_err(|err| JobError::fatal(format!("failed to link WASI: {err:#}")))?;
            hostfns::add_host_fns(&mut linker)
                .map_err(|err| JobError::fatal(format!("failed to link host functions: {err:#}")))?;

            tracing::debug!(env = %self.uuid, module = self.module_ref.name(), "module compiled");
            Ok(EnvInternals { module, linker })
        })
    }

    /// Instantiate one more copy of the module and add it to the pool.
    /// Start hooks run in order, each optional: WASI `_start`, then `init`.
    pub(crate) async fn add_instance(&self) -> Result<(), JobError> {
        let internals = self.internals()?;
        let engine = shared_engine()?;

        let (shared, result_rx, err_rx) = InstanceShared::channel_pair();
        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder.args(&[self.module_ref.name()]);
        let state = InstanceState {
            wasi: wasi_builder.build_p1(),
            shared: shared.clone(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory_mb as usize * 1024 * 1024)
                .instances(64)
                .tables(64)
                .build(),
        };

        let mut store = wasmtime::Store::new(engine, state);
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(NO_DEADLINE_TICKS);

        let instance = internals
            .linker
            .instantiate_async(&mut store, &internals.module)
            .await
            .map_err(|err| JobError::fatal(format!("failed to instantiate: {err:#}")))?;

        if let Ok(start) = instance.get_typed_func::<(), ()>(&mut store, "_start") {
            if let Err(err) = start.call_async(&mut store, ()).await {
                match err.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    Some(exit) if exit.0 == 0 => {}
                    _ => {
                        return Err(JobError::fatal(format!("guest _start failed: {err:#}")));
                    }
                }
            }
        }
        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "init") {
            init.call_async(&mut store, ())
                .await
                .map_err(|err| JobError::fatal(format!("guest init failed: {err:#}")))?;
        }

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| JobError::fatal("module does not export its linear memory"))?;

        let wasm_instance = WasmInstance::new(
            InstanceCell {
                store,
                instance,
                memory,
                result_rx,
                err_rx,
            },
            shared,
        );

        let mut pool = self.pool.write();
        pool.instances.push(wasm_instance);
        tracing::debug!(env = %self.uuid, instances = pool.instances.len(), "instance added");
        Ok(())
    }

    /// Pick the next instance round-robin and acquire its exclusivity gate.
    /// The cursor moves under the pool lock; the gate is acquired outside it.
    /// An instance retired while we waited (closed gate) sends us back for
    /// another pick.
    pub(crate) async fn use_instance(&self) -> Result<InstanceLease, JobError> {
        loop {
            let (instance, index) = {
                let mut pool = self.pool.write();
                if pool.instances.is_empty() {
                    return Err(JobError::fatal("environment has no instances"));
                }
                pool.cursor = (pool.cursor + 1) % pool.instances.len();
                (pool.instances[pool.cursor].clone(), pool.cursor)
            };

            match instance.gate().clone().acquire_owned().await {
                Ok(permit) => {
                    return Ok(InstanceLease {
                        instance,
                        index,
                        _permit: permit,
                    })
                }
                Err(_) => continue,
            }
        }
    }

    /// Remove the most recently added instance. No-op on an empty pool.
    ///
    /// Runs as a four-step dance: snapshot the tail instance, wait (bounded)
    /// for its gate so nobody is mid-call, trim the list and clamp the
    /// cursor, then drop the instance. A gate still held after the grace
    /// period marks a tainted instance, which is removed regardless.
    pub(crate) async fn remove_instance(&self) -> Result<(), JobError> {
        let target = { self.pool.read().instances.last().cloned() };
        let Some(target) = target else {
            return Ok(());
        };

        let permit = tokio::time::timeout(
            self.config.remove_grace,
            target.gate().clone().acquire_owned(),
        )
        .await;
        if permit.is_err() {
            tracing::warn!(env = %self.uuid, "instance busy past the grace period, removing anyway");
        }

        {
            let mut pool = self.pool.write();
            if pool
                .instances
                .last()
                .is_some_and(|tail| Arc::ptr_eq(tail, &target))
            {
                pool.instances.pop();
            }
            let len = pool.instances.len();
            pool.cursor = if len == 0 { 0 } else { pool.cursor % len };
            tracing::debug!(env = %self.uuid, instances = len, "instance removed");
        }

        target.close_gate();
        Ok(())
    }

    /// Shared state of the instance at `index`, for identifier resolution.
    pub(crate) fn shared_at(&self, index: usize) -> Result<Arc<InstanceShared>, JobError> {
        let pool = self.pool.read();
        if index >= pool.instances.len() {
            return Err(JobError::fatal("invalid instance index"));
        }
        Ok(pool.instances[index].shared().clone())
    }
}
