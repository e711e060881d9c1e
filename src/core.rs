//! Scheduler core: the registry mapping job-type names to pools, submit
//! routing, schedule watching, and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;

use crate::caps::{Capabilities, Dispatcher};
use crate::error::JobError;
use crate::job::{Job, JobResult};
use crate::pool::{Pool, PoolOptions};
use crate::runnable::Runnable;
use crate::schedule::Schedule;

const SCHEDULE_POLL: std::time::Duration = std::time::Duration::from_millis(100);

pub(crate) struct Core {
    pools: parking_lot::RwLock<HashMap<String, Arc<Pool>>>,
    closed: AtomicBool,
    watchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    dispatch: once_cell::sync::OnceCell<Dispatcher>,
}

impl Core {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: parking_lot::RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            watchers: parking_lot::Mutex::new(Vec::new()),
            dispatch: once_cell::sync::OnceCell::new(),
        })
    }

    /// The dispatcher that routes chained jobs back into this core. Held
    /// weakly by capability tables so a dropped scheduler surfaces as
    /// `PoolClosed`. One canonical handle per core, so routing can tell its
    /// own dispatcher apart from a foreign one.
    pub(crate) fn dispatcher(this: &Arc<Self>) -> Dispatcher {
        this.dispatch
            .get_or_init(|| {
                let weak: Weak<Core> = Arc::downgrade(this);
                Arc::new(move |job: Job| match weak.upgrade() {
                    Some(core) => Ok(core.do_job(job)),
                    None => Err(JobError::PoolClosed),
                })
            })
            .clone()
    }

    pub(crate) fn register(
        this: &Arc<Self>,
        job_type: &str,
        runnable: Arc<dyn Runnable>,
        mut caps: Capabilities,
        options: PoolOptions,
    ) {
        caps.dispatch = Some(Core::dispatcher(this));
        let pool = Pool::new(job_type, runnable, caps, options);
        let previous = this.pools.write().insert(job_type.to_string(), pool);
        if let Some(old) = previous {
            tracing::warn!(job_type, "replacing existing pool registration");
            tokio::spawn(async move { old.shutdown().await });
        }
    }

    pub(crate) fn do_job(&self, job: Job) -> JobResult {
        if self.closed.load(Ordering::SeqCst) {
            return JobResult::ready_err(job.id, JobError::PoolClosed);
        }
        let pool = self.pools.read().get(&job.job_type).cloned();
        match pool {
            Some(pool) => Pool::submit(&pool, job),
            None => self.delegate_or_fail(job),
        }
    }

    /// No pool for this type: hand the job to a foreign dispatcher carried in
    /// its capability override, if one is set; otherwise fail with `NoWorker`.
    /// Our own dispatcher is excluded, which would only loop back here.
    fn delegate_or_fail(&self, job: Job) -> JobResult {
        let own = self.dispatch.get();
        let foreign = job
            .caps
            .as_ref()
            .and_then(|caps| caps.dispatch.clone())
            .filter(|d| own.map_or(true, |own| !Arc::ptr_eq(own, d)));
        match foreign {
            Some(dispatch) => {
                let job_id = job.id;
                dispatch(job).unwrap_or_else(|err| JobResult::ready_err(job_id, err))
            }
            None => {
                let job_type = job.job_type.clone();
                JobResult::ready_err(job.id, JobError::NoWorker(job_type))
            }
        }
    }

    pub(crate) fn has_worker(&self, job_type: &str) -> bool {
        self.pools.read().contains_key(job_type)
    }

    /// Watch a schedule and submit whatever jobs it synthesizes.
    pub(crate) fn watch(this: &Arc<Self>, schedule: Arc<dyn Schedule>) {
        let weak = Arc::downgrade(this);
        let handle = tokio::spawn(async move {
            loop {
                if schedule.done() {
                    break;
                }
                let Some(core) = weak.upgrade() else { break };
                if core.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(job) = schedule.check() {
                    let job_type = job.job_type.clone();
                    let result = core.do_job(job);
                    tokio::spawn(async move {
                        if let Err(err) = result.then().await {
                            tracing::warn!(%job_type, %err, "scheduled job failed");
                        }
                    });
                }
                drop(core);
                tokio::time::sleep(SCHEDULE_POLL).await;
            }
        });
        this.watchers.lock().push(handle);
    }

    /// Drain every pool, then stop. Subsequent submits fail with `PoolClosed`.
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for handle in self.watchers.lock().drain(..) {
            handle.abort();
        }
        let pools: Vec<Arc<Pool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}
