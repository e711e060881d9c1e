//! WebAssembly host embedding.
//!
//! Each registered [`WasmRunnable`] owns one environment: a compiled module
//! plus a pool of instances. Concurrent jobs multiplex over the pool; every
//! in-flight call is named by a random 31-bit identifier so guest→host
//! callbacks can locate their caller through the process-wide registry.

mod environment;
mod hostfns;
mod ident;
mod instance;
mod module_ref;
mod runnable;

pub use module_ref::ModuleRef;
pub use runnable::WasmRunnable;

use std::time::Duration;

use once_cell::sync::OnceCell;
use wasmtime::{Config, Engine, Trap};

use crate::error::JobError;

/// Granularity of the wall-clock interrupt for guest execution.
pub(crate) const EPOCH_TICK: Duration = Duration::from_millis(100);

/// Epoch delta meaning "no budget"; far enough out to never fire.
pub(crate) const NO_DEADLINE_TICKS: u64 = 1 << 48;

/// Per-environment tuning.
#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Linear-memory cap per instance, in mebibytes.
    pub max_memory_mb: u64,
    /// How long instance removal waits for the exclusivity gate before
    /// discarding the instance regardless.
    pub remove_grace: Duration,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            remove_grace: Duration::from_secs(3),
        }
    }
}

static ENGINE: OnceCell<Engine> = OnceCell::new();

/// The process-wide engine all environments compile against. The first call
/// also starts the epoch ticker thread that drives guest wall-clock budgets.
pub(crate) fn shared_engine() -> Result<&'static Engine, JobError> {
    ENGINE.get_or_try_init(|| {
        let mut config = Config::new();
        config.async_support(true).epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|err| JobError::fatal(format!("failed to build engine: {err:#}")))?;

        let weak = engine.weak();
        std::thread::Builder::new()
            .name("hive-epoch".into())
            .spawn(move || loop {
                std::thread::sleep(EPOCH_TICK);
                match weak.upgrade() {
                    Some(engine) => engine.increment_epoch(),
                    None => break,
                }
            })
            .map_err(|err| JobError::fatal(format!("failed to spawn epoch ticker: {err}")))?;

        Ok(engine)
    })
}

/// Epoch ticks for one guest call's wall-clock budget.
pub(crate) fn deadline_ticks(budget: Option<Duration>) -> u64 {
    match budget {
        Some(budget) => {
            let tick_ms = EPOCH_TICK.as_millis().max(1);
            (budget.as_millis().max(1).div_ceil(tick_ms) as u64).max(1)
        }
        None => NO_DEADLINE_TICKS,
    }
}

/// Classify a failed guest call. Epoch interrupts are the timeout signal;
/// everything else is fatal to the job.
pub(crate) fn map_wasm_error(err: anyhow::Error, budget: Option<Duration>) -> JobError {
    if let Some(trap) = err.downcast_ref::<Trap>() {
        if *trap == Trap::Interrupt {
            return JobError::Timeout(budget.unwrap_or(EPOCH_TICK));
        }
    }
    let mut text = err.to_string().to_ascii_lowercase();
    for cause in err.chain().skip(1) {
        text.push_str("::");
        text.push_str(&cause.to_string().to_ascii_lowercase());
    }
    if text.contains("epoch") || text.contains("deadline") || text.contains("interrupt") {
        return JobError::Timeout(budget.unwrap_or(EPOCH_TICK));
    }
    JobError::fatal(format!("guest call failed: {err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_ticks_round_up() {
        assert_eq!(deadline_ticks(Some(Duration::from_millis(1))), 1);
        assert_eq!(deadline_ticks(Some(Duration::from_millis(100))), 1);
        assert_eq!(deadline_ticks(Some(Duration::from_millis(101))), 2);
        assert_eq!(deadline_ticks(Some(Duration::from_secs(1))), 10);
        assert_eq!(deadline_ticks(None), NO_DEADLINE_TICKS);
    }

    #[test]
    fn epoch_interrupts_classify_as_timeout() {
        let budget = Some(Duration::from_secs(1));
        let err = anyhow::Error::from(Trap::Interrupt);
        match map_wasm_error(err, budget) {
            JobError::Timeout(d) => assert_eq!(d, Duration::from_secs(1)),
            other => panic!("expected Timeout, got {other:?}"),
        }

        let err = anyhow::anyhow!("wasm trap: epoch deadline reached during execution");
        assert!(matches!(map_wasm_error(err, budget), JobError::Timeout(_)));
    }

    #[test]
    fn other_traps_classify_as_fatal() {
        let err = anyhow::anyhow!("unreachable instruction executed");
        assert!(matches!(map_wasm_error(err, None), JobError::Fatal(_)));
    }
}
