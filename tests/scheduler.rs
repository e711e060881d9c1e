//! End-to-end scheduler behavior over native runnables.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hive::bus::{InMemoryBus, Message, MessageBus, MSG_TYPE_NIL, MSG_TYPE_RESULT, MSG_TYPE_RUN_ERR};
use hive::{
    ChangeEvent, Ctx, Every, FnRunnable, Hive, Job, JobError, JobOutcome, PoolOptions, RunErr,
    Runnable, ScalerConfig,
};
use uuid::Uuid;

/// Test fixture: runnable that fails with a transient error until it has
/// been called `succeed_after` times.
struct Flaky {
    calls: AtomicU32,
    succeed_after: u32,
}

impl Flaky {
    fn new(succeed_after: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            succeed_after,
        }
    }
}

#[async_trait]
impl Runnable for Flaky {
    async fn run(&self, _job: Job, _ctx: Ctx) -> JobOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.succeed_after {
            Err(JobError::Transient(format!("attempt {call} failed")))
        } else {
            Ok(Some(b"recovered".to_vec()))
        }
    }
}

/// Test fixture: sleeps per job and counts worker membership changes so the
/// autoscaler's decisions are observable.
struct Tracking {
    delay: Duration,
    current: Arc<AtomicI32>,
    peak: Arc<AtomicI32>,
}

#[async_trait]
impl Runnable for Tracking {
    async fn on_change(&self, event: ChangeEvent) -> Result<(), JobError> {
        match event {
            ChangeEvent::WorkerAdded => {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
            }
            ChangeEvent::WorkerRemoved => {
                self.current.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn run(&self, job: Job, _ctx: Ctx) -> JobOutcome {
        tokio::time::sleep(self.delay).await;
        Ok(Some(job.payload))
    }
}

#[tokio::test]
async fn native_echo_resolves_with_its_input() {
    let hive = Hive::new();
    let echo = hive.register(
        "echo",
        FnRunnable::new(|job: Job, _ctx| Ok(Some(job.payload))),
        PoolOptions::default(),
    );

    let started = Instant::now();
    let out = echo(b"hello".to_vec()).then().await.expect("echo job");
    assert_eq!(out.as_deref(), Some(b"hello".as_ref()));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "echo should resolve promptly, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let hive = Hive::new();
    let run = hive.register("flaky", Flaky::new(2), PoolOptions::new().retries(2));

    let out = run(b"go".to_vec()).then().await.expect("job should recover");
    assert_eq!(out.as_deref(), Some(b"recovered".as_ref()));
}

#[tokio::test]
async fn exhausted_retries_fail_with_the_last_error() {
    let hive = Hive::new();
    let run = hive.register("flaky", Flaky::new(2), PoolOptions::new().retries(1));

    match run(b"go".to_vec()).then().await {
        Err(JobError::Transient(msg)) => {
            assert!(msg.contains("attempt 2"), "expected the last failure, got: {msg}");
        }
        other => panic!("expected Transient, got {other:?}"),
    }
}

#[tokio::test]
async fn run_errors_are_never_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_seen = calls.clone();

    let hive = Hive::new();
    let run = hive.register(
        "explode",
        FnRunnable::new(move |_job, _ctx| {
            calls_seen.fetch_add(1, Ordering::SeqCst);
            Err(JobError::Run(RunErr::new(400, "bad input")))
        }),
        PoolOptions::new().retries(3),
    );

    match run(Vec::new()).then().await {
        Err(JobError::Run(err)) => assert_eq!(err.code, 400),
        other => panic!("expected RunErr, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "application errors must not retry");
}

#[tokio::test]
async fn unregistered_job_type_fails_with_no_worker() {
    let hive = Hive::new();
    assert!(!hive.is_registered("missing"));

    match hive.do_job(Job::new("missing", "")).then().await {
        Err(JobError::NoWorker(job_type)) => assert_eq!(job_type, "missing"),
        other => panic!("expected NoWorker, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_drains_then_rejects_new_work() {
    let hive = Hive::new();
    let run = hive.register(
        "slow",
        FnRunnable::new(|job: Job, _ctx| Ok(Some(job.payload))),
        PoolOptions::default(),
    );

    let inflight = run(b"drained".to_vec());
    hive.shutdown().await;

    // Work accepted before shutdown still resolves.
    let out = inflight.then().await.expect("accepted job must drain");
    assert_eq!(out.as_deref(), Some(b"drained".as_ref()));

    match hive.do_job(Job::new("slow", "late")).then().await {
        Err(JobError::PoolClosed) => {}
        other => panic!("expected PoolClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn autoscaler_grows_to_max_and_shrinks_back() {
    let current = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));

    let hive = Hive::new();
    let run = hive.register(
        "burst",
        Tracking {
            delay: Duration::from_millis(200),
            current: current.clone(),
            peak: peak.clone(),
        },
        PoolOptions::new()
            .pool_size(1)
            .autoscale_max(4)
            .scaler(ScalerConfig {
                sample_interval: Duration::from_millis(50),
                high_water: 2.0,
                low_water: 0.5,
                grow_after: 2,
                shrink_after: 3,
            }),
    );

    let promises: Vec<_> = (0..20).map(|i| run(format!("job-{i}").into_bytes())).collect();
    for promise in promises {
        promise.then().await.expect("burst job");
    }

    assert_eq!(
        peak.load(Ordering::SeqCst),
        4,
        "worker count must reach the autoscale ceiling during the burst"
    );

    // After the burst the controller backs the pool down to its minimum.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if current.load(Ordering::SeqCst) == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "pool did not shrink back to 1 worker, still at {}",
            current.load(Ordering::SeqCst)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn chained_jobs_dispatch_through_the_capability_table() {
    let hive = Hive::new();
    hive.register(
        "double",
        FnRunnable::new(|job: Job, _ctx| {
            let n: i64 = String::from_utf8_lossy(&job.payload)
                .parse()
                .map_err(|e| JobError::Fatal(format!("bad number: {e}")))?;
            Ok(Some((n * 2).to_string().into_bytes()))
        }),
        PoolOptions::default(),
    );

    struct Chain;
    #[async_trait]
    impl Runnable for Chain {
        async fn run(&self, job: Job, ctx: Ctx) -> JobOutcome {
            let sub = ctx.caps.dispatch_job(Job::new("double", job.payload))?;
            sub.then().await
        }
    }
    let chain = hive.register("chain", Chain, PoolOptions::default());

    let out = chain(b"21".to_vec()).then().await.expect("chained job");
    assert_eq!(out.as_deref(), Some(b"42".as_ref()));
}

#[tokio::test]
async fn per_job_capability_override_inherits_the_dispatcher() {
    let hive = Hive::new();
    hive.register(
        "double",
        FnRunnable::new(|job: Job, _ctx| {
            let n: i64 = String::from_utf8_lossy(&job.payload)
                .parse()
                .map_err(|e| JobError::Fatal(format!("bad number: {e}")))?;
            Ok(Some((n * 2).to_string().into_bytes()))
        }),
        PoolOptions::default(),
    );

    struct Chain;
    #[async_trait]
    impl Runnable for Chain {
        async fn run(&self, job: Job, ctx: Ctx) -> JobOutcome {
            let sub = ctx.caps.dispatch_job(Job::new("double", job.payload))?;
            sub.then().await
        }
    }
    hive.register("chain", Chain, PoolOptions::default());

    // A fresh table has no dispatcher of its own; submitting with it must
    // still reach the scheduler the job runs inside.
    let override_caps = hive::Capabilities::default();
    let out = hive
        .do_job_with_caps(Job::new("chain", "8"), override_caps)
        .then()
        .await
        .expect("override job");
    assert_eq!(out.as_deref(), Some(b"16".as_ref()));
}

#[tokio::test]
async fn schedules_synthesize_jobs_at_their_cadence() {
    let fired = Arc::new(AtomicU32::new(0));
    let fired_seen = fired.clone();

    let hive = Hive::new();
    hive.register(
        "tick",
        FnRunnable::new(move |_job, _ctx| {
            fired_seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }),
        PoolOptions::default(),
    );
    hive.schedule(Every::new(Duration::from_millis(100), || Job::new("tick", "")));

    tokio::time::sleep(Duration::from_millis(450)).await;
    let count = fired.load(Ordering::SeqCst);
    assert!((2..=5).contains(&count), "expected a few ticks, got {count}");
}

#[tokio::test]
async fn listen_replies_with_result_topic_and_preserves_correlation() {
    let hive = Hive::new();
    hive.register(
        "compute",
        FnRunnable::new(|job: Job, _ctx| {
            let n: i64 = String::from_utf8_lossy(&job.payload)
                .parse()
                .map_err(|e| JobError::Fatal(format!("bad number: {e}")))?;
            Ok(Some((n * 2).to_string().into_bytes()))
        }),
        PoolOptions::default(),
    );

    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::default());
    hive.listen(bus.clone(), "compute");
    let mut replies = bus.subscribe(MSG_TYPE_RESULT);

    let parent = Uuid::new_v4();
    let msg = Message::with_parent("compute", parent, "5");
    let msg_id = msg.uuid;
    bus.publish(msg);

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .expect("reply within 2s")
        .expect("reply message");
    assert_eq!(reply.payload, b"10");
    assert_eq!(reply.reply_to, Some(msg_id), "reply must correlate to the request");
    assert_eq!(reply.parent_id, Some(parent), "reply must keep the parent id");
}

#[tokio::test]
async fn listen_maps_run_errors_and_nil_results_to_their_topics() {
    let hive = Hive::new();
    hive.register(
        "explode",
        FnRunnable::new(|_job, _ctx| Err(JobError::Run(RunErr::new(422, "rejected")))),
        PoolOptions::default(),
    );
    hive.register(
        "void",
        FnRunnable::new(|_job, _ctx| Ok(None)),
        PoolOptions::default(),
    );

    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::default());
    hive.listen(bus.clone(), "explode");
    hive.listen(bus.clone(), "void");
    let mut run_errs = bus.subscribe(MSG_TYPE_RUN_ERR);
    let mut nils = bus.subscribe(MSG_TYPE_NIL);

    bus.publish(Message::new("explode", "x"));
    let reply = tokio::time::timeout(Duration::from_secs(2), run_errs.recv())
        .await
        .expect("runerr reply within 2s")
        .expect("runerr message");
    let err: RunErr = serde_json::from_slice(&reply.payload).expect("runerr body is json");
    assert_eq!(err.code, 422);

    bus.publish(Message::new("void", ""));
    let reply = tokio::time::timeout(Duration::from_secs(2), nils.recv())
        .await
        .expect("nil reply within 2s")
        .expect("nil message");
    assert!(reply.payload.is_empty());
}
