//! End-to-end execution: gating, barriers, retries, rewrites, cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use flowl::driver::{ArgMap, DriverError, Manifest, native};
use flowl::runtime::{FlowStatus, LogBucket, NodeStatus, Scheduler};
use parking_lot::Mutex;

fn counter_fn(name: &str) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let probe = counter.clone();
    native::register(name, move |_cancel, _args| {
        let probe = probe.clone();
        async move {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok(ArgMap::new())
        }
    });
    counter
}

async fn run(src: &str) -> (Scheduler, flowl::FlowId, flowl::runtime::Result<()>) {
    let scheduler = Scheduler::new();
    let id = scheduler.parse_flow("t", src).unwrap();
    scheduler.init_flow(&id, LogBucket::memory()).await.unwrap();
    let result = scheduler.exec_flow(&id).await;
    (scheduler, id, result)
}

#[tokio::test]
async fn serial_flow_runs_every_step() {
    let a = counter_fn("serial_a");
    let b = counter_fn("serial_b");
    let src = "load \"go:serial_a\"\nload \"go:serial_b\"\nco serial_a\nco serial_b\n";

    let (scheduler, id, result) = run(src).await;
    result.unwrap();
    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 1);

    let insight = scheduler.inspect_flow(&id).unwrap();
    assert_eq!(insight.status, "Stopped");
    assert_eq!(insight.total, 2);
    assert_eq!(insight.done, 2);
    assert!(insight.nodes.iter().all(|n| n.status == "Stopped"));
}

/// Scenario: switch/case condition gating. The matching case runs, the
/// default is marked not-executed and its driver is never called.
#[tokio::test]
async fn switch_gates_tasks_by_condition() {
    let hit = counter_fn("case_hit");
    let miss = counter_fn("case_miss");
    let src = r#"
var v = 1
load "go:case_hit"
load "go:case_miss"
switch {
    case $(v) == 1 { co case_hit }
    default        { co case_miss }
}
"#;
    let (scheduler, id, result) = run(src).await;
    result.unwrap();
    assert_eq!(hit.load(Ordering::SeqCst), 1);
    assert_eq!(miss.load(Ordering::SeqCst), 0);

    let flow = scheduler.flow(&id).unwrap();
    assert_eq!(flow.stats(1).unwrap().status(), NodeStatus::Stopped);
    assert_eq!(flow.stats(2).unwrap().status(), NodeStatus::NotExecuted);
    assert_eq!(flow.stats(2).unwrap().runs(), 0);
}

/// A task's returned map lands in the arrow-bound variable and feeds the
/// next step's arguments through `$(t.KEY)`.
#[tokio::test]
async fn return_capture_feeds_field_reference() {
    native::register("fake_time", |_cancel, _args| async {
        Ok(ArgMap::from([("Now".to_string(), "2038-01-19".to_string())]))
    });
    let seen: Arc<Mutex<Vec<ArgMap>>> = Arc::new(Mutex::new(Vec::new()));
    let probe = seen.clone();
    native::register("arg_probe", move |_cancel, args| {
        let probe = probe.clone();
        async move {
            probe.lock().push(args);
            Ok(ArgMap::new())
        }
    });

    let src = r#"
load "go:fake_time"
load "go:arg_probe"
var t
co fake_time -> t
co arg_probe { "Time": "$(t.Now)" }
"#;
    let (_scheduler, _id, result) = run(src).await;
    result.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["Time"], "2038-01-19");
}

/// A counting loop: the rewrite advances the counter between iterations and
/// the ForEnter condition eventually turns false.
#[tokio::test]
async fn for_loop_counts_to_the_condition() {
    let body = counter_fn("loop_body");
    let src = r#"
load "go:loop_body"
var i = 0
for $(i) < 3 {
    co loop_body
    i <- $(i) + 1
}
"#;
    let (_scheduler, _id, result) = run(src).await;
    result.unwrap();
    assert_eq!(body.load(Ordering::SeqCst), 3);
}

/// File-scope rewrites run in the pre-execution hook, before the first step.
#[tokio::test]
async fn file_scope_rewrite_runs_before_first_step() {
    let seen: Arc<Mutex<Vec<ArgMap>>> = Arc::new(Mutex::new(Vec::new()));
    let probe = seen.clone();
    native::register("presub_probe", move |_cancel, args| {
        let probe = probe.clone();
        async move {
            probe.lock().push(args);
            Ok(ArgMap::new())
        }
    });

    let src = r#"
load "go:presub_probe"
var a = 1
a <- $(a) + 1
co presub_probe { "A": "$(a)" }
"#;
    let (_scheduler, _id, result) = run(src).await;
    result.unwrap();
    assert_eq!(seen.lock()[0]["A"], "2");
}

/// fn-local rewrites re-run before every invocation of the configured task.
#[tokio::test]
async fn fn_local_rewrites_rerun_each_invocation() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let probe = seen.clone();
    native::register("fn_counter_probe", move |_cancel, args| {
        let probe = probe.clone();
        async move {
            probe.lock().push(args["N"].clone());
            Ok(ArgMap::new())
        }
    });

    let src = r#"
load "go:fn_counter_probe"
var i = 0
fn wrapped = fn_counter_probe {
    var n = 0
    n <- $(n) + 1
    args = { "N": "$(n)" }
}
for $(i) < 3 {
    co wrapped
    i <- $(i) + 1
}
"#;
    let (_scheduler, _id, result) = run(src).await;
    result.unwrap();
    assert_eq!(*seen.lock(), vec!["1", "2", "3"]);
}

/// Step barrier: no task of step k+1 starts before every task of step k
/// finished.
#[tokio::test]
async fn parallel_group_finishes_before_next_step() {
    let spans: Arc<Mutex<Vec<(String, Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    for name in ["slow_left", "slow_right", "tail_probe"] {
        let spans = spans.clone();
        let name_owned = name.to_string();
        native::register(name, move |_cancel, _args| {
            let spans = spans.clone();
            let name = name_owned.clone();
            async move {
                let begin = Instant::now();
                if name != "tail_probe" {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                }
                spans.lock().push((name, begin, Instant::now()));
                Ok(ArgMap::new())
            }
        });
    }

    let src = r#"
load "go:slow_left"
load "go:slow_right"
load "go:tail_probe"
co { slow_left slow_right }
co tail_probe
"#;
    let (_scheduler, _id, result) = run(src).await;
    result.unwrap();

    let spans = spans.lock();
    let tail_begin = spans
        .iter()
        .find(|(n, _, _)| n == "tail_probe")
        .map(|(_, b, _)| *b)
        .unwrap();
    for (name, _, end) in spans.iter() {
        if name != "tail_probe" {
            assert!(
                *end <= tail_begin,
                "{name} was still running when the next step started"
            );
        }
    }
}

/// Retry policy: a failing function with retry_on_failure = 2 runs three
/// times, then the step fails.
#[tokio::test]
async fn retry_policy_reruns_failed_task() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let probe = attempts.clone();
    native::register_with_manifest(
        Manifest {
            name: "flaky_fn".into(),
            driver: "go".into(),
            retry_on_failure: 2,
            ..Default::default()
        },
        move |_cancel, _args| {
            let probe = probe.clone();
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Err(DriverError::Execution("boom".into()))
            }
        },
    );

    let src = "load \"go:flaky_fn\"\nco flaky_fn\n";
    let (scheduler, id, result) = run(src).await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let flow = scheduler.flow(&id).unwrap();
    assert_eq!(flow.stats(1).unwrap().runs(), 3);
    assert_eq!(flow.status(), FlowStatus::Killed);
}

/// Ignore-failure policy: the error is recorded but the pass continues.
#[tokio::test]
async fn ignored_failure_does_not_stop_the_pass() {
    native::register_with_manifest(
        Manifest {
            name: "soft_fail".into(),
            driver: "go".into(),
            ignore_failure: true,
            ..Default::default()
        },
        |_cancel, _args| async { Err(DriverError::Execution("ignored".into())) },
    );
    let after = counter_fn("after_soft_fail");

    let src = "load \"go:soft_fail\"\nload \"go:after_soft_fail\"\nco soft_fail\nco after_soft_fail\n";
    let (scheduler, id, result) = run(src).await;
    result.unwrap();
    assert_eq!(after.load(Ordering::SeqCst), 1);

    let flow = scheduler.flow(&id).unwrap();
    assert_eq!(flow.stats(1).unwrap().status(), NodeStatus::Error);
    assert!(flow.stats(1).unwrap().last_error().is_some());
    assert_eq!(flow.status(), FlowStatus::Stopped);
}

/// The exit directive aborts the pass before later steps run.
#[tokio::test]
async fn exit_directive_stops_the_flow() {
    let first = counter_fn("before_exit");
    let second = counter_fn("after_exit");
    let src = "load \"go:before_exit\"\nload \"go:after_exit\"\nco before_exit\nexit \"stop here\"\nco after_exit\n";

    let (_scheduler, _id, result) = run(src).await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("stop here"));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

/// Cancellation interrupts a running step promptly and no later batch is
/// spawned.
#[tokio::test]
async fn cancel_interrupts_a_running_step() {
    native::register("hang_fn", |cancel, _args| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(ArgMap::new()),
            _ = cancel.cancelled() => Err(DriverError::Cancelled("hang_fn".into())),
        }
    });
    let never = counter_fn("never_fn");

    let scheduler = Arc::new(Scheduler::new());
    let src = "load \"go:hang_fn\"\nload \"go:never_fn\"\nco hang_fn\nco never_fn\n";
    let id = scheduler.parse_flow("t", src).unwrap();
    scheduler.init_flow(&id, LogBucket::memory()).await.unwrap();

    let runner = {
        let scheduler = scheduler.clone();
        let id = id.clone();
        tokio::spawn(async move { scheduler.exec_flow(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.cancel_running_flow(&id).unwrap();

    let begin = Instant::now();
    let result = runner.await.unwrap();
    assert!(begin.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        result,
        Err(flowl::RuntimeError::Cancelled(_))
    ));
    assert_eq!(never.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.flow(&id).unwrap().status(), FlowStatus::Cancelled);
}

/// println writes through the node's log writer; to_ready truncates it.
#[tokio::test]
async fn println_logs_and_to_ready_truncates() {
    let src = "var greeting = \"world\"\nprintln \"hello $(greeting)\"\n";
    let (scheduler, id, result) = run(src).await;
    result.unwrap();

    let flow = scheduler.flow(&id).unwrap();
    assert_eq!(flow.bucket().read(1).unwrap(), "hello world\n");

    flow.to_ready().unwrap();
    assert_eq!(flow.bucket().read(1).unwrap(), "");
    assert_eq!(flow.stats(1).unwrap().runs(), 0);
}

/// A stopped flow can be executed again; statistics restart from zero.
#[tokio::test]
async fn stopped_flow_replays() {
    let counter = counter_fn("replay_fn");
    let src = "load \"go:replay_fn\"\nco replay_fn\n";

    let (scheduler, id, result) = run(src).await;
    result.unwrap();
    scheduler.exec_flow(&id).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let flow = scheduler.flow(&id).unwrap();
    assert_eq!(flow.stats(1).unwrap().runs(), 1);
}
