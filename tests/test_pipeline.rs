//! End-to-end behaviour of the coordinator, validator and fallback together

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use stagehand::pipeline::{RunEvent, Toolbox};
use stagehand::{
    CallOrigin, Delegate, DeterministicExecutor, EngineConfig, FallbackController, FieldMapping,
    FnDelegate, FnProvider, Operation, OperationRegistry, ParamSpec, ParamType,
    PipelineCoordinator, PipelineGraph, ProviderFailure, RetryPolicy, RunContext, RunResult,
    StageSpec, StageStatus, StagehandError, Validator,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

fn registry() -> Arc<OperationRegistry> {
    let lookup = |name: &str| {
        Operation::new(name, "Look something up")
            .with_param(ParamSpec::required("q", ParamType::String))
    };
    Arc::new(
        OperationRegistry::new()
            .with_operation(lookup("lookup_a"))
            .and_then(|r| r.with_operation(lookup("lookup_b")))
            .unwrap(),
    )
}

fn answering(registry: Arc<OperationRegistry>, config: &EngineConfig) -> DeterministicExecutor {
    DeterministicExecutor::from_config(registry, config)
        .with_provider(
            "lookup_a",
            FnProvider::new(|args: Map<String, Value>| async move { Ok(json!({"a": args["q"]})) }),
        )
        .unwrap()
        .with_provider(
            "lookup_b",
            FnProvider::new(|args: Map<String, Value>| async move { Ok(json!({"b": args["q"]})) }),
        )
        .unwrap()
}

fn coordinator_with(executor: DeterministicExecutor, config: EngineConfig) -> PipelineCoordinator {
    let executor = Arc::new(executor);
    let fallback = FallbackController::from_config(Arc::clone(&executor), &config)
        .with_mapping(FieldMapping::new("lookup_a").bind("q", "query"))
        .with_mapping(FieldMapping::new("lookup_b").bind("q", "query"));
    PipelineCoordinator::new(executor, fallback, config).unwrap()
}

fn coordinator() -> PipelineCoordinator {
    let config = EngineConfig::default();
    coordinator_with(answering(registry(), &config), config)
}

fn request() -> RunContext {
    let mut map = Map::new();
    map.insert("query".into(), json!("rust"));
    RunContext::new(map)
}

/// Answers from its own knowledge without calling anything
fn lazy(name: &str) -> Arc<dyn Delegate> {
    Arc::new(FnDelegate::new(name, |_ctx, _tb| async {
        Ok(Some(json!("trust me")))
    }))
}

/// Calls `operation` with the request's query
fn diligent(name: &str, operation: &'static str) -> Arc<dyn Delegate> {
    Arc::new(FnDelegate::new(name, move |ctx: RunContext, tb: Toolbox| async move {
        let mut args = Map::new();
        args.insert("q".into(), json!(ctx.str_param("query").unwrap_or_default()));
        let call = tb.invoke(operation, args).await.unwrap();
        Ok(call.outcome.value().cloned())
    }))
}

/// Stages that ended Verified or Recovered must show every requirement in their trace
fn assert_sound(result: &RunResult) {
    for report in result.stages.values() {
        if matches!(report.status, StageStatus::Verified | StageStatus::Recovered) {
            let trace = report.final_trace();
            assert!(
                Validator::check(&report.requirements, &trace).is_verified(),
                "stage {} is {} without its requirements",
                report.id,
                report.status
            );
        }
    }
}

#[tokio::test]
async fn test_lazy_stage_is_recovered_while_diligent_stage_is_verified() {
    let coordinator = coordinator();
    let mut events = coordinator.subscribe();
    let graph = PipelineGraph::build(
        "pair",
        vec![
            StageSpec::new("a", lazy("lazy_a")).requires("lookup_a"),
            StageSpec::new("b", diligent("diligent_b", "lookup_b")).requires("lookup_b"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    assert_eq!(result.status("a"), Some(StageStatus::Recovered));
    assert_eq!(result.status("b"), Some(StageStatus::Verified));
    assert_eq!(result.output("a"), Some(&json!({"lookup_a": {"a": "rust"}})));
    assert_eq!(result.output("b"), Some(&json!({"b": "rust"})));

    let a = result.stage("a").unwrap();
    assert!(a.used_fallback());
    assert!(a.missing_after_delegate.contains("lookup_a"));
    let recovery = a.recovery_trace.as_ref().unwrap();
    assert_eq!(recovery.calls_from(CallOrigin::DeterministicExecutor).count(), 1);
    assert!(!result.stage("b").unwrap().used_fallback());
    assert!(result.is_fully_satisfied());
    assert_sound(&result);

    let mut unverified = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RunEvent::StageUnverified { stage_id, .. } = event {
            unverified.push(stage_id);
        }
    }
    assert_eq!(unverified, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_unknown_requirement_fails_before_any_delegate_runs() {
    let coordinator = coordinator();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let delegate: Arc<dyn Delegate> = Arc::new(FnDelegate::new("watched", move |_ctx, _tb| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(None)
        }
    }));

    let err = PipelineGraph::build(
        "broken",
        vec![StageSpec::new("x", delegate).requires("teleport")],
        coordinator.registry(),
    )
    .unwrap_err();

    assert!(matches!(err, StagehandError::InvalidPipeline { .. }));
    assert!(err.to_string().contains("teleport"));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_transient_provider_failures_are_retried_during_recovery() {
    let config = EngineConfig::default().with_retry(RetryPolicy {
        max_retries: 2,
        initial_delay_ms: 1,
        ..RetryPolicy::default()
    });
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let executor = DeterministicExecutor::from_config(registry(), &config)
        .with_provider(
            "lookup_a",
            FnProvider::new(move |_args: Map<String, Value>| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderFailure::rate_limited("slow down"))
                    } else {
                        Ok(json!("finally"))
                    }
                }
            }),
        )
        .unwrap();
    let coordinator = coordinator_with(executor, config);
    let graph = PipelineGraph::build(
        "flaky",
        vec![StageSpec::new("a", lazy("lazy_a")).requires("lookup_a")],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    assert_eq!(result.status("a"), Some(StageStatus::Recovered));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let recovery = result.stage("a").unwrap().recovery_trace.clone().unwrap();
    assert_eq!(recovery.calls.len(), 1);
    assert_eq!(recovery.calls[0].attempts, 3);
    assert_sound(&result);
}

#[tokio::test]
async fn test_rejected_recovery_fails_only_that_stage() {
    let config = EngineConfig::default();
    let executor = DeterministicExecutor::from_config(registry(), &config)
        .with_provider(
            "lookup_a",
            FnProvider::new(|_args: Map<String, Value>| async {
                Err(ProviderFailure::rejected("quota exhausted"))
            }),
        )
        .unwrap()
        .with_provider(
            "lookup_b",
            FnProvider::new(|_args: Map<String, Value>| async { Ok(json!("b")) }),
        )
        .unwrap();
    let coordinator = coordinator_with(executor, config);
    let graph = PipelineGraph::build(
        "partial",
        vec![
            StageSpec::new("a", lazy("lazy_a")).requires("lookup_a"),
            StageSpec::new("b", diligent("diligent_b", "lookup_b")).requires("lookup_b"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    assert_eq!(result.status("a"), Some(StageStatus::Failed));
    assert_eq!(result.status("b"), Some(StageStatus::Verified));
    assert!(result.output("a").is_none());
    let reason = &result.stage("a").unwrap().failure_reasons["lookup_a"];
    assert!(reason.contains("quota exhausted"), "{}", reason);
    assert!(!result.is_fully_satisfied());
}

#[tokio::test]
async fn test_failed_dependency_does_not_block_dependents() {
    let config = EngineConfig::default();
    let executor = Arc::new(answering(registry(), &config));
    // No extraction rules at all
    let fallback = FallbackController::from_config(Arc::clone(&executor), &config);
    let coordinator = PipelineCoordinator::new(executor, fallback, config).unwrap();
    let graph = PipelineGraph::build(
        "chain",
        vec![
            StageSpec::new("a", lazy("lazy_a")).requires("lookup_a"),
            StageSpec::new("b", diligent("diligent_b", "lookup_b"))
                .requires("lookup_b")
                .depends_on("a"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    assert_eq!(result.status("a"), Some(StageStatus::Failed));
    assert_eq!(result.status("b"), Some(StageStatus::Verified));
    assert!(result.stage("a").unwrap().failure_reasons["lookup_a"].contains("no extraction rule"));
}

#[tokio::test]
async fn test_dependents_start_after_their_dependencies() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let recording = |name: &'static str| -> Arc<dyn Delegate> {
        let order = Arc::clone(&order);
        Arc::new(FnDelegate::new(name, move |_ctx, tb: Toolbox| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(tb.stage_id().to_string());
                Ok(Some(json!(name)))
            }
        }))
    };

    let coordinator = coordinator();
    let graph = PipelineGraph::build(
        "diamond",
        vec![
            StageSpec::new("root", recording("r")),
            StageSpec::new("left", recording("l")).depends_on("root"),
            StageSpec::new("right", recording("rt")).depends_on("root"),
            StageSpec::new("join", recording("j"))
                .depends_on("left")
                .depends_on("right"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    let order = order.lock().unwrap().clone();
    let position = |id: &str| order.iter().position(|s| s == id).unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(position("root"), 0);
    assert!(position("join") > position("left"));
    assert!(position("join") > position("right"));
    assert_eq!(result.stages_with(StageStatus::Verified).len(), 4);
}

#[tokio::test]
async fn test_shared_output_key_keeps_first_writer() {
    let coordinator = coordinator();
    let graph = PipelineGraph::build(
        "clash",
        vec![
            StageSpec::new("a", diligent("diligent_a", "lookup_a"))
                .requires("lookup_a")
                .output_key("shared"),
            StageSpec::new("b", diligent("diligent_b", "lookup_b"))
                .requires("lookup_b")
                .output_key("shared"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    let rejected: Vec<_> = result
        .stages
        .values()
        .filter(|report| report.store_error.is_some())
        .collect();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].store_error.as_ref().unwrap().contains("shared"));

    let kept = result
        .stages
        .values()
        .find(|report| report.store_error.is_none())
        .unwrap();
    assert_eq!(result.output("shared"), kept.result.as_ref());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_delegate_times_out_without_delaying_siblings() {
    let slow: Arc<dyn Delegate> = Arc::new(FnDelegate::new("slow", |_ctx, _tb| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }));
    let coordinator = coordinator();
    let graph = PipelineGraph::build(
        "race",
        vec![
            StageSpec::new("a", slow)
                .requires("lookup_a")
                .with_timeout(Duration::from_millis(50)),
            StageSpec::new("b", diligent("diligent_b", "lookup_b")).requires("lookup_b"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let started = std::time::Instant::now();
    let result = coordinator.run(&graph, request()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status("a"), Some(StageStatus::Recovered));
    assert_eq!(result.status("b"), Some(StageStatus::Verified));
    let failure = result.stage("a").unwrap().attempt_failure.clone().unwrap();
    assert!(failure.transient);
    assert_sound(&result);
}

/// Waits for every sibling at `barrier`, then calls `operation`
fn rendezvous(name: &str, operation: &'static str, barrier: Arc<Barrier>) -> Arc<dyn Delegate> {
    Arc::new(FnDelegate::new(name, move |_ctx, tb: Toolbox| {
        let barrier = Arc::clone(&barrier);
        async move {
            barrier.wait().await;
            let mut args = Map::new();
            args.insert("q".into(), json!("together"));
            let call = tb.invoke(operation, args).await.unwrap();
            Ok(call.outcome.value().cloned())
        }
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sibling_stages_make_progress_together() {
    let barrier = Arc::new(Barrier::new(2));
    let coordinator = coordinator();
    let graph = PipelineGraph::build(
        "siblings",
        vec![
            StageSpec::new("a", rendezvous("meet_a", "lookup_a", Arc::clone(&barrier)))
                .requires("lookup_a")
                .with_timeout(Duration::from_secs(2)),
            StageSpec::new("b", rendezvous("meet_b", "lookup_b", Arc::clone(&barrier)))
                .requires("lookup_b")
                .with_timeout(Duration::from_secs(2)),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    assert_eq!(result.status("a"), Some(StageStatus::Verified));
    assert_eq!(result.status("b"), Some(StageStatus::Verified));
    assert!(result.stage("a").unwrap().attempt_failure.is_none());
    assert!(result.stage("b").unwrap().attempt_failure.is_none());
}

/// Tracks how many stages are inside their delegate at once
fn occupant(name: &str, inside: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<dyn Delegate> {
    Arc::new(FnDelegate::new(name, move |_ctx, _tb| {
        let inside = Arc::clone(&inside);
        let peak = Arc::clone(&peak);
        async move {
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(json!("done")))
        }
    }))
}

async fn peak_concurrency(max_parallel_stages: usize) -> usize {
    let config = EngineConfig::default().with_max_parallel_stages(max_parallel_stages);
    let coordinator = coordinator_with(answering(registry(), &config), config);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let stages = ["s1", "s2", "s3", "s4"]
        .into_iter()
        .map(|id| StageSpec::new(id, occupant(id, Arc::clone(&inside), Arc::clone(&peak))))
        .collect();
    let graph = PipelineGraph::build("crowd", stages, coordinator.registry()).unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();
    assert_eq!(result.stages_with(StageStatus::Verified).len(), 4);
    peak.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallelism_is_bounded_by_config() {
    assert_eq!(peak_concurrency(1).await, 1);
    let bounded = peak_concurrency(2).await;
    assert!((1..=2).contains(&bounded), "{}", bounded);
}

#[tokio::test]
async fn test_panicking_delegate_is_contained() {
    let panicking: Arc<dyn Delegate> = Arc::new(FnDelegate::new("boom", |_ctx, _tb| async {
        if true {
            panic!("delegate exploded");
        }
        Ok(None)
    }));
    let coordinator = coordinator();
    let graph = PipelineGraph::build(
        "panic",
        vec![
            StageSpec::new("a", panicking).requires("lookup_a"),
            StageSpec::new("b", diligent("diligent_b", "lookup_b")).requires("lookup_b"),
        ],
        coordinator.registry(),
    )
    .unwrap();

    let result = coordinator.run(&graph, request()).await.unwrap();

    assert_eq!(result.status("a"), Some(StageStatus::Recovered));
    assert_eq!(result.status("b"), Some(StageStatus::Verified));
    let failure = result.stage("a").unwrap().attempt_failure.clone().unwrap();
    assert!(failure.reason.contains("delegate exploded"));
}

#[tokio::test]
async fn test_validation_is_idempotent_over_reports() {
    let coordinator = coordinator();
    let graph = PipelineGraph::build(
        "once",
        vec![StageSpec::new("b", diligent("diligent_b", "lookup_b")).requires("lookup_b")],
        coordinator.registry(),
    )
    .unwrap();
    let result = coordinator.run(&graph, request()).await.unwrap();
    let report = result.stage("b").unwrap();
    let trace = report.final_trace();

    let first = Validator::check(&report.requirements, &trace);
    let second = Validator::check(&report.requirements, &trace);
    assert_eq!(first, second);
    assert!(first.is_verified());
}
