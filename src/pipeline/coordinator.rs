use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::context::RunContext;
use super::events::{EventBus, RunEvent};
use super::fallback::FallbackController;
use super::graph::PipelineGraph;
use super::report::{RunResult, StageReport};
use super::stage::{Stage, StageSpec, StageStatus};
use super::validator::{Validator, Verification};
use crate::core::config::EngineConfig;
use crate::core::errors::{Result, StagehandError};
use crate::operation::{DeterministicExecutor, OperationRegistry};
use crate::trace::Trace;

/// Runs pipeline graphs: schedules stages, verifies them, recovers the gaps
pub struct PipelineCoordinator {
    registry: Arc<OperationRegistry>,
    executor: Arc<DeterministicExecutor>,
    fallback: Arc<FallbackController>,
    config: EngineConfig,
    events: EventBus,
}

impl PipelineCoordinator {
    pub fn new(
        executor: Arc<DeterministicExecutor>,
        fallback: FallbackController,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::clone(executor.registry()),
            executor,
            fallback: Arc::new(fallback),
            events: EventBus::new(config.event_capacity),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Run every stage of `graph` to a terminal status
    ///
    /// Fails only when the graph does not match the registry or the run's
    /// session is unusable; everything stage-local ends up in the result.
    pub async fn run(&self, graph: &PipelineGraph, ctx: RunContext) -> Result<RunResult> {
        graph.validate_against(&self.registry)?;
        if ctx.session().is_closed() {
            return Err(StagehandError::session_unavailable(ctx.run_id()));
        }

        let run_id = ctx.run_id().clone();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            run_id = %run_id,
            pipeline = graph.name(),
            stages = graph.len(),
            "Pipeline run started"
        );
        self.events.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            pipeline: graph.name().to_string(),
            stages: graph.len(),
            at: started_at,
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_stages));
        let mut pending: BTreeMap<String, Arc<StageSpec>> = graph
            .stages()
            .map(|spec| (spec.id.clone(), Arc::clone(spec)))
            .collect();
        let mut terminal: HashSet<String> = HashSet::new();
        let mut reports: BTreeMap<String, StageReport> = BTreeMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            let ready: Vec<String> = pending
                .values()
                .filter(|spec| spec.depends_on.iter().all(|dep| terminal.contains(dep)))
                .map(|spec| spec.id.clone())
                .collect();

            for id in ready {
                let Some(spec) = pending.remove(&id) else {
                    continue;
                };
                let task = StageTask {
                    spec: Arc::clone(&spec),
                    ctx: ctx.clone(),
                    executor: Arc::clone(&self.executor),
                    fallback: Arc::clone(&self.fallback),
                    default_timeout: self.config.stage_timeout(),
                    events: self.events.clone(),
                };
                let semaphore = Arc::clone(&semaphore);
                debug!(run_id = %run_id, stage_id = %id, "Launching stage");
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    task.drive().await
                });
                running.push(async move { (spec, handle.await) });
            }

            match running.next().await {
                Some((_, Ok(stage))) => {
                    terminal.insert(stage.id().to_string());
                    reports.insert(stage.id().to_string(), stage.into_report());
                }
                Some((spec, Err(join_error))) => {
                    error!(
                        run_id = %run_id,
                        stage_id = %spec.id,
                        error = %join_error,
                        "Stage task aborted"
                    );
                    let stage = Stage::abandoned(Arc::clone(&spec), join_error.to_string());
                    terminal.insert(spec.id.clone());
                    reports.insert(spec.id.clone(), stage.into_report());
                }
                None => break,
            }
        }

        if !pending.is_empty() {
            warn!(
                run_id = %run_id,
                unscheduled = ?pending.keys().collect::<Vec<_>>(),
                "Stages left unscheduled"
            );
        }

        let outputs = ctx.session().snapshot();
        ctx.session().close();

        let finished_at = Utc::now();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let statuses: BTreeMap<String, StageStatus> = reports
            .iter()
            .map(|(id, report)| (id.clone(), report.status))
            .collect();

        info!(
            run_id = %run_id,
            pipeline = graph.name(),
            elapsed_ms,
            statuses = ?statuses,
            "Pipeline run finished"
        );
        self.events.emit(RunEvent::RunFinished {
            run_id: run_id.clone(),
            pipeline: graph.name().to_string(),
            statuses,
            elapsed_ms,
        });

        Ok(RunResult {
            run_id,
            pipeline: graph.name().to_string(),
            outputs,
            stages: reports,
            started_at,
            finished_at,
            elapsed_ms,
        })
    }
}

/// Everything one spawned stage needs, owned
struct StageTask {
    spec: Arc<StageSpec>,
    ctx: RunContext,
    executor: Arc<DeterministicExecutor>,
    fallback: Arc<FallbackController>,
    default_timeout: Duration,
    events: EventBus,
}

impl StageTask {
    async fn drive(self) -> Stage {
        let run_id = self.ctx.run_id().clone();
        let mut stage = Stage::new(Arc::clone(&self.spec));
        self.events.emit(RunEvent::StageStarted {
            run_id: run_id.clone(),
            stage_id: stage.id().to_string(),
            at: Utc::now(),
        });

        let trace = match stage
            .execute(&self.ctx, Arc::clone(&self.executor), self.default_timeout)
            .await
        {
            Ok(trace) => trace,
            Err(err) => {
                error!(
                    run_id = %run_id,
                    stage_id = %stage.id(),
                    error = %err,
                    "Stage could not start"
                );
                return Stage::abandoned(Arc::clone(&self.spec), err.to_string());
            }
        };
        self.publish_calls(&trace);

        let verdict = Validator::validate(&stage, &trace);
        if let Err(err) = stage.apply_verification(verdict.clone()) {
            error!(
                run_id = %run_id,
                stage_id = %stage.id(),
                error = %err,
                "Verdict could not be applied"
            );
            return Stage::abandoned(Arc::clone(&self.spec), err.to_string());
        }

        if let Verification::Unverified { missing } = verdict {
            warn!(
                run_id = %run_id,
                stage_id = %stage.id(),
                missing = ?missing,
                "Delegate skipped required operations"
            );
            self.events.emit(RunEvent::StageUnverified {
                run_id: run_id.clone(),
                stage_id: stage.id().to_string(),
                missing: missing.clone(),
            });
            if let Err(err) = self.fallback.recover(&mut stage, &self.ctx, &missing).await {
                error!(
                    run_id = %run_id,
                    stage_id = %stage.id(),
                    error = %err,
                    "Recovery could not run"
                );
                return Stage::abandoned(Arc::clone(&self.spec), err.to_string());
            }
            if let Some(recovery) = stage.recovery_trace() {
                self.publish_calls(recovery);
            }
        }

        if let Some(result) = stage.result().cloned() {
            if let Err(err) = self
                .ctx
                .session()
                .put(&self.spec.output_key, stage.id(), result)
            {
                error!(
                    run_id = %run_id,
                    stage_id = %stage.id(),
                    output_key = %self.spec.output_key,
                    error = %err,
                    "Stage result not stored"
                );
                stage.set_store_error(&err);
            }
        }

        let report_status = stage.status();
        info!(run_id = %run_id, stage_id = %stage.id(), status = %report_status, "Stage finished");
        self.events.emit(RunEvent::StageFinished {
            run_id,
            stage_id: stage.id().to_string(),
            status: report_status,
            elapsed_ms: stage.elapsed_ms(),
        });
        stage
    }

    fn publish_calls(&self, trace: &Trace) {
        if self.events.subscriber_count() == 0 {
            return;
        }
        for call in &trace.calls {
            self.events.emit(RunEvent::OperationRecorded {
                run_id: self.ctx.run_id().clone(),
                stage_id: self.spec.id.clone(),
                call: call.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{FnProvider, Operation};
    use crate::pipeline::delegate::{Delegate, FnDelegate, Toolbox};
    use crate::pipeline::fallback::FieldMapping;
    use serde_json::{json, Map, Value};

    fn executor() -> Arc<DeterministicExecutor> {
        let registry = Arc::new(
            OperationRegistry::new()
                .with_operation(Operation::new("fetch", "Fetch"))
                .unwrap(),
        );
        Arc::new(
            DeterministicExecutor::new(registry)
                .with_provider("fetch", FnProvider::new(|_args| async { Ok(json!("data")) }))
                .unwrap(),
        )
    }

    fn coordinator() -> PipelineCoordinator {
        let executor = executor();
        let fallback = FallbackController::new(Arc::clone(&executor))
            .with_mapping(FieldMapping::new("fetch"));
        PipelineCoordinator::new(executor, fallback, EngineConfig::default()).unwrap()
    }

    fn fetcher() -> Arc<dyn Delegate> {
        Arc::new(FnDelegate::new("fetcher", |_ctx, tb: Toolbox| async move {
            tb.invoke("fetch", Map::new()).await.unwrap();
            Ok(None)
        }))
    }

    fn reader() -> Arc<dyn Delegate> {
        Arc::new(FnDelegate::new("reader", |ctx: RunContext, _tb| async move {
            Ok(Some(json!({ "saw": ctx.upstream("first").unwrap_or(Value::Null) })))
        }))
    }

    #[tokio::test]
    async fn test_sequential_stage_reads_upstream_output() {
        let coordinator = coordinator();
        let graph = PipelineGraph::build(
            "chain",
            vec![
                StageSpec::new("first", fetcher()).requires("fetch"),
                StageSpec::new("second", reader()).depends_on("first"),
            ],
            coordinator.registry(),
        )
        .unwrap();

        let result = coordinator
            .run(&graph, RunContext::new(Map::new()))
            .await
            .unwrap();
        assert_eq!(result.status("first"), Some(StageStatus::Verified));
        assert_eq!(result.output("first"), Some(&json!({"fetch": "data"})));
        assert_eq!(result.output("second"), Some(&json!({"saw": {"fetch": "data"}})));
    }

    #[tokio::test]
    async fn test_closed_session_aborts_before_any_stage() {
        let coordinator = coordinator();
        let graph = PipelineGraph::build(
            "one",
            vec![StageSpec::new("first", fetcher()).requires("fetch")],
            coordinator.registry(),
        )
        .unwrap();
        let ctx = RunContext::new(Map::new());
        coordinator.run(&graph, ctx.clone()).await.unwrap();

        let err = coordinator.run(&graph, ctx).await.unwrap_err();
        assert!(matches!(err, StagehandError::SessionUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let graph = PipelineGraph::build(
            "one",
            vec![StageSpec::new("first", fetcher()).requires("fetch")],
            coordinator.registry(),
        )
        .unwrap();
        coordinator
            .run(&graph, RunContext::new(Map::new()))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                RunEvent::RunStarted { .. } => "run_started",
                RunEvent::StageStarted { .. } => "stage_started",
                RunEvent::OperationRecorded { .. } => "operation_recorded",
                RunEvent::StageUnverified { .. } => "stage_unverified",
                RunEvent::StageFinished { .. } => "stage_finished",
                RunEvent::RunFinished { .. } => "run_finished",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "stage_started",
                "operation_recorded",
                "stage_finished",
                "run_finished"
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let executor = executor();
        let fallback = FallbackController::new(Arc::clone(&executor));
        let config = EngineConfig::default().with_max_parallel_stages(0);
        assert!(PipelineCoordinator::new(executor, fallback, config).is_err());
    }
}
