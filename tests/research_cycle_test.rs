//! 研究周期集成测试：准入、闸门、取消、恢复、并发隔离

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use research_cycle::admission::InMemoryBudgetTracker;
use research_cycle::checkpoint::{
    CheckpointKind, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore,
};
use research_cycle::config::AppConfig;
use research_cycle::core::{Phase, ResearchService, ResearchServiceBuilder, TriggerOptions};
use research_cycle::executors::{
    PhaseError, PhaseExecutor, PhaseExecutors, PhaseRequest, SimulatedExecutor,
};
use research_cycle::operations::{
    InMemoryOperationStore, OperationFilter, OperationId, OperationKind, OperationList,
    OperationMetadata, OperationRecord, OperationStatus, OperationStore, ParameterMap, Progress,
    StoreError,
};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(10);

fn fast() -> Arc<dyn PhaseExecutor> {
    Arc::new(SimulatedExecutor::new(Duration::ZERO))
}

fn slow() -> Arc<dyn PhaseExecutor> {
    Arc::new(SimulatedExecutor::new(Duration::from_secs(30)))
}

/// 第一次调用阻塞很久，之后立即完成
struct SlowOnce {
    calls: AtomicUsize,
    inner: SimulatedExecutor,
}

impl SlowOnce {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            inner: SimulatedExecutor::new(Duration::ZERO),
        }
    }
}

#[async_trait]
impl PhaseExecutor for SlowOnce {
    async fn run(&self, request: PhaseRequest) -> Result<ParameterMap, PhaseError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.run(request).await
    }
}

/// 第一次返回给定结果，之后按模拟执行器正常完成
struct FirstResult {
    calls: AtomicUsize,
    first: ParameterMap,
    inner: SimulatedExecutor,
}

impl FirstResult {
    fn new(first: serde_json::Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            first: first.as_object().cloned().unwrap(),
            inner: SimulatedExecutor::new(Duration::ZERO),
        }
    }
}

#[async_trait]
impl PhaseExecutor for FirstResult {
    async fn run(&self, request: PhaseRequest) -> Result<ParameterMap, PhaseError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(self.first.clone());
        }
        self.inner.run(request).await
    }
}

/// 创建指定类型的记录时先停顿，模拟阶段切换中途的慢存储
struct StallingStore {
    inner: InMemoryOperationStore,
    stall_kind: OperationKind,
    stall: Duration,
    stalled: AtomicBool,
}

impl StallingStore {
    fn new(stall_kind: OperationKind, stall: Duration) -> Self {
        Self {
            inner: InMemoryOperationStore::new(),
            stall_kind,
            stall,
            stalled: AtomicBool::new(false),
        }
    }

    fn has_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationStore for StallingStore {
    async fn create_operation(
        &self,
        kind: OperationKind,
        metadata: OperationMetadata,
        parent_id: Option<OperationId>,
    ) -> Result<OperationRecord, StoreError> {
        if kind == self.stall_kind && !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.create_operation(kind, metadata, parent_id).await
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>, StoreError> {
        self.inner.get_operation(id).await
    }

    async fn start_operation(&self, id: &str, token: CancellationToken) -> Result<(), StoreError> {
        self.inner.start_operation(id, token).await
    }

    async fn complete_operation(&self, id: &str, result: ParameterMap) -> Result<bool, StoreError> {
        self.inner.complete_operation(id, result).await
    }

    async fn fail_operation(&self, id: &str, error: &str) -> Result<bool, StoreError> {
        self.inner.fail_operation(id, error).await
    }

    async fn cancel_operation(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        self.inner.cancel_operation(id, reason).await
    }

    async fn update_progress(&self, id: &str, progress: Progress) -> Result<(), StoreError> {
        self.inner.update_progress(id, progress).await
    }

    async fn update_parameters(&self, id: &str, parameters: ParameterMap) -> Result<(), StoreError> {
        self.inner.update_parameters(id, parameters).await
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[OperationStatus],
        to: OperationStatus,
    ) -> Result<bool, StoreError> {
        self.inner.transition_status(id, from, to).await
    }

    async fn list_operations(&self, filter: &OperationFilter) -> Result<OperationList, StoreError> {
        self.inner.list_operations(filter).await
    }
}

struct Harness {
    service: Arc<ResearchService>,
    checkpoints: Arc<InMemoryCheckpointStore>,
}

async fn harness_with(
    executors: PhaseExecutors,
    config: AppConfig,
    budget: Option<Arc<InMemoryBudgetTracker>>,
) -> Harness {
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let mut builder = ResearchServiceBuilder::new(config)
        .with_executors(executors)
        .with_checkpoint_store(Some(checkpoints.clone()))
        .with_poll_interval(POLL);
    if let Some(budget) = budget {
        builder = builder.with_budget(budget);
    }
    Harness {
        service: Arc::new(builder.build().await.unwrap()),
        checkpoints,
    }
}

async fn harness(executors: PhaseExecutors) -> Harness {
    harness_with(executors, AppConfig::default(), None).await
}

async fn trigger(service: &ResearchService) -> String {
    let response = service.trigger(TriggerOptions::default()).await.unwrap();
    assert!(response.triggered, "trigger rejected: {response:?}");
    response.operation_id.unwrap()
}

async fn record(service: &ResearchService, id: &str) -> OperationRecord {
    service.store().get_operation(id).await.unwrap().unwrap()
}

/// 轮询直到记录满足条件，超时则失败
async fn wait_until<F>(service: &ResearchService, id: &str, timeout: Duration, pred: F) -> OperationRecord
where
    F: Fn(&OperationRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let r = record(service, id).await;
        if pred(&r) {
            return r;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on {id}: status={:?} params={:?}",
            r.status,
            r.metadata.parameters
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_phase(service: &ResearchService, id: &str, phase: Phase) {
    wait_until(service, id, Duration::from_secs(5), |r| {
        r.metadata.parameters.get("phase") == Some(&json!(phase.as_str()))
    })
    .await;
}

async fn wait_terminal(service: &ResearchService, id: &str) -> OperationRecord {
    wait_until(service, id, Duration::from_secs(5), |r| r.status.is_terminal()).await
}

/// 等待协调器空闲退出，避免与进行中的 tick 交错
async fn wait_idle(service: &ResearchService) {
    for _ in 0..500 {
        if !service.coordinator().is_running().await {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("coordinator did not go idle");
}

#[tokio::test]
async fn test_budget_exhausted_creates_no_record() {
    let budget = Arc::new(InMemoryBudgetTracker::with_spent(10.0, 10.0));
    let h = harness_with(
        PhaseExecutors::uniform(fast()),
        AppConfig::default(),
        Some(budget),
    )
    .await;

    let response = h.service.trigger(TriggerOptions::default()).await.unwrap();
    assert!(!response.triggered);
    assert_eq!(response.reason.as_deref(), Some("budget_exhausted"));
    assert!(response.operation_id.is_none());

    let all = h
        .service
        .store()
        .list_operations(&OperationFilter::default())
        .await
        .unwrap();
    assert_eq!(all.total, 0);
    assert!(!h.service.coordinator().is_running().await);
}

#[tokio::test]
async fn test_at_capacity_rejects_with_counts() {
    let mut config = AppConfig::default();
    config.admission.max_concurrent_researches = Some(2);
    let h = harness_with(PhaseExecutors::uniform(slow()), config, None).await;

    trigger(&h.service).await;
    trigger(&h.service).await;

    let response = h.service.trigger(TriggerOptions::default()).await.unwrap();
    assert!(!response.triggered);
    assert_eq!(response.reason.as_deref(), Some("at_capacity"));
    assert_eq!(response.active_count, Some(2));
    assert_eq!(response.limit, Some(2));

    let research = h
        .service
        .store()
        .list_operations(&OperationFilter::research())
        .await
        .unwrap();
    assert_eq!(research.total, 2);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_full_cycle_completes_and_deletes_checkpoint() {
    let h = harness(PhaseExecutors::uniform(fast())).await;
    let id = trigger(&h.service).await;

    let done = wait_terminal(&h.service, &id).await;
    assert_eq!(done.status, OperationStatus::Completed);
    assert_eq!(done.progress.percentage, 100.0);
    assert_eq!(done.metadata.parameters.get("phase"), Some(&json!("completed")));

    let summary = done.result_summary.unwrap();
    assert_eq!(summary.get("verdict"), Some(&json!("promising")));
    assert!(summary.get("strategy_name").and_then(|v| v.as_str()).is_some());

    let children = h
        .service
        .store()
        .list_operations(&OperationFilter {
            parent_id: Some(id.clone()),
            ..OperationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(children.total, 4);
    assert!(children.items.iter().all(|c| c.status == OperationStatus::Completed));
    assert!(h.checkpoints.load_checkpoint(&id).await.unwrap().is_none());

    // 空闲后协调器退出，status 报告上一个周期
    wait_idle(&h.service).await;
    let status = h.service.status().await.unwrap();
    assert!(status.active.is_empty());
    assert!(!status.coordinator_running);
    let last = status.last_cycle.unwrap();
    assert_eq!(last.operation_id, id);
    assert_eq!(last.status, OperationStatus::Completed);
    assert!((status.budget.spent_usd - 0.03).abs() < 1e-6);
}

#[tokio::test]
async fn test_training_gate_failure_never_starts_backtest() {
    let bad_training: Arc<dyn PhaseExecutor> = Arc::new(
        SimulatedExecutor::new(Duration::ZERO).with_result(
            json!({ "test_accuracy": 0.30, "test_loss": 0.5 })
                .as_object()
                .cloned()
                .unwrap(),
        ),
    );
    let h = harness(PhaseExecutors::new(fast(), bad_training, fast(), fast())).await;
    let id = trigger(&h.service).await;

    let failed = wait_terminal(&h.service, &id).await;
    assert_eq!(failed.status, OperationStatus::Failed);
    let error = failed.error.unwrap();
    assert!(error.starts_with("training gate failed"), "{error}");
    assert!(error.contains("accuracy_below_threshold (30% < 45%)"));
    assert!(failed.metadata.parameters.get("backtest_op_id").is_none());
    assert!(failed.metadata.parameters.get("training_op_id").is_some());

    let checkpoint = h.checkpoints.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::Failure);
    assert_eq!(checkpoint.state.phase, "training");
    assert!(checkpoint.state.backtest_operation_id.is_none());

    let backtests = h
        .service
        .store()
        .list_operations(&OperationFilter {
            kind: Some(OperationKind::Backtest),
            ..OperationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(backtests.total, 0);
}

#[tokio::test]
async fn test_child_failure_fails_research() {
    let broken: Arc<dyn PhaseExecutor> =
        Arc::new(SimulatedExecutor::new(Duration::ZERO).failing("backtest engine crashed"));
    let h = harness(PhaseExecutors::new(fast(), fast(), broken, fast())).await;
    let id = trigger(&h.service).await;

    let failed = wait_terminal(&h.service, &id).await;
    assert_eq!(failed.status, OperationStatus::Failed);
    assert!(failed.error.unwrap().contains("backtest engine crashed"));
    let checkpoint = h.checkpoints.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.state.phase, "backtesting");
}

#[tokio::test]
async fn test_cancel_during_training() {
    let h = harness(PhaseExecutors::new(fast(), slow(), fast(), fast())).await;
    let id = trigger(&h.service).await;
    wait_for_phase(&h.service, &id, Phase::Training).await;
    let training_id = record(&h.service, &id)
        .await
        .metadata
        .parameters
        .get("training_op_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap();

    let response = h.service.cancel(&id).await.unwrap();
    assert!(response.success);
    assert_eq!(response.child_cancelled.as_deref(), Some(training_id.as_str()));

    let cancelled = wait_until(&h.service, &id, Duration::from_millis(500), |r| {
        r.status == OperationStatus::Cancelled
    })
    .await;
    assert_eq!(cancelled.metadata.parameters.get("phase"), Some(&json!("training")));
    assert_eq!(h.service.phase(&id).await.unwrap(), Some(Phase::Training));
    assert_eq!(record(&h.service, &training_id).await.status, OperationStatus::Cancelled);

    let checkpoint = h.checkpoints.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::Cancellation);
    assert_eq!(checkpoint.state.phase, "training");

    // 再次取消被拒绝；新的 trigger 成功
    let again = h.service.cancel(&id).await.unwrap();
    assert!(!again.success);
    assert_eq!(again.reason.as_deref(), Some("not_cancellable"));
    trigger(&h.service).await;
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_one_of_three_leaves_others_running() {
    let h = harness(PhaseExecutors::uniform(Arc::new(SimulatedExecutor::new(
        Duration::from_millis(30),
    ))))
    .await;

    let a = trigger(&h.service).await;
    let b = trigger(&h.service).await;
    let c = trigger(&h.service).await;

    let response = h.service.cancel(&b).await.unwrap();
    assert!(response.success);

    let a = wait_terminal(&h.service, &a).await;
    let c = wait_terminal(&h.service, &c).await;
    assert_eq!(a.status, OperationStatus::Completed);
    assert_eq!(c.status, OperationStatus::Completed);
    assert_eq!(record(&h.service, &b).await.status, OperationStatus::Cancelled);
}

#[tokio::test]
async fn test_resume_after_cancel_restarts_phase() {
    let training: Arc<dyn PhaseExecutor> = Arc::new(SlowOnce::new());
    let h = harness(PhaseExecutors::new(fast(), training, fast(), fast())).await;
    let id = trigger(&h.service).await;
    wait_for_phase(&h.service, &id, Phase::Training).await;

    let before = record(&h.service, &id).await;
    let design_id = before.metadata.parameters.get("design_op_id").cloned().unwrap();
    let old_training = before.metadata.parameters.get("training_op_id").cloned().unwrap();

    assert!(h.service.cancel(&id).await.unwrap().success);
    wait_terminal(&h.service, &id).await;
    wait_idle(&h.service).await;

    let resumed = h.service.resume(&id).await.unwrap();
    assert!(resumed.success, "{resumed:?}");
    assert_eq!(resumed.resumed_from_phase.as_deref(), Some("training"));
    assert!(resumed
        .recovered_child_ids
        .iter()
        .any(|c| Some(c.as_str()) == design_id.as_str()));
    assert!(!resumed
        .recovered_child_ids
        .iter()
        .any(|c| Some(c.as_str()) == old_training.as_str()));

    let done = wait_terminal(&h.service, &id).await;
    assert_eq!(done.status, OperationStatus::Completed);
    assert_eq!(done.metadata.parameters.get("design_op_id"), Some(&design_id));
    assert_ne!(done.metadata.parameters.get("training_op_id"), Some(&old_training));
    assert!(h.checkpoints.load_checkpoint(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_rejections() {
    let h = harness(PhaseExecutors::uniform(slow())).await;

    let missing = h.service.resume("op_missing").await.unwrap();
    assert_eq!(missing.reason.as_deref(), Some("not_found"));

    // 失败但没有检查点
    let orphan = h
        .service
        .store()
        .create_operation(OperationKind::Research, OperationMetadata::default(), None)
        .await
        .unwrap();
    h.service.store().fail_operation(&orphan.id, "lost").await.unwrap();
    let no_checkpoint = h.service.resume(&orphan.id).await.unwrap();
    assert_eq!(no_checkpoint.reason.as_deref(), Some("no_checkpoint"));

    let running = trigger(&h.service).await;
    let not_resumable = h.service.resume(&running).await.unwrap();
    assert_eq!(not_resumable.reason.as_deref(), Some("not_resumable"));

    let blocked = h.service.resume(&orphan.id).await.unwrap();
    assert_eq!(blocked.reason.as_deref(), Some("active_cycle_exists"));
    assert_eq!(record(&h.service, &orphan.id).await.status, OperationStatus::Failed);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_checkpoint_roundtrip_through_resume() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(SqliteCheckpointStore::open(dir.path().join("checkpoints.db")).unwrap());

    // 第一次回测未过闸门，恢复后重跑回测并通过
    let backtest: Arc<dyn PhaseExecutor> = Arc::new(FirstResult::new(json!({
        "win_rate": 0.30,
        "max_drawdown_pct": 0.1,
        "sharpe_ratio": 1.0,
        "input_tokens": 1000,
    })));
    let service = ResearchServiceBuilder::new(AppConfig::default())
        .with_executors(PhaseExecutors::new(fast(), fast(), backtest, fast()))
        .with_checkpoint_store(Some(checkpoints.clone()))
        .with_poll_interval(POLL)
        .build()
        .await
        .unwrap();

    let id = trigger(&service).await;
    let failed = wait_terminal(&service, &id).await;
    assert_eq!(failed.status, OperationStatus::Failed);
    assert!(failed.error.unwrap().starts_with("backtest gate failed: win_rate_below_threshold"));
    let failed_backtest = failed.metadata.parameters.get("backtest_op_id").cloned().unwrap();

    let checkpoint = checkpoints.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::Failure);
    assert_eq!(checkpoint.state.phase, "backtesting");
    assert_eq!(
        checkpoint.state.strategy_name.as_deref(),
        failed.metadata.parameters.get("strategy_name").and_then(|v| v.as_str())
    );
    // 设计 1500 + 未过闸门的回测 1000
    assert_eq!(checkpoint.state.token_counts.input_tokens, 2500);
    wait_idle(&service).await;

    let resumed = service.resume(&id).await.unwrap();
    assert!(resumed.success, "{resumed:?}");
    assert_eq!(resumed.resumed_from_phase.as_deref(), Some("backtesting"));
    assert!(!resumed
        .recovered_child_ids
        .iter()
        .any(|c| Some(c.as_str()) == failed_backtest.as_str()));

    let done = wait_terminal(&service, &id).await;
    assert_eq!(done.status, OperationStatus::Completed);
    assert_ne!(done.metadata.parameters.get("backtest_op_id"), Some(&failed_backtest));
    // 正常周期 3050 + 失败回测 1000，每个子任务只计一次
    let summary = done.result_summary.unwrap();
    assert_eq!(summary.get("total_tokens"), Some(&json!(4050)));
    assert!(checkpoints.load_checkpoint(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_while_next_phase_is_being_created() {
    let store = Arc::new(StallingStore::new(
        OperationKind::Training,
        Duration::from_millis(200),
    ));
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let service = ResearchServiceBuilder::new(AppConfig::default())
        .with_executors(PhaseExecutors::new(fast(), slow(), fast(), fast()))
        .with_operation_store(store.clone())
        .with_checkpoint_store(Some(checkpoints.clone()))
        .with_poll_interval(POLL)
        .build()
        .await
        .unwrap();

    let id = trigger(&service).await;
    for _ in 0..500 {
        if store.has_stalled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(store.has_stalled());

    let response = service.cancel(&id).await.unwrap();
    assert!(response.success);

    // 停顿结束后，新建的训练子任务不能在已取消的父记录下运行
    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_idle(&service).await;

    let parent = record(&service, &id).await;
    assert_eq!(parent.status, OperationStatus::Cancelled);
    assert!(parent.metadata.parameters.get("training_op_id").is_none());

    let children = service
        .store()
        .list_operations(&OperationFilter {
            parent_id: Some(id.clone()),
            ..OperationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(children.active_count, 0);
    let training: Vec<_> = children
        .items
        .iter()
        .filter(|c| c.kind == OperationKind::Training)
        .collect();
    assert_eq!(training.len(), 1);
    assert_eq!(training[0].status, OperationStatus::Cancelled);

    let checkpoint = checkpoints.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::Cancellation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_resume_only_one_wins() {
    let h = harness(PhaseExecutors::new(fast(), slow(), fast(), fast())).await;
    let id = trigger(&h.service).await;
    wait_for_phase(&h.service, &id, Phase::Training).await;
    assert!(h.service.cancel(&id).await.unwrap().success);
    wait_idle(&h.service).await;

    let (a, b) = tokio::join!(h.service.resume(&id), h.service.resume(&id));
    let responses = [a.unwrap(), b.unwrap()];
    assert_eq!(responses.iter().filter(|r| r.success).count(), 1, "{responses:?}");
    let loser = responses.iter().find(|r| !r.success).unwrap();
    assert!(
        matches!(
            loser.reason.as_deref(),
            Some("not_resumable") | Some("active_cycle_exists")
        ),
        "{loser:?}"
    );
    assert_eq!(record(&h.service, &id).await.status, OperationStatus::Running);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_resume_record_left_in_resuming() {
    let h = harness(PhaseExecutors::new(fast(), slow(), fast(), fast())).await;
    let id = trigger(&h.service).await;
    wait_for_phase(&h.service, &id, Phase::Training).await;
    assert!(h.service.cancel(&id).await.unwrap().success);
    wait_idle(&h.service).await;

    // 上一次恢复在加锁后中断
    assert!(h
        .service
        .store()
        .transition_status(&id, &[OperationStatus::Cancelled], OperationStatus::Resuming)
        .await
        .unwrap());

    let resumed = h.service.resume(&id).await.unwrap();
    assert!(resumed.success, "{resumed:?}");
    assert_eq!(resumed.resumed_from_phase.as_deref(), Some("training"));
    assert_eq!(record(&h.service, &id).await.status, OperationStatus::Running);
    h.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_respect_capacity() {
    let mut config = AppConfig::default();
    config.admission.max_concurrent_researches = Some(1);
    let h = harness_with(PhaseExecutors::uniform(slow()), config, None).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            service.trigger(TriggerOptions::default()).await.unwrap()
        }));
    }
    let mut admitted = 0;
    for task in tasks {
        let response = task.await.unwrap();
        if response.triggered {
            admitted += 1;
        } else {
            assert_eq!(response.reason.as_deref(), Some("at_capacity"));
        }
    }
    assert_eq!(admitted, 1);

    let research = h
        .service
        .store()
        .list_operations(&OperationFilter::research())
        .await
        .unwrap();
    assert_eq!(research.total, 1);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_startup_scan_picks_up_active_records() {
    let h = harness(PhaseExecutors::uniform(fast())).await;
    let pending = h
        .service
        .store()
        .create_operation(
            OperationKind::Research,
            OperationMetadata::with_parameters(
                json!({ "phase": "idle", "model": "lstm" }).as_object().cloned().unwrap(),
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.service.start().await.unwrap(), 1);
    let done = wait_terminal(&h.service, &pending.id).await;
    assert_eq!(done.status, OperationStatus::Completed);
    assert_eq!(done.result_summary.unwrap().get("model"), Some(&json!("lstm")));
}
