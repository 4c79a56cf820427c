//! `Dispatcher`: the agent's core loop. Applies admission control to
//! `AssignWork` frames, runs admitted work under a `MaxParallel`-wide
//! `Semaphore`, and reports status, results, and recovered orphans back
//! through the `Reporter`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::error::AgentResult;
use crate::domain::models::{
    ActiveRun, AdmissionDecision, AgentStatus, Config, ExecutionType, JournalStatus, RunSummary, WorkAssignment,
};
use crate::domain::ports::{
    AgentMessage, BlobStore, ControlMessage, Executor, ExecutionRequest, RepoCache, ResourceMonitor, SecretResolver,
    Session, StateJournal,
};

use super::reporter::{derive_run_status, Reporter};

/// The concrete adapter set a `Dispatcher` is wired against. Built once by
/// `infrastructure::setup` and moved in.
pub struct Executors {
    pub subprocess: Arc<dyn Executor>,
    pub container: Option<Arc<dyn Executor>>,
}

/// Builds a fresh `BlobStore` for one run. Artifact uploads are
/// per-run-scoped (the concrete `HttpBlobStore` bakes the run id into its
/// upload path), so the dispatcher asks for one lazily rather than holding a
/// single shared instance.
pub trait BlobStoreFactory: Send + Sync {
    fn for_run(&self, run_id: &str) -> Arc<dyn BlobStore>;
}

pub struct Dispatcher {
    config: Arc<Config>,
    session: Arc<dyn Session>,
    reporter: Arc<Reporter>,
    executors: Executors,
    repo_cache: Arc<dyn RepoCache>,
    secrets: Arc<dyn SecretResolver>,
    journal: Arc<dyn StateJournal>,
    resource_monitor: Arc<dyn ResourceMonitor>,
    blob_store_factory: Arc<dyn BlobStoreFactory>,
    active_runs: RwLock<HashMap<String, ActiveRun>>,
    capacity: Semaphore,
    draining: AtomicBool,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        session: Arc<dyn Session>,
        reporter: Arc<Reporter>,
        executors: Executors,
        repo_cache: Arc<dyn RepoCache>,
        secrets: Arc<dyn SecretResolver>,
        journal: Arc<dyn StateJournal>,
        resource_monitor: Arc<dyn ResourceMonitor>,
        blob_store_factory: Arc<dyn BlobStoreFactory>,
    ) -> Self {
        let capacity = Semaphore::new(config.max_parallel as usize);
        Self {
            config,
            session,
            reporter,
            executors,
            repo_cache,
            secrets,
            journal,
            resource_monitor,
            blob_store_factory,
            active_runs: RwLock::new(HashMap::new()),
            capacity,
            draining: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn status(&self) -> AgentStatus {
        if self.draining.load(Ordering::SeqCst) {
            return AgentStatus::Draining;
        }
        if self.active_runs.read().await.is_empty() {
            AgentStatus::Idle
        } else {
            AgentStatus::Busy
        }
    }

    pub async fn active_run_ids(&self) -> Vec<String> {
        self.active_runs.read().await.keys().cloned().collect()
    }

    /// Reports every journal row found at startup as an orphaned run, then
    /// deletes it. There is no way to know whether the process that owned it
    /// actually finished, so every row is treated as lost.
    pub async fn recover_orphans(&self) -> AgentResult<()> {
        let pending = self.journal.get_pending().await?;
        for entry in pending {
            warn!(run_id = %entry.run_id, "recovering orphaned run from journal");
            self.reporter
                .run_complete(
                    &entry.run_id,
                    crate::domain::models::RunStatus::Error,
                    RunSummary::default(),
                    Some("agent restarted during execution".to_string()),
                )
                .await;
            self.journal.delete(&entry.run_id).await?;
        }
        Ok(())
    }

    /// Admission control: draining, validation, `MaxParallel` capacity, and
    /// the resource monitor's predicate, in that order. The first violated
    /// gate wins and determines `temporary`.
    async fn admit(&self, assignment: &WorkAssignment) -> AdmissionDecision {
        if self.draining.load(Ordering::SeqCst) {
            return AdmissionDecision::Rejected { reason: "agent is draining".to_string(), temporary: true };
        }
        if let Err(reason) = assignment.validate() {
            return AdmissionDecision::Rejected { reason, temporary: false };
        }
        if matches!(assignment.execution_type, ExecutionType::Container) && self.executors.container.is_none() {
            return AdmissionDecision::Rejected {
                reason: "agent has no container executor configured".to_string(),
                temporary: false,
            };
        }
        if self.capacity.available_permits() == 0 {
            return AdmissionDecision::Rejected { reason: "agent is at max_parallel capacity".to_string(), temporary: true };
        }
        if !self.resource_monitor.can_accept_work() {
            return AdmissionDecision::Rejected {
                reason: "host resource thresholds exceeded".to_string(),
                temporary: true,
            };
        }
        AdmissionDecision::Accepted
    }

    /// Top-level message handler: admits or rejects `AssignWork`, routes
    /// `CancelWork`/`Drain` to the relevant cancellation tokens.
    #[instrument(skip(dispatcher, message))]
    pub async fn handle_control_message(dispatcher: &Arc<Self>, message: ControlMessage) {
        match message {
            ControlMessage::RegisterResponse { .. } | ControlMessage::Ack { .. } => {}
            ControlMessage::AssignWork(assignment) => {
                let run_id = assignment.run_id.clone();
                match dispatcher.admit(&assignment).await {
                    AdmissionDecision::Accepted => {
                        if let Err(err) = dispatcher.session.send(AgentMessage::WorkAccepted { run_id: run_id.clone() }).await {
                            warn!(run_id, error = %err, "failed to send WorkAccepted");
                        }
                        Self::spawn_run(dispatcher, *assignment);
                    }
                    AdmissionDecision::Rejected { reason, temporary } => {
                        info!(run_id, reason, temporary, "rejecting work at admission");
                        if let Err(err) = dispatcher
                            .session
                            .send(AgentMessage::WorkRejected { run_id, reason, temporary })
                            .await
                        {
                            warn!(error = %err, "failed to send WorkRejected");
                        }
                    }
                }
            }
            ControlMessage::CancelWork { run_id, reason } => {
                if let Some(run) = dispatcher.active_runs.read().await.get(&run_id) {
                    info!(run_id, reason, "cancelling run on request");
                    run.cancel.cancel();
                } else {
                    warn!(run_id, "CancelWork for unknown run_id");
                }
            }
            ControlMessage::Drain { reason, cancel_active } => {
                info!(reason, cancel_active, "entering drain mode");
                dispatcher.draining.store(true, Ordering::SeqCst);
                if cancel_active {
                    for run in dispatcher.active_runs.read().await.values() {
                        run.cancel.cancel();
                    }
                }
            }
        }
    }

    fn spawn_run(dispatcher: &Arc<Self>, assignment: WorkAssignment) {
        let dispatcher = Arc::clone(dispatcher);
        tokio::spawn(async move {
            dispatcher.run_one(assignment).await;
        });
    }

    #[instrument(skip(self, assignment), fields(run_id = %assignment.run_id))]
    async fn run_one(self: Arc<Self>, assignment: WorkAssignment) {
        let Ok(permit) = self.capacity.acquire().await else {
            return;
        };

        let run_id = assignment.run_id.clone();
        let cancel = self.shutdown.child_token();
        let workspace_id = format!("{run_id}-{}", rand_suffix());
        let workspace = self.config.directories.workspace_dir.join(&workspace_id);

        {
            let mut active = self.active_runs.write().await;
            active.insert(
                run_id.clone(),
                ActiveRun {
                    assignment: assignment.clone(),
                    started_at: chrono::Utc::now(),
                    cancel: cancel.clone(),
                    executor_kind: assignment.execution_type,
                    workspace_id: workspace_id.clone(),
                },
            );
        }

        if let Err(err) = self.journal.save(&run_id, JournalStatus::Running, &assignment).await {
            warn!(run_id, error = %err, "failed to persist journal entry");
        }

        let outcome = self.execute_assignment(&assignment, &workspace, cancel.clone()).await;

        if let Err(err) = self.journal.delete(&run_id).await {
            warn!(run_id, error = %err, "failed to delete journal entry after completion");
        }
        self.active_runs.write().await.remove(&run_id);

        let (status, summary, error) = outcome;
        self.reporter.run_complete(&run_id, status, summary, error).await;

        if let Err(err) = tokio::fs::remove_dir_all(&workspace).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(run_id, error = %err, "failed to clean up workspace directory");
            }
        }

        drop(permit);
    }

    async fn execute_assignment(
        &self,
        assignment: &WorkAssignment,
        workspace: &std::path::Path,
        cancel: CancellationToken,
    ) -> (crate::domain::models::RunStatus, RunSummary, Option<String>) {
        let run_reporter = self.reporter.handle_for(assignment.run_id.clone());

        if let Err(err) = self.repo_cache.materialize(&assignment.git_ref, workspace).await {
            warn!(run_id = %assignment.run_id, error = %err, "failed to materialize workspace");
            return (crate::domain::models::RunStatus::Error, RunSummary::default(), Some(err.to_string()));
        }

        let mut environment = assignment.environment.clone();
        match self.secrets.resolve(&assignment.secrets).await {
            Ok(resolved) => environment.extend(resolved),
            Err(err) => {
                warn!(run_id = %assignment.run_id, error = %err, "failed to resolve secrets");
                return (crate::domain::models::RunStatus::Error, RunSummary::default(), Some(err.to_string()));
            }
        }

        let executor = match assignment.execution_type {
            ExecutionType::Subprocess => &self.executors.subprocess,
            ExecutionType::Container => self
                .executors
                .container
                .as_ref()
                .expect("admission rejects container work with no container executor"),
        };

        let request = ExecutionRequest {
            run_id: assignment.run_id.clone(),
            workspace: workspace.to_path_buf(),
            working_directory: assignment.working_directory.clone(),
            setup_commands: assignment.setup_commands.clone(),
            teardown_commands: assignment.teardown_commands.clone(),
            tests: assignment.tests.clone(),
            environment,
            default_timeout: self.config.timers.default_timeout,
            container_image: assignment.container_image.clone(),
        };

        let deadline = assignment.deadline;
        let (execution, timed_out) = match deadline {
            Some(deadline) => {
                tokio::select! {
                    result = executor.execute(request, &run_reporter, cancel.clone()) => (result, false),
                    () = tokio::time::sleep(deadline) => {
                        cancel.cancel();
                        (Err(crate::domain::error::AgentError::Timeout), true)
                    }
                }
            }
            None => (executor.execute(request, &run_reporter, cancel.clone()).await, false),
        };

        let cancelled = cancel.is_cancelled() && !timed_out;

        match execution {
            Ok(result) => {
                let blob_store = self.blob_store_factory.for_run(&assignment.run_id);
                self.reporter.upload_artifacts(workspace, &assignment.tests, blob_store.as_ref()).await;
                let status = derive_run_status(&result, cancelled, timed_out);
                (status, result.summary, result.error)
            }
            Err(err) if timed_out => (crate::domain::models::RunStatus::Timeout, RunSummary::default(), Some(err.to_string())),
            Err(err) => (crate::domain::models::RunStatus::Error, RunSummary::default(), Some(err.to_string())),
        }
    }

    /// Heartbeats every `default_interval` until `shutdown` fires, carrying
    /// the derived status, active run ids, and latest resource sample. If
    /// the control plane negotiated a different interval in its
    /// `RegisterResponse`, that value supersedes `default_interval` as soon
    /// as it's observed, and again whenever it changes across a reconnect.
    pub async fn run_heartbeat_loop(self: Arc<Self>, default_interval: Duration, shutdown: CancellationToken) {
        let mut current_interval =
            self.session.negotiated_heartbeat_interval().await.unwrap_or(default_interval);
        let mut ticker = tokio::time::interval(current_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let heartbeat = AgentMessage::Heartbeat {
                        status: self.status().await,
                        active_run_ids: self.active_run_ids().await,
                        resource_usage: self.resource_monitor.current(),
                    };
                    if let Err(err) = self.session.send(heartbeat).await {
                        warn!(error = %err, "failed to send heartbeat");
                    }

                    let negotiated = self.session.negotiated_heartbeat_interval().await.unwrap_or(default_interval);
                    if negotiated != current_interval {
                        current_interval = negotiated;
                        ticker = tokio::time::interval(current_interval);
                    }
                }
                () = shutdown.cancelled() => return,
            }
        }
    }

    /// Periodically purges stale `RepoCache` mirrors.
    pub async fn run_cache_cleanup_loop(self: Arc<Self>, interval: Duration, max_age: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.repo_cache.cleanup(max_age).await {
                        Ok(removed) if removed > 0 => info!(removed, "purged stale repo cache mirrors"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "repo cache cleanup failed"),
                    }
                }
                () = shutdown.cancelled() => return,
            }
        }
    }

    /// Main control loop: pumps `Session::recv` until the stream ends or
    /// `shutdown_token()` fires, then waits for every active run to drain.
    pub async fn run(self: Arc<Self>) -> AgentResult<()> {
        loop {
            tokio::select! {
                message = self.session.recv() => {
                    match message? {
                        Some(message) => Self::handle_control_message(&self, message).await,
                        None => {
                            info!("control-plane session ended");
                            break;
                        }
                    }
                }
                () = self.shutdown.cancelled() => {
                    info!("shutdown requested, draining active runs");
                    break;
                }
            }
        }

        self.draining.store(true, Ordering::SeqCst);
        for run in self.active_runs.read().await.values() {
            run.cancel.cancel();
        }
        let _ = self.capacity.acquire_many(self.config.max_parallel).await;
        Ok(())
    }
}

fn rand_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex as TokioMutex};

    use crate::domain::models::{
        AdmissionThresholds, AmbientConfig, CapabilityConfig, Directories, Endpoint, ExecutorSelection, GitRef,
        Identity, JournalEntry, LogFormat, LogLevel, ResourceSample, ResultEventPayload, RunStatus,
        SecretProviderConfig, Timers, TlsConfig,
    };

    struct FakeSession {
        inbound: TokioMutex<mpsc::Receiver<ControlMessage>>,
        outbound: mpsc::Sender<AgentMessage>,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn send(&self, message: AgentMessage) -> AgentResult<()> {
            let _ = self.outbound.send(message).await;
            Ok(())
        }

        async fn recv(&self) -> AgentResult<Option<ControlMessage>> {
            Ok(self.inbound.lock().await.recv().await)
        }
    }

    /// Blocks until cancelled, then reports as cancelled work. Lets tests
    /// hold a run "active" for as long as they need before tearing it down.
    struct CancellableExecutor;

    #[async_trait]
    impl Executor for CancellableExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            _reporter: &dyn RunReporter,
            cancel: CancellationToken,
        ) -> AgentResult<crate::domain::models::ExecutionResult> {
            cancel.cancelled().await;
            Ok(crate::domain::models::ExecutionResult { outcomes: vec![], summary: RunSummary::default(), error: None })
        }
    }

    struct NoopRepoCache;
    #[async_trait]
    impl RepoCache for NoopRepoCache {
        async fn materialize(&self, _git_ref: &GitRef, _dest: &Path) -> AgentResult<()> {
            Ok(())
        }
        async fn cleanup(&self, _max_age: Duration) -> AgentResult<usize> {
            Ok(0)
        }
    }

    struct NoopSecretResolver;
    #[async_trait]
    impl SecretResolver for NoopSecretResolver {
        async fn resolve(&self, _references: &[String]) -> AgentResult<StdHashMap<String, String>> {
            Ok(StdHashMap::new())
        }
    }

    /// In-memory `StateJournal` double so recovery tests can seed pending
    /// rows without touching SQLite.
    #[derive(Default)]
    struct FakeJournal {
        rows: TokioMutex<StdHashMap<String, JournalEntry>>,
    }

    #[async_trait]
    impl StateJournal for FakeJournal {
        async fn save(&self, run_id: &str, status: JournalStatus, assignment: &WorkAssignment) -> AgentResult<()> {
            self.rows.lock().await.insert(
                run_id.to_string(),
                JournalEntry {
                    run_id: run_id.to_string(),
                    status,
                    assignment: assignment.clone(),
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                },
            );
            Ok(())
        }

        async fn delete(&self, run_id: &str) -> AgentResult<()> {
            self.rows.lock().await.remove(run_id);
            Ok(())
        }

        async fn get_pending(&self) -> AgentResult<Vec<JournalEntry>> {
            Ok(self.rows.lock().await.values().cloned().collect())
        }
    }

    struct FakeResourceMonitor {
        can_accept: StdAtomicBool,
    }
    impl ResourceMonitor for FakeResourceMonitor {
        fn current(&self) -> ResourceSample {
            ResourceSample::default()
        }
        fn can_accept_work(&self) -> bool {
            self.can_accept.load(Ordering::SeqCst)
        }
    }

    struct FakeBlobStore;
    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn put(&self, key: &str, _path: &Path) -> AgentResult<crate::domain::models::ArtifactMetadata> {
            Ok(crate::domain::models::ArtifactMetadata {
                name: key.to_string(),
                path: key.to_string(),
                size_bytes: 0,
                content_type: "application/octet-stream".to_string(),
                sha256: String::new(),
            })
        }
    }

    struct FakeBlobStoreFactory;
    impl BlobStoreFactory for FakeBlobStoreFactory {
        fn for_run(&self, _run_id: &str) -> Arc<dyn BlobStore> {
            Arc::new(FakeBlobStore)
        }
    }

    fn test_config(max_parallel: u32, workspace_dir: std::path::PathBuf) -> Arc<Config> {
        Arc::new(Config {
            identity: Identity { agent_id: "agent-1".to_string(), name: "agent-1".to_string() },
            endpoint: Endpoint { control_plane_url: "https://control.example.com".to_string(), token: "t".to_string() },
            tls: TlsConfig::default(),
            capabilities: CapabilityConfig::default(),
            max_parallel,
            directories: Directories { workspace_dir, cache_dir: PathBuf::new(), state_dir: PathBuf::new() },
            timers: Timers {
                heartbeat_interval: Duration::from_secs(30),
                reconnect_min_interval: Duration::from_secs(1),
                reconnect_max_interval: Duration::from_secs(30),
                default_timeout: Duration::from_secs(30),
                resource_check_interval: Duration::from_secs(5),
            },
            admission: AdmissionThresholds { cpu_percent: 90.0, memory_percent: 90.0, disk_percent: 90.0 },
            executor: ExecutorSelection::SubprocessOnly,
            secrets: SecretProviderConfig::None,
            ambient: AmbientConfig { log_level: LogLevel::Info, log_format: LogFormat::Json },
        })
    }

    fn test_assignment(run_id: &str) -> WorkAssignment {
        WorkAssignment {
            run_id: run_id.to_string(),
            execution_type: ExecutionType::Subprocess,
            git_ref: GitRef::default(),
            tests: vec![],
            setup_commands: vec![],
            teardown_commands: vec![],
            environment: StdHashMap::new(),
            secrets: vec![],
            container_image: None,
            working_directory: None,
            deadline: None,
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_dispatcher(
        max_parallel: u32,
        can_accept: bool,
    ) -> (Arc<Dispatcher>, mpsc::Sender<ControlMessage>, mpsc::Receiver<AgentMessage>, Arc<FakeJournal>) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let session: Arc<dyn Session> = Arc::new(FakeSession { inbound: TokioMutex::new(ctrl_rx), outbound: out_tx });
        let reporter = Arc::new(Reporter::new(session.clone()));
        let journal = Arc::new(FakeJournal::default());
        let dispatcher = Arc::new(Dispatcher::new(
            test_config(max_parallel, std::env::temp_dir()),
            session,
            reporter,
            Executors { subprocess: Arc::new(CancellableExecutor), container: None },
            Arc::new(NoopRepoCache),
            Arc::new(NoopSecretResolver),
            journal.clone(),
            Arc::new(FakeResourceMonitor { can_accept: StdAtomicBool::new(can_accept) }),
            Arc::new(FakeBlobStoreFactory),
        ));
        (dispatcher, ctrl_tx, out_rx, journal)
    }

    async fn expect_result(out_rx: &mut mpsc::Receiver<AgentMessage>) -> crate::domain::models::ResultEvent {
        loop {
            match out_rx.recv().await.expect("channel closed before expected message") {
                AgentMessage::Result(event) => return event,
                _ => continue,
            }
        }
    }

    // Invariant 1: |ActiveRun(t)| <= MaxParallel. With one permit already
    // held, admission for another run is rejected rather than exceeding it.
    #[tokio::test]
    async fn admission_rejects_when_at_capacity() {
        let (dispatcher, _ctrl_tx, _out_rx, _journal) = build_dispatcher(1, true);
        let _permit = dispatcher.capacity.try_acquire().expect("one permit available");

        let decision = dispatcher.admit(&test_assignment("r1")).await;
        assert!(matches!(decision, AdmissionDecision::Rejected { temporary: true, .. }));
    }

    // Invariant 7: admission monotonicity — CanAcceptWork=false rejects at
    // time t regardless of capacity.
    #[tokio::test]
    async fn admission_rejects_when_resource_thresholds_exceeded() {
        let (dispatcher, _ctrl_tx, _out_rx, _journal) = build_dispatcher(4, false);

        let decision = dispatcher.admit(&test_assignment("r1")).await;
        assert!(matches!(decision, AdmissionDecision::Rejected { temporary: true, .. }));
    }

    #[tokio::test]
    async fn admission_rejects_container_work_with_no_container_executor() {
        let (dispatcher, _ctrl_tx, _out_rx, _journal) = build_dispatcher(4, true);
        let mut assignment = test_assignment("r1");
        assignment.execution_type = ExecutionType::Container;
        assignment.container_image = Some("image:tag".to_string());

        let decision = dispatcher.admit(&assignment).await;
        assert!(matches!(decision, AdmissionDecision::Rejected { temporary: false, .. }));
    }

    #[tokio::test]
    async fn draining_rejects_all_new_work() {
        let (dispatcher, _ctrl_tx, _out_rx, _journal) = build_dispatcher(4, true);
        dispatcher.draining.store(true, Ordering::SeqCst);

        let decision = dispatcher.admit(&test_assignment("r1")).await;
        assert!(matches!(decision, AdmissionDecision::Rejected { temporary: true, .. }));
    }

    // S6: crash recovery. A row left over from a previous process is
    // reported as a lost run and removed from the journal.
    #[tokio::test]
    async fn recover_orphans_reports_and_deletes_pending_rows() {
        let (dispatcher, _ctrl_tx, mut out_rx, journal) = build_dispatcher(4, true);
        journal
            .save("orphan-1", JournalStatus::Running, &test_assignment("orphan-1"))
            .await
            .unwrap();

        dispatcher.recover_orphans().await.unwrap();

        let event = expect_result(&mut out_rx).await;
        assert_eq!(event.run_id, "orphan-1");
        assert!(matches!(event.payload, ResultEventPayload::RunComplete { status: RunStatus::Error, .. }));
        assert!(journal.get_pending().await.unwrap().is_empty());
    }

    // S7: Drain{cancel_active: true} cancels every active run, each reports
    // RunComplete{cancelled}, and a subsequent AssignWork is rejected
    // (temporary) because the agent is now draining.
    #[tokio::test]
    async fn drain_with_cancel_active_cancels_active_runs_and_then_rejects_new_work() {
        let (dispatcher, ctrl_tx, mut out_rx, _journal) = build_dispatcher(2, true);
        let run_handle = tokio::spawn(dispatcher.clone().run());

        ctrl_tx.send(ControlMessage::AssignWork(Box::new(test_assignment("run-a")))).await.unwrap();
        ctrl_tx.send(ControlMessage::AssignWork(Box::new(test_assignment("run-b")))).await.unwrap();

        let mut accepted = 0;
        while accepted < 2 {
            if let AgentMessage::WorkAccepted { .. } = out_rx.recv().await.expect("channel closed") {
                accepted += 1;
            }
        }

        ctrl_tx.send(ControlMessage::Drain { reason: "maintenance".to_string(), cancel_active: true }).await.unwrap();

        let mut cancelled_runs = Vec::new();
        while cancelled_runs.len() < 2 {
            let event = expect_result(&mut out_rx).await;
            if let ResultEventPayload::RunComplete { status, .. } = event.payload {
                assert_eq!(status, RunStatus::Cancelled);
                cancelled_runs.push(event.run_id);
            }
        }
        cancelled_runs.sort();
        assert_eq!(cancelled_runs, vec!["run-a".to_string(), "run-b".to_string()]);

        ctrl_tx.send(ControlMessage::AssignWork(Box::new(test_assignment("run-c")))).await.unwrap();
        let rejected = loop {
            match out_rx.recv().await.expect("channel closed") {
                AgentMessage::WorkRejected { run_id, temporary, .. } => break (run_id, temporary),
                _ => continue,
            }
        };
        assert_eq!(rejected, ("run-c".to_string(), true));

        drop(ctrl_tx);
        run_handle.await.unwrap().unwrap();
    }
}
