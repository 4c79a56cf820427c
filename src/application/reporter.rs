//! `Reporter`: wraps outbound `ResultEvent`s with a process-global monotonic
//! sequence number before handing them to the `Session`, derives the
//! terminal `RunComplete` status, and uploads artifacts named by each test's
//! glob patterns.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::models::{
    ArtifactMetadata, ExecutionResult, LogStream, ResultEvent, ResultEventPayload, RunStatus, RunSummary,
    TestOutcome, TestSpec, TestStatus,
};
use crate::domain::ports::{AgentMessage, BlobStore, RunReporter, Session};

pub struct Reporter {
    session: Arc<dyn Session>,
    sequence: AtomicU64,
}

impl Reporter {
    #[must_use]
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session, sequence: AtomicU64::new(0) }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    async fn emit(&self, run_id: &str, payload: ResultEventPayload) {
        let event = ResultEvent { run_id: run_id.to_string(), sequence: self.next_sequence(), payload };
        if let Err(err) = self.session.send(AgentMessage::Result(event)).await {
            warn!(run_id, error = %err, "failed to send result event");
        }
    }

    /// Returns a `RunReporter` bound to `run_id`, sharing this reporter's
    /// global sequence counter.
    #[must_use]
    pub fn handle_for(self: &Arc<Self>, run_id: String) -> RunReporterHandle {
        RunReporterHandle { reporter: Arc::clone(self), run_id }
    }

    pub async fn run_complete(&self, run_id: &str, status: RunStatus, summary: RunSummary, error: Option<String>) {
        self.emit(run_id, ResultEventPayload::RunComplete { status, summary, error }).await;
    }

    /// Uploads every artifact matched by `tests`' glob patterns under
    /// `workspace`. A failed glob pattern or failed upload is logged and
    /// skipped; it never fails the run — artifact upload errors are
    /// warnings, not run failures.
    pub async fn upload_artifacts(
        &self,
        workspace: &Path,
        tests: &[TestSpec],
        blob_store: &dyn BlobStore,
    ) -> Vec<ArtifactMetadata> {
        let mut uploaded = Vec::new();
        for test in tests {
            for pattern in &test.artifact_globs {
                let full_pattern = workspace.join(pattern);
                let paths = match glob::glob(&full_pattern.to_string_lossy()) {
                    Ok(paths) => paths,
                    Err(err) => {
                        warn!(pattern, error = %err, "invalid artifact glob pattern");
                        continue;
                    }
                };
                for entry in paths {
                    let path = match entry {
                        Ok(path) => path,
                        Err(err) => {
                            warn!(pattern, error = %err, "failed to read artifact path");
                            continue;
                        }
                    };
                    if !path.is_file() {
                        continue;
                    }
                    let key = path
                        .strip_prefix(workspace)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .to_string();
                    match blob_store.put(&key, &path).await {
                        Ok(metadata) => uploaded.push(metadata),
                        Err(err) => warn!(key, error = %err, "failed to upload artifact"),
                    }
                }
            }
        }
        uploaded
    }
}

/// `RunReporter` bound to one run; handed to an `Executor::execute` call.
pub struct RunReporterHandle {
    reporter: Arc<Reporter>,
    run_id: String,
}

#[async_trait]
impl RunReporter for RunReporterHandle {
    async fn log_chunk(&self, stream: LogStream, bytes: Vec<u8>) {
        self.reporter.emit(&self.run_id, ResultEventPayload::LogChunk { stream, bytes }).await;
    }

    async fn test_result(&self, outcome: TestOutcome) {
        self.reporter.emit(&self.run_id, ResultEventPayload::TestResult(outcome)).await;
    }

    async fn progress(&self, phase: &str, message: &str, percent: u32, completed: u32, total: u32) {
        self.reporter
            .emit(
                &self.run_id,
                ResultEventPayload::Progress {
                    phase: phase.to_string(),
                    message: message.to_string(),
                    percent,
                    completed,
                    total,
                },
            )
            .await;
    }
}

/// Derives the terminal run status from how execution ended.
/// Cancellation and deadline expiry take priority over the executor's own
/// result since they describe *why* the executor stopped, not what it found;
/// short of that, an execution-level error (the executor itself failing,
/// e.g. a setup command) beats any individual test outcome, and any failed
/// or errored test rolls up to `Failed` rather than an otherwise clean pass.
#[must_use]
pub fn derive_run_status(result: &ExecutionResult, cancelled: bool, timed_out: bool) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    if timed_out {
        return RunStatus::Timeout;
    }
    if result.error.is_some() {
        return RunStatus::Error;
    }
    if result
        .outcomes
        .iter()
        .any(|o| matches!(o.status, TestStatus::Fail | TestStatus::Error))
    {
        return RunStatus::Failed;
    }
    RunStatus::Passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RunSummary;
    use std::time::Duration;

    fn outcome(status: TestStatus) -> TestOutcome {
        TestOutcome {
            test_id: "t".into(),
            status,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            retry_attempt: 0,
            error: None,
            stack: None,
        }
    }

    #[test]
    fn cancelled_wins_over_everything() {
        let result = ExecutionResult { outcomes: vec![outcome(TestStatus::Pass)], summary: RunSummary::default(), error: None };
        assert_eq!(derive_run_status(&result, true, true), RunStatus::Cancelled);
    }

    #[test]
    fn timeout_wins_over_test_outcomes() {
        let result = ExecutionResult { outcomes: vec![outcome(TestStatus::Pass)], summary: RunSummary::default(), error: None };
        assert_eq!(derive_run_status(&result, false, true), RunStatus::Timeout);
    }

    #[test]
    fn execution_error_wins_over_passing_tests() {
        let result = ExecutionResult { outcomes: vec![], summary: RunSummary::default(), error: Some("setup failed".into()) };
        assert_eq!(derive_run_status(&result, false, false), RunStatus::Error);
    }

    #[test]
    fn failed_test_yields_failed_status() {
        let result = ExecutionResult {
            outcomes: vec![outcome(TestStatus::Pass), outcome(TestStatus::Fail)],
            summary: RunSummary::default(),
            error: None,
        };
        assert_eq!(derive_run_status(&result, false, false), RunStatus::Failed);
    }

    #[test]
    fn errored_test_rolls_up_to_failed_status() {
        // A per-test error (e.g. a crashed test process) is not the same as
        // an execution-level error: it still rolls the run up to `Failed`,
        // not `Error`. `Error` is reserved for `result.error.is_some()`.
        let result = ExecutionResult {
            outcomes: vec![outcome(TestStatus::Pass), outcome(TestStatus::Error)],
            summary: RunSummary::default(),
            error: None,
        };
        assert_eq!(derive_run_status(&result, false, false), RunStatus::Failed);
    }

    #[test]
    fn all_passing_yields_passed_status() {
        let result = ExecutionResult { outcomes: vec![outcome(TestStatus::Pass)], summary: RunSummary::default(), error: None };
        assert_eq!(derive_run_status(&result, false, false), RunStatus::Passed);
    }

    struct DiscardSession;

    #[async_trait]
    impl Session for DiscardSession {
        async fn send(&self, _message: AgentMessage) -> crate::domain::error::AgentResult<()> {
            Ok(())
        }

        async fn recv(&self) -> crate::domain::error::AgentResult<Option<crate::domain::ports::ControlMessage>> {
            std::future::pending().await
        }
    }

    proptest::proptest! {
        /// Every call to `next_sequence` on the same `Reporter` must return a
        /// strictly greater value than the last, regardless of how many
        /// times it is called: sequence numbers are a monotonically
        /// increasing per-run stream.
        #[test]
        fn next_sequence_is_strictly_monotonic(call_count in 1usize..200) {
            let reporter = Reporter::new(std::sync::Arc::new(DiscardSession));
            let mut last = None;
            for _ in 0..call_count {
                let next = reporter.next_sequence();
                if let Some(previous) = last {
                    prop_assert!(next > previous);
                }
                last = Some(next);
            }
        }
    }
}
