//! Subprocess `Executor`: runs setup, tests, and teardown as direct child
//! processes in the workspace working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::adapters::executor::command_line;
use crate::domain::error::{AgentError, AgentResult};
use crate::domain::models::{ExecutionResult, LogStream, RunSummary, TestOutcome, TestStatus};
use crate::domain::ports::{Executor, ExecutionRequest, RunReporter};

pub struct SubprocessExecutor;

impl SubprocessExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns `command` in `workdir` with `env`, streams stdout/stderr to the
/// reporter, and waits up to `timeout` (or for `cancel`). SIGKILL is sent
/// only if the process outlives a short grace window after cancellation.
async fn run_command(
    command: &str,
    workdir: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
    cancel: &CancellationToken,
    reporter: &dyn RunReporter,
) -> AgentResult<CommandOutcome> {
    let argv = command_line::split(command)
        .map_err(|e| AgentError::run_error(format!("invalid command {command:?}: {e}")))?;
    let Some((program, args)) = argv.split_first() else {
        return Err(AgentError::run_error("empty command".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::run_error(format!("failed to spawn {command:?}: {e}")))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_task = stream_lines(stdout, LogStream::Stdout, reporter);
    let stderr_task = stream_lines(stderr, LogStream::Stderr, reporter);

    let start = Instant::now();
    let wait = wait_with_outcome(&mut child, timeout, cancel);
    let (outcome, stdout_text, stderr_text) = tokio::join!(wait, stdout_task, stderr_task);
    let duration = start.elapsed();

    Ok(CommandOutcome { duration, stdout: stdout_text, stderr: stderr_text, ..outcome? })
}

struct CommandOutcome {
    duration: Duration,
    kind: OutcomeKind,
    stdout: String,
    stderr: String,
}

enum OutcomeKind {
    Exit(i32),
    TimedOut,
    Cancelled,
}

async fn wait_with_outcome(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AgentResult<CommandOutcome> {
    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| AgentError::run_error(format!("wait failed: {e}")))?;
            Ok(CommandOutcome {
                duration: Duration::ZERO,
                kind: OutcomeKind::Exit(status.code().unwrap_or(-1)),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        () = tokio::time::sleep(timeout) => {
            terminate(child).await;
            Ok(CommandOutcome { duration: Duration::ZERO, kind: OutcomeKind::TimedOut, stdout: String::new(), stderr: String::new() })
        }
        () = cancel.cancelled() => {
            terminate(child).await;
            Ok(CommandOutcome { duration: Duration::ZERO, kind: OutcomeKind::Cancelled, stdout: String::new(), stderr: String::new() })
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGINT,
            );
        }
        let grace = tokio::time::sleep(Duration::from_secs(3));
        tokio::select! {
            _ = child.wait() => {}
            () = grace => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        let _ = pid;
    } else {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

async fn stream_lines<R>(reader: R, stream: LogStream, reporter: &dyn RunReporter) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut accumulated = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        accumulated.push_str(&line);
        accumulated.push('\n');
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        reporter.log_chunk(stream, bytes).await;
    }
    accumulated
}

#[async_trait]
impl Executor for SubprocessExecutor {
    #[instrument(skip(self, request, reporter, cancel), fields(run_id = %request.run_id))]
    async fn execute(
        &self,
        request: ExecutionRequest,
        reporter: &dyn RunReporter,
        cancel: CancellationToken,
    ) -> AgentResult<ExecutionResult> {
        let workdir = match &request.working_directory {
            Some(sub) => request.workspace.join(sub),
            None => request.workspace.clone(),
        };

        let run_start = Instant::now();

        for (index, setup) in request.setup_commands.iter().enumerate() {
            reporter.progress("setup", setup, 10, index as u32, request.setup_commands.len() as u32).await;
            let outcome = run_command(setup, &workdir, &request.environment, request.default_timeout, &cancel, reporter).await?;
            if let OutcomeKind::Exit(code) = outcome.kind {
                if code != 0 {
                    run_teardown(&request, &workdir, &cancel, reporter).await;
                    return Ok(ExecutionResult {
                        outcomes: vec![],
                        summary: RunSummary::default(),
                        error: Some(format!("setup command {index} failed")),
                    });
                }
            } else {
                run_teardown(&request, &workdir, &cancel, reporter).await;
                return Ok(ExecutionResult {
                    outcomes: vec![],
                    summary: RunSummary::default(),
                    error: Some(format!("setup command {index} failed")),
                });
            }
        }

        let total = request.tests.len() as u32;
        let mut outcomes = Vec::with_capacity(request.tests.len());
        let mut summary = RunSummary { total, ..RunSummary::default() };

        for (completed, test) in request.tests.iter().enumerate() {
            reporter.progress("test", &test.name, percent_for(completed as u32, total), completed as u32, total).await;

            if cancel.is_cancelled() {
                outcomes.push(cancelled_outcome(&test.test_id));
                continue;
            }

            let timeout = test.timeout.unwrap_or(request.default_timeout);
            let env = &request.environment;

            let max_attempts = test.retry_count + 1;
            let mut final_outcome = None;
            for attempt in 0..max_attempts {
                if cancel.is_cancelled() {
                    final_outcome = Some(cancelled_outcome(&test.test_id));
                    break;
                }
                let attempt_start = Instant::now();
                let outcome = run_command(&test.command, &workdir, env, timeout, &cancel, reporter).await?;
                let duration = attempt_start.elapsed();

                let (status, error, stack) = match outcome.kind {
                    OutcomeKind::Exit(0) => (TestStatus::Pass, None, None),
                    OutcomeKind::Exit(code) => (
                        TestStatus::Fail,
                        Some(format!("exit code {code}")),
                        Some(outcome.stderr.clone()),
                    ),
                    OutcomeKind::TimedOut => (TestStatus::Error, Some("test timed out".to_string()), None),
                    OutcomeKind::Cancelled => (TestStatus::Cancelled, None, None),
                };

                let is_final = status == TestStatus::Pass || attempt + 1 == max_attempts || matches!(status, TestStatus::Cancelled);
                let candidate = TestOutcome {
                    test_id: test.test_id.clone(),
                    status,
                    duration,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    retry_attempt: attempt,
                    error,
                    stack,
                };

                if is_final {
                    final_outcome = Some(candidate);
                    break;
                }
                info!(test_id = %test.test_id, attempt, "test failed, retrying");
            }

            let outcome = final_outcome.expect("at least one attempt runs");
            match outcome.status {
                TestStatus::Pass => summary.passed += 1,
                TestStatus::Fail => summary.failed += 1,
                TestStatus::Error => summary.errored += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Cancelled => {}
            }
            reporter.test_result(outcome.clone()).await;
            outcomes.push(outcome);
        }

        run_teardown(&request, &workdir, &cancel, reporter).await;

        summary.duration = run_start.elapsed();
        Ok(ExecutionResult { outcomes, summary, error: None })
    }
}

async fn run_teardown(
    request: &ExecutionRequest,
    workdir: &Path,
    cancel: &CancellationToken,
    reporter: &dyn RunReporter,
) {
    if cancel.is_cancelled() {
        warn!(run_id = %request.run_id, "context cancelled, skipping teardown");
        return;
    }
    for (index, teardown) in request.teardown_commands.iter().enumerate() {
        reporter
            .progress("teardown", teardown, 95, index as u32, request.teardown_commands.len() as u32)
            .await;
        if let Err(e) = run_command(teardown, workdir, &request.environment, request.default_timeout, cancel, reporter).await {
            warn!(run_id = %request.run_id, index, error = %e, "teardown command failed");
        }
    }
}

fn percent_for(completed: u32, total: u32) -> u32 {
    if total == 0 {
        100
    } else {
        10 + (completed * 80 / total)
    }
}

fn cancelled_outcome(test_id: &str) -> TestOutcome {
    TestOutcome {
        test_id: test_id.to_string(),
        status: TestStatus::Cancelled,
        duration: Duration::ZERO,
        stdout: String::new(),
        stderr: String::new(),
        retry_attempt: 0,
        error: None,
        stack: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TestSpec;
    use tempfile::TempDir;

    struct NullReporter;
    #[async_trait]
    impl RunReporter for NullReporter {
        async fn log_chunk(&self, _stream: LogStream, _bytes: Vec<u8>) {}
        async fn test_result(&self, _outcome: TestOutcome) {}
        async fn progress(&self, _phase: &str, _message: &str, _percent: u32, _completed: u32, _total: u32) {}
    }

    fn test_spec(command: &str) -> TestSpec {
        TestSpec {
            test_id: "t1".into(),
            name: "t1".into(),
            command: command.into(),
            timeout: Some(Duration::from_secs(5)),
            retry_count: 0,
            artifact_globs: vec![],
            result_format: None,
        }
    }

    #[tokio::test]
    async fn passing_test_reports_pass() {
        let dir = TempDir::new().unwrap();
        let request = ExecutionRequest {
            run_id: "r1".into(),
            workspace: dir.path().to_path_buf(),
            working_directory: None,
            setup_commands: vec![],
            teardown_commands: vec![],
            tests: vec![test_spec("sh -c \"echo hello\"")],
            environment: HashMap::new(),
            default_timeout: Duration::from_secs(5),
            container_image: None,
        };
        let executor = SubprocessExecutor::new();
        let result = executor
            .execute(request, &NullReporter, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.summary.passed, 1);
        assert_eq!(result.outcomes[0].status, TestStatus::Pass);
    }

    #[tokio::test]
    async fn failing_test_reports_exit_code_and_stderr() {
        let dir = TempDir::new().unwrap();
        let request = ExecutionRequest {
            run_id: "r2".into(),
            workspace: dir.path().to_path_buf(),
            working_directory: None,
            setup_commands: vec![],
            teardown_commands: vec![],
            tests: vec![test_spec("sh -c \"echo boom >&2; exit 2\"")],
            environment: HashMap::new(),
            default_timeout: Duration::from_secs(5),
            container_image: None,
        };
        let executor = SubprocessExecutor::new();
        let result = executor
            .execute(request, &NullReporter, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.summary.failed, 1);
        let outcome = &result.outcomes[0];
        assert!(outcome.error.as_deref().unwrap().contains("exit code 2"));
        assert!(outcome.stack.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn setup_failure_skips_tests_but_runs_teardown() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("teardown-ran");
        let request = ExecutionRequest {
            run_id: "r3".into(),
            workspace: dir.path().to_path_buf(),
            working_directory: None,
            setup_commands: vec!["false".into()],
            teardown_commands: vec![format!("sh -c \"touch {}\"", marker.display())],
            tests: vec![test_spec("sh -c \"echo never\"")],
            environment: HashMap::new(),
            default_timeout: Duration::from_secs(5),
            container_image: None,
        };
        let executor = SubprocessExecutor::new();
        let result = executor
            .execute(request, &NullReporter, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.outcomes.is_empty());
        assert_eq!(result.error.as_deref(), Some("setup command 0 failed"));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn per_test_timeout_reports_error() {
        let dir = TempDir::new().unwrap();
        let mut spec = test_spec("sh -c \"sleep 2\"");
        spec.timeout = Some(Duration::from_millis(200));
        let request = ExecutionRequest {
            run_id: "r4".into(),
            workspace: dir.path().to_path_buf(),
            working_directory: None,
            setup_commands: vec![],
            teardown_commands: vec![],
            tests: vec![spec],
            environment: HashMap::new(),
            default_timeout: Duration::from_secs(5),
            container_image: None,
        };
        let executor = SubprocessExecutor::new();
        let result = executor
            .execute(request, &NullReporter, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcomes[0].status, TestStatus::Error);
        assert_eq!(result.outcomes[0].error.as_deref(), Some("test timed out"));
        assert_eq!(result.summary.failed + result.summary.errored, 1);
        // A per-test error still rolls the run up to `Failed`, not `Error`:
        // `Error` is reserved for an execution-level failure.
        assert_eq!(
            crate::application::reporter::derive_run_status(&result, false, false),
            crate::domain::models::RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn retried_test_passes_on_second_attempt() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("attempted-once");
        let mut spec = test_spec(&format!(
            "sh -c \"test -f {0} && exit 0 || (touch {0} && exit 1)\"",
            marker.display()
        ));
        spec.retry_count = 1;
        let request = ExecutionRequest {
            run_id: "r5".into(),
            workspace: dir.path().to_path_buf(),
            working_directory: None,
            setup_commands: vec![],
            teardown_commands: vec![],
            tests: vec![spec],
            environment: HashMap::new(),
            default_timeout: Duration::from_secs(5),
            container_image: None,
        };
        let executor = SubprocessExecutor::new();
        let result = executor
            .execute(request, &NullReporter, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcomes[0].status, TestStatus::Pass);
        assert_eq!(result.outcomes[0].retry_attempt, 1);
        assert_eq!(result.summary.passed, 1);
        assert_eq!(result.summary.failed, 0);
    }
}
