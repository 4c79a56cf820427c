//! Conversions between domain-level `AgentMessage`/`ControlMessage` and the
//! generated protobuf `AgentFrame`/`ControlFrame` types.

use std::collections::HashMap;
use std::time::Duration;

use crate::domain::error::{AgentError, AgentResult};
use crate::domain::models::{
    AgentStatus, ExecutionType, GitRef, LogStream, ResourceSample, ResultEvent, ResultEventPayload,
    ResultFormat, RunStatus, RunSummary, TestOutcome, TestSpec, TestStatus, WorkAssignment,
};
use crate::domain::ports::{AgentMessage, ControlMessage};
use crate::proto;

pub fn encode_agent_message(message: AgentMessage) -> proto::AgentFrame {
    let payload = match message {
        AgentMessage::Register { agent_id, name, version, capabilities, max_parallel, docker_available } => {
            proto::agent_frame::Payload::Register(proto::Register {
                agent_id,
                name,
                version,
                capabilities: Some(proto::Capabilities {
                    network_zones: capabilities.network_zones,
                    runtimes: capabilities.runtimes,
                    max_parallel,
                    docker_available,
                    resources: Some(proto::Resources {
                        cpu_cores: num_cpus(),
                        memory_bytes: 0,
                        disk_bytes: 0,
                    }),
                    os: std::env::consts::OS.to_string(),
                    arch: std::env::consts::ARCH.to_string(),
                }),
                labels: capabilities.labels,
            })
        }
        AgentMessage::Heartbeat { status, active_run_ids, resource_usage } => {
            proto::agent_frame::Payload::Heartbeat(proto::Heartbeat {
                status: encode_status(status) as i32,
                active_run_ids,
                resource_usage: Some(proto::ResourceUsage {
                    cpu_percent: resource_usage.cpu_percent as f32,
                    memory_bytes: resource_usage.memory_used_bytes,
                    memory_total_bytes: resource_usage.memory_total_bytes,
                    disk_bytes: resource_usage.disk_used_bytes,
                    disk_total_bytes: resource_usage.disk_total_bytes,
                }),
            })
        }
        AgentMessage::WorkAccepted { run_id } => {
            proto::agent_frame::Payload::WorkAccepted(proto::WorkAccepted { run_id })
        }
        AgentMessage::WorkRejected { run_id, reason, temporary } => {
            proto::agent_frame::Payload::WorkRejected(proto::WorkRejected { run_id, reason, temporary })
        }
        AgentMessage::Result(event) => {
            proto::agent_frame::Payload::ResultStream(encode_result_event(event))
        }
    };
    proto::AgentFrame { payload: Some(payload) }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

fn encode_status(status: AgentStatus) -> proto::AgentStatus {
    match status {
        AgentStatus::Idle => proto::AgentStatus::Idle,
        AgentStatus::Busy => proto::AgentStatus::Busy,
        AgentStatus::Draining => proto::AgentStatus::Draining,
    }
}

fn encode_result_event(event: ResultEvent) -> proto::ResultStream {
    let payload = match event.payload {
        ResultEventPayload::LogChunk { stream, bytes } => {
            proto::result_stream::Payload::LogChunk(proto::LogChunk {
                stream: match stream {
                    LogStream::Stdout => "stdout".to_string(),
                    LogStream::Stderr => "stderr".to_string(),
                },
                data: bytes,
            })
        }
        ResultEventPayload::TestResult(outcome) => {
            proto::result_stream::Payload::TestResult(encode_test_result(outcome))
        }
        ResultEventPayload::Progress { phase, message, percent, completed, total } => {
            proto::result_stream::Payload::Progress(proto::Progress { phase, message, percent, completed, total })
        }
        ResultEventPayload::RunComplete { status, summary, error } => {
            proto::result_stream::Payload::RunComplete(proto::RunComplete {
                status: encode_run_status(status) as i32,
                summary: Some(encode_run_summary(summary)),
                error: error.unwrap_or_default(),
            })
        }
    };
    proto::ResultStream { run_id: event.run_id, sequence: event.sequence, payload: Some(payload) }
}

fn encode_test_result(outcome: TestOutcome) -> proto::TestResult {
    proto::TestResult {
        test_id: outcome.test_id,
        status: encode_test_status(outcome.status) as i32,
        duration_millis: outcome.duration.as_millis() as i64,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        retry_attempt: outcome.retry_attempt,
        error: outcome.error.unwrap_or_default(),
        stack: outcome.stack.unwrap_or_default(),
    }
}

fn encode_test_status(status: TestStatus) -> proto::TestStatus {
    match status {
        TestStatus::Pass => proto::TestStatus::Pass,
        TestStatus::Fail => proto::TestStatus::Fail,
        TestStatus::Error => proto::TestStatus::Error,
        TestStatus::Skipped => proto::TestStatus::Skipped,
        TestStatus::Cancelled => proto::TestStatus::Cancelled,
    }
}

fn encode_run_status(status: RunStatus) -> proto::RunStatus {
    match status {
        RunStatus::Passed => proto::RunStatus::Passed,
        RunStatus::Failed => proto::RunStatus::Failed,
        RunStatus::Error => proto::RunStatus::Error,
        RunStatus::Timeout => proto::RunStatus::Timeout,
        RunStatus::Cancelled => proto::RunStatus::Cancelled,
    }
}

fn encode_run_summary(summary: RunSummary) -> proto::RunSummary {
    proto::RunSummary {
        total: summary.total,
        passed: summary.passed,
        failed: summary.failed,
        skipped: summary.skipped,
        errored: summary.errored,
        duration_millis: summary.duration.as_millis() as i64,
    }
}

pub fn decode_control_frame(frame: proto::ControlFrame) -> AgentResult<Option<ControlMessage>> {
    let Some(payload) = frame.payload else {
        return Ok(None);
    };
    Ok(Some(match payload {
        proto::control_frame::Payload::RegisterResponse(r) => ControlMessage::RegisterResponse {
            success: r.success,
            error_message: (!r.error_message.is_empty()).then_some(r.error_message),
            server_version: r.server_version,
            heartbeat_interval: (r.heartbeat_interval_seconds > 0)
                .then(|| Duration::from_secs(r.heartbeat_interval_seconds as u64)),
        },
        proto::control_frame::Payload::AssignWork(a) => {
            ControlMessage::AssignWork(Box::new(decode_assign_work(a)?))
        }
        proto::control_frame::Payload::CancelWork(c) => {
            ControlMessage::CancelWork { run_id: c.run_id, reason: c.reason }
        }
        proto::control_frame::Payload::Drain(d) => {
            ControlMessage::Drain { reason: d.reason, cancel_active: d.cancel_active }
        }
        proto::control_frame::Payload::Ack(a) => ControlMessage::Ack { id: a.id, success: a.success },
    }))
}

fn decode_assign_work(a: proto::AssignWork) -> AgentResult<WorkAssignment> {
    let execution_type = match proto::ExecutionType::try_from(a.execution_type) {
        Ok(proto::ExecutionType::Subprocess) => ExecutionType::Subprocess,
        Ok(proto::ExecutionType::Container) => ExecutionType::Container,
        _ => {
            return Err(AgentError::permanent(format!(
                "run {}: unspecified execution_type",
                a.run_id
            )))
        }
    };

    let git_ref = a.git_ref.map_or_else(GitRef::default, |g| GitRef {
        url: g.url,
        branch: g.branch,
        commit: g.commit,
        tag: g.tag,
    });

    let tests = a.tests.into_iter().map(decode_test_spec).collect::<AgentResult<Vec<_>>>()?;

    Ok(WorkAssignment {
        run_id: a.run_id,
        execution_type,
        git_ref,
        tests,
        setup_commands: a.setup_commands,
        teardown_commands: a.teardown_commands,
        environment: a.environment,
        secrets: a.secrets,
        container_image: a.container_image,
        working_directory: a.working_directory,
        deadline: a.timeout_seconds.map(|s| Duration::from_secs(s.max(0) as u64)),
    })
}

fn decode_test_spec(t: proto::TestSpec) -> AgentResult<TestSpec> {
    let result_format = match proto::ResultFormat::try_from(t.result_format) {
        Ok(proto::ResultFormat::Unspecified) | Err(_) => None,
        Ok(proto::ResultFormat::Junit) => Some(ResultFormat::Junit),
        Ok(proto::ResultFormat::Jest) => Some(ResultFormat::Jest),
        Ok(proto::ResultFormat::Playwright) => Some(ResultFormat::Playwright),
        Ok(proto::ResultFormat::GoTest) => Some(ResultFormat::GoTest),
        Ok(proto::ResultFormat::Tap) => Some(ResultFormat::Tap),
        Ok(proto::ResultFormat::Json) => Some(ResultFormat::Json),
    };

    Ok(TestSpec {
        test_id: t.test_id,
        name: t.name,
        command: t.command,
        timeout: t.timeout_seconds.map(|s| Duration::from_secs(s.max(0) as u64)),
        retry_count: t.retry_count,
        artifact_globs: t.artifact_globs,
        result_format,
    })
}

/// Used by the dispatcher when building a `WorkRejected`/`Heartbeat`
/// capabilities summary; kept here so encode/decode stay in one file.
#[must_use]
pub fn empty_labels() -> HashMap<String, String> {
    HashMap::new()
}
