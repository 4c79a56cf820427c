//! Pure data shapes shared across the agent: configuration, work assignments,
//! in-flight run bookkeeping, the durable journal row, the repo-cache entry,
//! and the outbound result-event stream.
//!
//! Nothing here talks to a database, a socket, or the filesystem: adapters
//! translate these into and out of their own wire/storage representations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide configuration, immutable once loaded and validated.
///
/// Constructed by `infrastructure::config::load` from `CONDUCTOR_AGENT_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub identity: Identity,
    pub endpoint: Endpoint,
    pub tls: TlsConfig,
    pub capabilities: CapabilityConfig,
    pub max_parallel: u32,
    pub directories: Directories,
    pub timers: Timers,
    pub admission: AdmissionThresholds,
    pub executor: ExecutorSelection,
    pub secrets: SecretProviderConfig,
    pub ambient: AmbientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub control_plane_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilityConfig {
    pub network_zones: Vec<String>,
    pub runtimes: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directories {
    pub workspace_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timers {
    pub heartbeat_interval: Duration,
    pub reconnect_min_interval: Duration,
    pub reconnect_max_interval: Duration,
    pub default_timeout: Duration,
    pub resource_check_interval: Duration,
}

/// Admission thresholds, each a percent in `(0, 100]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutorSelection {
    SubprocessOnly,
    SubprocessAndContainer { docker_host: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum SecretProviderConfig {
    #[default]
    None,
    Vault {
        address: String,
        token: String,
        mount: String,
    },
}

/// The `CONDUCTOR_AGENT_LOG_LEVEL` / `CONDUCTOR_AGENT_LOG_FORMAT` surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Console,
}

/// Execution type of a `WorkAssignment`. A `Container` assignment with no
/// `container_image` is rejected non-temporarily at admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionType {
    Subprocess,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitRef {
    pub url: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResultFormat {
    Junit,
    Jest,
    Playwright,
    GoTest,
    Tap,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub test_id: String,
    pub name: String,
    pub command: String,
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    pub artifact_globs: Vec<String>,
    pub result_format: Option<ResultFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    pub run_id: String,
    pub execution_type: ExecutionType,
    pub git_ref: GitRef,
    pub tests: Vec<TestSpec>,
    pub setup_commands: Vec<String>,
    pub teardown_commands: Vec<String>,
    pub environment: HashMap<String, String>,
    pub secrets: Vec<String>,
    pub container_image: Option<String>,
    pub working_directory: Option<String>,
    pub deadline: Option<Duration>,
}

impl WorkAssignment {
    /// A `container` assignment requires an image.
    #[must_use]
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_type == ExecutionType::Container && self.container_image.is_none() {
            return Err(format!(
                "run {}: execution_type=container requires container_image",
                self.run_id
            ));
        }
        Ok(())
    }
}

/// Agent-local bookkeeping for one in-flight run. `cancel` is the handle
/// every cancellation source (control-plane `CancelWork`, per-run deadline,
/// drain, shutdown) invokes through its `CancellationToken`.
pub struct ActiveRun {
    pub assignment: WorkAssignment,
    pub started_at: DateTime<Utc>,
    pub cancel: tokio_util::sync::CancellationToken,
    pub executor_kind: ExecutionType,
    pub workspace_id: String,
}

/// Durable row in `state_dir/agent.db`, table `runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_id: String,
    pub status: JournalStatus,
    pub assignment: WorkAssignment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    Pending,
    Running,
}

impl JournalStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
        }
    }
}

/// In-memory view of a `RepoCache` mirror entry; mirrored on disk at
/// `cache_dir/<cache_key>`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_key: String,
    pub mirror_path: PathBuf,
    pub last_used: DateTime<Utc>,
    pub first_cloned: DateTime<Utc>,
}

/// Recorded per uploaded artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub sha256: String,
}

/// Per-test outcome produced by an `Executor`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub retry_attempt: u32,
    pub error: Option<String>,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errored: u32,
    pub duration: Duration,
}

/// The result of one `Executor::execute` call, before the dispatcher maps it
/// (together with the context's cancellation/deadline outcome) to a
/// `RunComplete` status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcomes: Vec<TestOutcome>,
    pub summary: RunSummary,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
    Error,
    Timeout,
    Cancelled,
}

/// One element of the outbound `ResultStream`; every variant carries a run
/// id and process-global sequence number once wrapped by the `Reporter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResultEventPayload {
    LogChunk { stream: LogStream, bytes: Vec<u8> },
    TestResult(TestOutcome),
    Progress {
        phase: String,
        message: String,
        percent: u32,
        completed: u32,
        total: u32,
    },
    RunComplete {
        status: RunStatus,
        summary: RunSummary,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub run_id: String,
    pub sequence: u64,
    pub payload: ResultEventPayload,
}

/// Derived agent status reported in every heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Busy,
    Draining,
}

/// Admission-time decision rendered as `WorkAccepted` / `WorkRejected`.
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    Accepted,
    Rejected { reason: String, temporary: bool },
}

/// Sampled resource usage, shared between the admission predicate and the
/// heartbeat payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
}

impl ResourceSample {
    #[must_use]
    pub fn memory_percent(&self) -> f64 {
        percent_of(self.memory_used_bytes, self.memory_total_bytes)
    }

    #[must_use]
    pub fn disk_percent(&self) -> f64 {
        percent_of(self.disk_used_bytes, self.disk_total_bytes)
    }
}

fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}
