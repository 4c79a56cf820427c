//! Port traits: the seams between `application` orchestration logic and the
//! adapters that implement it against a real transport, filesystem, or
//! external HTTP service. Application code depends only on these traits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::error::AgentResult;
use crate::domain::models::{
    AgentStatus, ArtifactMetadata, CapabilityConfig, JournalEntry, JournalStatus, ResourceSample,
    ResultEvent, WorkAssignment,
};

/// Frames the control plane may push to the agent, decoded from whatever
/// wire representation the session adapter uses.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    RegisterResponse {
        success: bool,
        error_message: Option<String>,
        server_version: String,
        heartbeat_interval: Option<Duration>,
    },
    AssignWork(Box<WorkAssignment>),
    CancelWork { run_id: String, reason: String },
    Drain { reason: String, cancel_active: bool },
    Ack { id: String, success: bool },
}

/// Outbound frames the agent sends; `Session` serialises these to the wire.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Register {
        agent_id: String,
        name: String,
        version: String,
        capabilities: CapabilityConfig,
        max_parallel: u32,
        docker_available: bool,
    },
    Heartbeat {
        status: AgentStatus,
        active_run_ids: Vec<String>,
        resource_usage: ResourceSample,
    },
    WorkAccepted {
        run_id: String,
    },
    WorkRejected {
        run_id: String,
        reason: String,
        temporary: bool,
    },
    Result(ResultEvent),
}

/// The session's public surface. A single implementation (the tonic/gRPC
/// adapter) owns a reconnect loop internally and exposes `send`/`recv` over
/// the currently active stream.
#[async_trait]
pub trait Session: Send + Sync {
    /// Sends one frame over the current stream. Serialises with all other
    /// senders (single-writer invariant); returns an error if the stream is
    /// not currently registered.
    async fn send(&self, message: AgentMessage) -> AgentResult<()>;

    /// Receives the next control frame, blocking until one arrives or the
    /// session is shut down (`Ok(None)`).
    async fn recv(&self) -> AgentResult<Option<ControlMessage>>;

    /// The heartbeat interval the control plane negotiated in its last
    /// `RegisterResponse`, if any. When `Some`, it supersedes the
    /// configured default. Adapters with no such negotiation return `None`.
    async fn negotiated_heartbeat_interval(&self) -> Option<Duration> {
        None
    }
}

/// Contract for a test executor, implemented by the subprocess and container
/// adapters.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        reporter: &dyn RunReporter,
        cancel: tokio_util::sync::CancellationToken,
    ) -> AgentResult<crate::domain::models::ExecutionResult>;
}

/// Everything an `Executor` needs for one run, independent of transport.
pub struct ExecutionRequest {
    pub run_id: String,
    pub workspace: PathBuf,
    pub working_directory: Option<String>,
    pub setup_commands: Vec<String>,
    pub teardown_commands: Vec<String>,
    pub tests: Vec<crate::domain::models::TestSpec>,
    pub environment: HashMap<String, String>,
    pub default_timeout: Duration,
    pub container_image: Option<String>,
}

/// The narrow slice of `Reporter` an `Executor` needs: emitting log chunks,
/// per-test results, and setup/teardown progress, without knowing about
/// sequence numbers or the session.
#[async_trait]
pub trait RunReporter: Send + Sync {
    async fn log_chunk(&self, stream: crate::domain::models::LogStream, bytes: Vec<u8>);
    async fn test_result(&self, outcome: crate::domain::models::TestOutcome);
    async fn progress(&self, phase: &str, message: &str, percent: u32, completed: u32, total: u32);
}

/// Materialises a workspace at `dest` checked out to `git_ref`.
#[async_trait]
pub trait RepoCache: Send + Sync {
    async fn materialize(
        &self,
        git_ref: &crate::domain::models::GitRef,
        dest: &Path,
    ) -> AgentResult<()>;

    /// Deletes on-disk mirrors whose last-used time is older than `max_age`.
    async fn cleanup(&self, max_age: Duration) -> AgentResult<usize>;
}

/// Batch-resolves secret references to values against an external secret
/// store.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, references: &[String]) -> AgentResult<HashMap<String, String>>;
}

/// PUT/GET surface over the external artifact object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, path: &Path) -> AgentResult<ArtifactMetadata>;
}

/// Durable crash-recovery journal.
#[async_trait]
pub trait StateJournal: Send + Sync {
    async fn save(
        &self,
        run_id: &str,
        status: JournalStatus,
        assignment: &WorkAssignment,
    ) -> AgentResult<()>;
    async fn delete(&self, run_id: &str) -> AgentResult<()>;
    async fn get_pending(&self) -> AgentResult<Vec<JournalEntry>>;
}

/// Publishes resource samples and the admission predicate.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    fn current(&self) -> ResourceSample;
    fn can_accept_work(&self) -> bool;
}

/// Pure result-format parser: takes a produced artifact's bytes and returns
/// per-test results. This crate only ships the calling convention plus
/// `json` and `tap`; the rest are external collaborators.
pub trait ResultParser {
    fn parse(
        &self,
        bytes: &[u8],
    ) -> Result<Vec<crate::domain::models::TestOutcome>, ParseError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported result format")]
    Unsupported,
    #[error("malformed artifact: {0}")]
    Malformed(String),
}
