//! Dependency wiring: turns a loaded `Config` into a running `Dispatcher`.
//!
//! Loads config, opens the database, constructs the repositories and
//! services in dependency order, then hands the assembled graph to the
//! dispatcher. This agent has no CLI subcommands of its own — `main` calls
//! `wire` once at startup and runs the returned `Dispatcher` directly.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;

use crate::adapters::executor::{ContainerExecutor, SubprocessExecutor};
use crate::adapters::repo_cache::{GitCredentials, GitRepoCache};
use crate::adapters::secrets::{NoSecretResolver, VaultSecretResolver};
use crate::adapters::session::{GrpcSession, SessionConfig};
use crate::adapters::blob_store::HttpBlobStore;
use crate::adapters::sqlite::{self, SqliteStateJournal};
use crate::application::dispatcher::{BlobStoreFactory, Dispatcher, Executors};
use crate::application::resource_monitor::LinuxResourceMonitor;
use crate::application::reporter::Reporter;
use crate::domain::error::{AgentError, AgentResult};
use crate::domain::models::{Config, ExecutorSelection, SecretProviderConfig};
use crate::domain::ports::{BlobStore, RepoCache, ResourceMonitor, SecretResolver, Session, StateJournal};

/// Agent version advertised in `Register`; set from the crate's own version
/// so the control plane can log what it is talking to.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `BlobStoreFactory` that bakes a shared `reqwest::Client` and the control
/// plane's artifact endpoint into each per-run `HttpBlobStore` it mints.
struct HttpBlobStoreFactory {
    http: Client,
    base_url: String,
    token: String,
}

impl BlobStoreFactory for HttpBlobStoreFactory {
    fn for_run(&self, run_id: &str) -> Arc<dyn BlobStore> {
        Arc::new(HttpBlobStore::new(self.http.clone(), self.base_url.clone(), self.token.clone(), run_id.to_string()))
    }
}

/// Assembles every adapter named in `config` and returns a `Dispatcher`
/// ready for `recover_orphans` then `run`. The caller owns the `Config`;
/// this function borrows only what it needs to construct each adapter.
///
/// # Errors
/// Returns `AgentError::RunError` if the state directory's journal database
/// cannot be opened and migrated, or `AgentError::Permanent` if building the
/// HTTP client for the blob store or secrets adapter fails.
pub async fn wire(config: Arc<Config>) -> AgentResult<Arc<Dispatcher>> {
    let journal_pool = open_journal(&config).await?;
    let journal: Arc<dyn StateJournal> = Arc::new(SqliteStateJournal::new(journal_pool));

    let session: Arc<dyn Session> = Arc::new(GrpcSession::connect(session_config(&config)));

    let reporter = Arc::new(Reporter::new(session.clone()));

    let executors = build_executors(&config);

    let repo_cache: Arc<dyn RepoCache> = Arc::new(GitRepoCache::new(
        config.directories.cache_dir.clone(),
        GitCredentials { ssh_key_path: None, https_userpass: None },
    ));

    let secrets = build_secrets(&config)?;

    let resource_monitor: Arc<dyn ResourceMonitor> =
        Arc::new(LinuxResourceMonitor::new(config.directories.workspace_dir.clone(), config.admission.clone()));

    let blob_store_factory = build_blob_store_factory(&config)?;

    Ok(Arc::new(Dispatcher::new(
        config,
        session,
        reporter,
        executors,
        repo_cache,
        secrets,
        journal,
        resource_monitor,
        blob_store_factory,
    )))
}

async fn open_journal(config: &Config) -> AgentResult<sqlx::SqlitePool> {
    let db_path: PathBuf = config.directories.state_dir.join("agent.db");
    sqlite::open_and_migrate(&db_path)
        .await
        .map_err(|e| AgentError::run_error(format!("failed to open journal at {}: {e}", db_path.display())))
}

fn session_config(config: &Config) -> SessionConfig {
    let docker_available = matches!(config.executor, ExecutorSelection::SubprocessAndContainer { .. });
    SessionConfig {
        control_plane_url: config.endpoint.control_plane_url.clone(),
        token: config.endpoint.token.clone(),
        agent_id: config.identity.agent_id.clone(),
        agent_name: config.identity.name.clone(),
        agent_version: AGENT_VERSION.to_string(),
        tls: config.tls.clone(),
        capabilities: config.capabilities.clone(),
        max_parallel: config.max_parallel,
        docker_available,
        reconnect_min_interval: config.timers.reconnect_min_interval,
        reconnect_max_interval: config.timers.reconnect_max_interval,
    }
}

fn build_executors(config: &Config) -> Executors {
    let subprocess = Arc::new(SubprocessExecutor::new());
    let container = match &config.executor {
        ExecutorSelection::SubprocessOnly => None,
        ExecutorSelection::SubprocessAndContainer { docker_host } => {
            Some(Arc::new(ContainerExecutor::new(docker_host.clone())) as Arc<dyn crate::domain::ports::Executor>)
        }
    };
    Executors { subprocess, container }
}

fn build_secrets(config: &Config) -> AgentResult<Arc<dyn SecretResolver>> {
    match &config.secrets {
        SecretProviderConfig::None => Ok(Arc::new(NoSecretResolver) as Arc<dyn SecretResolver>),
        SecretProviderConfig::Vault { address, token, mount } => {
            let resolver = VaultSecretResolver::new(address.clone(), token.clone(), mount.clone())?;
            Ok(Arc::new(resolver) as Arc<dyn SecretResolver>)
        }
    }
}

fn build_blob_store_factory(config: &Config) -> AgentResult<Arc<dyn BlobStoreFactory>> {
    let http = Client::builder()
        .build()
        .map_err(|e| AgentError::permanent(format!("failed to build blob store http client: {e}")))?;
    Ok(Arc::new(HttpBlobStoreFactory {
        http,
        base_url: config.endpoint.control_plane_url.clone(),
        token: config.endpoint.token.clone(),
    }))
}
