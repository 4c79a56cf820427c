//! Loads `domain::models::Config` from the process environment.
//!
//! Uses a `Figment` provider chain feeding a single `extract()`. This agent
//! has no project directory to hold a config file, so the chain collapses
//! to defaults plus `Env::prefixed("CONDUCTOR_AGENT_")`.
//!
//! Validation here is total rather than fail-fast: every violating field
//! contributes one message to `AgentError::ConfigInvalid`, and the caller
//! sees the whole list in one combined startup error rather than one
//! failure per restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::error::{AgentError, AgentResult};
use crate::domain::models::{
    AdmissionThresholds, AmbientConfig, CapabilityConfig, Config, Directories, Endpoint, ExecutorSelection, Identity,
    LogFormat, LogLevel, SecretProviderConfig, Timers, TlsConfig,
};

const DEFAULT_MAX_PARALLEL: &str = "4";
const DEFAULT_HEARTBEAT_INTERVAL: &str = "15s";
const DEFAULT_RECONNECT_MIN_INTERVAL: &str = "1s";
const DEFAULT_RECONNECT_MAX_INTERVAL: &str = "60s";
const DEFAULT_TIMEOUT: &str = "30m";
const DEFAULT_RESOURCE_CHECK_INTERVAL: &str = "5s";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_FORMAT: &str = "json";
const DEFAULT_CPU_THRESHOLD: &str = "90";
const DEFAULT_MEMORY_THRESHOLD: &str = "90";
const DEFAULT_DISK_THRESHOLD: &str = "90";

/// One-for-one with the `CONDUCTOR_AGENT_*` environment surface: every
/// field is an optional string so a missing variable is a "use the
/// default", not a figment extraction failure, and every present-but-
/// malformed value becomes one validation violation instead of an early
/// return.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawConfig {
    id: Option<String>,
    name: Option<String>,
    control_plane_url: Option<String>,
    token: Option<String>,
    network_zones: Option<String>,
    runtimes: Option<String>,
    labels: Option<String>,
    max_parallel: Option<String>,
    workspace_dir: Option<String>,
    cache_dir: Option<String>,
    state_dir: Option<String>,
    heartbeat_interval: Option<String>,
    reconnect_min_interval: Option<String>,
    reconnect_max_interval: Option<String>,
    default_timeout: Option<String>,
    resource_check_interval: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
    tls_enabled: Option<String>,
    tls_cert_file: Option<String>,
    tls_key_file: Option<String>,
    tls_ca_file: Option<String>,
    tls_insecure_skip_verify: Option<String>,
    docker_enabled: Option<String>,
    docker_host: Option<String>,
    cpu_threshold: Option<String>,
    memory_threshold: Option<String>,
    disk_threshold: Option<String>,
    secrets_provider: Option<String>,
    vault_address: Option<String>,
    vault_token: Option<String>,
    vault_mount: Option<String>,
}

/// Accumulates violations instead of returning on the first one, so a
/// misconfigured agent reports everything wrong with it in a single
/// combined startup error instead of one failure per restart.
struct Violations(Vec<String>);

impl Violations {
    const fn new() -> Self {
        Self(Vec::new())
    }

    fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    /// Parses `raw` with `parse`, recording a violation and returning
    /// `default` if it fails to parse or is absent and `required` is set.
    fn require<T: Copy>(&mut self, field: &str, raw: Option<&str>, default: T, parse: impl Fn(&str) -> Option<T>) -> T {
        match raw {
            Some(value) => parse(value).unwrap_or_else(|| {
                self.push(format!("{field}: invalid value {value:?}"));
                default
            }),
            None => default,
        }
    }
}

/// Loads and validates `Config` from `CONDUCTOR_AGENT_*` environment
/// variables. Returns `AgentError::ConfigInvalid` with every violation
/// found, not just the first.
pub fn load() -> AgentResult<Config> {
    let raw: RawConfig = Figment::new()
        .merge(Serialized::defaults(RawConfig::default()))
        .merge(Env::prefixed("CONDUCTOR_AGENT_"))
        .extract()
        .map_err(|e| AgentError::ConfigInvalid { violations: vec![format!("failed to read environment: {e}")] })?;

    build(&raw)
}

fn build(raw: &RawConfig) -> AgentResult<Config> {
    let mut violations = Violations::new();

    let identity = Identity {
        agent_id: raw.id.clone().unwrap_or_else(default_hostname),
        name: raw.name.clone().unwrap_or_else(default_hostname),
    };

    let control_plane_url = raw.control_plane_url.clone().unwrap_or_default();
    if control_plane_url.is_empty() {
        violations.push("control_plane_url: required (CONDUCTOR_AGENT_CONTROL_PLANE_URL)");
    }
    let token = raw.token.clone().unwrap_or_default();
    if token.is_empty() {
        violations.push("token: required (CONDUCTOR_AGENT_TOKEN)");
    }
    let endpoint = Endpoint { control_plane_url, token };

    let tls = build_tls(raw, &mut violations);
    let capabilities = CapabilityConfig {
        network_zones: parse_csv(raw.network_zones.as_deref()),
        runtimes: parse_csv(raw.runtimes.as_deref()),
        labels: parse_kv_csv(raw.labels.as_deref()),
    };

    let max_parallel_raw = raw.max_parallel.as_deref().unwrap_or(DEFAULT_MAX_PARALLEL);
    let max_parallel: u32 = violations.require("max_parallel", Some(max_parallel_raw), 4, |s| s.parse().ok());
    if !(1..=100).contains(&max_parallel) {
        violations.push(format!("max_parallel: must be in 1..=100, got {max_parallel}"));
    }

    let directories = build_directories(raw, &mut violations);
    let timers = build_timers(raw, &mut violations);
    validate_timers(&timers, &mut violations);
    let admission = build_admission(raw, &mut violations);
    let executor = build_executor(raw);
    let secrets = build_secrets(raw, &mut violations);
    let ambient = build_ambient(raw, &mut violations);

    if !violations.0.is_empty() {
        return Err(AgentError::ConfigInvalid { violations: violations.0 });
    }

    Ok(Config { identity, endpoint, tls, capabilities, max_parallel, directories, timers, admission, executor, secrets, ambient })
}

fn build_tls(raw: &RawConfig, violations: &mut Violations) -> TlsConfig {
    let enabled = parse_bool_field("tls_enabled", raw.tls_enabled.as_deref(), false, violations);
    let insecure_skip_verify = parse_bool_field(
        "tls_insecure_skip_verify",
        raw.tls_insecure_skip_verify.as_deref(),
        false,
        violations,
    );
    if enabled && raw.tls_cert_file.is_some() != raw.tls_key_file.is_some() {
        violations.push("tls: cert_file and key_file must be set together");
    }
    TlsConfig {
        enabled,
        cert_file: raw.tls_cert_file.clone().map(PathBuf::from),
        key_file: raw.tls_key_file.clone().map(PathBuf::from),
        ca_file: raw.tls_ca_file.clone().map(PathBuf::from),
        insecure_skip_verify,
    }
}

fn build_directories(raw: &RawConfig, violations: &mut Violations) -> Directories {
    let mut required_path = |field: &str, value: &Option<String>| -> PathBuf {
        match value {
            Some(v) if !v.is_empty() => {
                let path = PathBuf::from(v);
                if path.is_relative() {
                    violations.push(format!("{field}: must be an absolute path, got {v:?}"));
                }
                path
            }
            _ => {
                violations.push(format!("{field}: required"));
                PathBuf::new()
            }
        }
    };
    Directories {
        workspace_dir: required_path("workspace_dir", &raw.workspace_dir),
        cache_dir: required_path("cache_dir", &raw.cache_dir),
        state_dir: required_path("state_dir", &raw.state_dir),
    }
}

fn build_timers(raw: &RawConfig, violations: &mut Violations) -> Timers {
    let mut duration_field = |field: &str, value: Option<&str>, default: &str| -> Duration {
        let raw_value = value.unwrap_or(default);
        parse_duration(raw_value).unwrap_or_else(|| {
            violations.push(format!("{field}: invalid duration {raw_value:?}"));
            parse_duration(default).unwrap_or_default()
        })
    };
    Timers {
        heartbeat_interval: duration_field("heartbeat_interval", raw.heartbeat_interval.as_deref(), DEFAULT_HEARTBEAT_INTERVAL),
        reconnect_min_interval: duration_field(
            "reconnect_min_interval",
            raw.reconnect_min_interval.as_deref(),
            DEFAULT_RECONNECT_MIN_INTERVAL,
        ),
        reconnect_max_interval: duration_field(
            "reconnect_max_interval",
            raw.reconnect_max_interval.as_deref(),
            DEFAULT_RECONNECT_MAX_INTERVAL,
        ),
        default_timeout: duration_field("default_timeout", raw.default_timeout.as_deref(), DEFAULT_TIMEOUT),
        resource_check_interval: duration_field(
            "resource_check_interval",
            raw.resource_check_interval.as_deref(),
            DEFAULT_RESOURCE_CHECK_INTERVAL,
        ),
    }
}

/// Enforces the timer bounds: heartbeat interval >= 5s, reconnect min
/// interval >= 100ms, reconnect max >= reconnect min, and the
/// default per-run timeout >= 1 minute.
fn validate_timers(timers: &Timers, violations: &mut Violations) {
    if timers.heartbeat_interval < Duration::from_secs(5) {
        violations.push(format!(
            "heartbeat_interval: must be >= 5s, got {:?}",
            timers.heartbeat_interval
        ));
    }
    if timers.reconnect_min_interval < Duration::from_millis(100) {
        violations.push(format!(
            "reconnect_min_interval: must be >= 100ms, got {:?}",
            timers.reconnect_min_interval
        ));
    }
    if timers.reconnect_max_interval < timers.reconnect_min_interval {
        violations.push(format!(
            "reconnect_max_interval: must be >= reconnect_min_interval, got {:?} < {:?}",
            timers.reconnect_max_interval, timers.reconnect_min_interval
        ));
    }
    if timers.default_timeout < Duration::from_secs(60) {
        violations.push(format!("default_timeout: must be >= 1m, got {:?}", timers.default_timeout));
    }
}

fn build_admission(raw: &RawConfig, violations: &mut Violations) -> AdmissionThresholds {
    let mut percent_field = |field: &str, value: Option<&str>, default: &str| -> f64 {
        let raw_value = value.unwrap_or(default);
        match raw_value.parse::<f64>() {
            Ok(v) if v > 0.0 && v <= 100.0 => v,
            _ => {
                violations.push(format!("{field}: must be in (0, 100], got {raw_value:?}"));
                90.0
            }
        }
    };
    AdmissionThresholds {
        cpu_percent: percent_field("cpu_threshold", raw.cpu_threshold.as_deref(), DEFAULT_CPU_THRESHOLD),
        memory_percent: percent_field("memory_threshold", raw.memory_threshold.as_deref(), DEFAULT_MEMORY_THRESHOLD),
        disk_percent: percent_field("disk_threshold", raw.disk_threshold.as_deref(), DEFAULT_DISK_THRESHOLD),
    }
}

fn build_executor(raw: &RawConfig) -> ExecutorSelection {
    let docker_enabled = raw.docker_enabled.as_deref().is_some_and(|v| is_truthy(v));
    if docker_enabled {
        ExecutorSelection::SubprocessAndContainer { docker_host: raw.docker_host.clone() }
    } else {
        ExecutorSelection::SubprocessOnly
    }
}

fn build_secrets(raw: &RawConfig, violations: &mut Violations) -> SecretProviderConfig {
    match raw.secrets_provider.as_deref() {
        None | Some("") => SecretProviderConfig::None,
        Some("vault") => {
            let address = raw.vault_address.clone().unwrap_or_default();
            let token = raw.vault_token.clone().unwrap_or_default();
            let mount = raw.vault_mount.clone().unwrap_or_default();
            if address.is_empty() {
                violations.push("vault_address: required when secrets_provider=vault");
            }
            if token.is_empty() {
                violations.push("vault_token: required when secrets_provider=vault");
            }
            if mount.is_empty() {
                violations.push("vault_mount: required when secrets_provider=vault");
            }
            SecretProviderConfig::Vault { address, token, mount }
        }
        Some(other) => {
            violations.push(format!("secrets_provider: unrecognized value {other:?}, expected empty or \"vault\""));
            SecretProviderConfig::None
        }
    }
}

fn build_ambient(raw: &RawConfig, violations: &mut Violations) -> AmbientConfig {
    let log_level = match raw.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL) {
        "debug" => LogLevel::Debug,
        "info" => LogLevel::Info,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        other => {
            violations.push(format!("log_level: must be one of debug|info|warn|error, got {other:?}"));
            LogLevel::Info
        }
    };
    let log_format = match raw.log_format.as_deref().unwrap_or(DEFAULT_LOG_FORMAT) {
        "json" => LogFormat::Json,
        "console" => LogFormat::Console,
        other => {
            violations.push(format!("log_format: must be one of json|console, got {other:?}"));
            LogFormat::Json
        }
    };
    AmbientConfig { log_level, log_format }
}

fn parse_bool_field(field: &str, value: Option<&str>, default: bool, violations: &mut Violations) -> bool {
    match value {
        None => default,
        Some(v) if is_truthy(v) => true,
        Some(v) if is_falsy(v) => false,
        Some(other) => {
            violations.push(format!("{field}: must be a boolean, got {other:?}"));
            default
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn is_falsy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_kv_csv(value: Option<&str>) -> HashMap<String, String> {
    value
        .map(|v| {
            v.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    let k = k.trim();
                    if k.is_empty() {
                        return None;
                    }
                    Some((k.to_string(), v.trim().to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parses durations of the form `"500ms"`, `"30s"`, `"5m"`, `"1h"`. No
/// external duration-parsing crate is in the dependency tree, so this
/// covers exactly the unit suffixes the config surface needs.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = raw.split_at(split_at);
    let value: f64 = number.parse().ok()?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    if seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

fn default_hostname() -> String {
    hostname_from_env().unwrap_or_else(|| "conductor-agent".to_string())
}

fn hostname_from_env() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty())
}
