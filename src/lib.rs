//! Conductor worker agent: a long-lived process that registers with a
//! control plane over a single bidirectional session, accepts `AssignWork`
//! under a bounded concurrency limit, runs tests via a pluggable `Executor`,
//! and streams results back with a crash-recoverable journal of in-flight
//! work.
//!
//! Layout mirrors the ports-and-adapters split used throughout: `domain`
//! holds the data model and port traits with no I/O, `application` holds
//! the orchestration built only against those traits, `adapters` holds the
//! concrete implementations (gRPC, SQLite, git, subprocess/container,
//! Vault, HTTP), and `infrastructure` wires the two together from
//! configuration.

pub mod adapters;
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod proto;

pub use domain::{AgentError, AgentResult};
