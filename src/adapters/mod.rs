//! Concrete implementations of the `domain::ports` traits: everything that
//! talks to a process, a socket, a filesystem, or an external HTTP service.

pub mod blob_store;
pub mod executor;
pub mod repo_cache;
pub mod result_parsers;
pub mod secrets;
pub mod session;
pub mod sqlite;
