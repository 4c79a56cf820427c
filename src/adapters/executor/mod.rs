//! `Executor` adapters: subprocess and container variants, plus the
//! shell-like command-line splitter they share.

pub mod command_line;
pub mod container;
pub mod subprocess;

pub use container::ContainerExecutor;
pub use subprocess::SubprocessExecutor;
