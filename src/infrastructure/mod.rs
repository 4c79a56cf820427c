//! Infrastructure layer: loads `Config` from the process environment, sets
//! up structured logging, and wires the concrete adapters into a running
//! `Dispatcher`. Nothing outside this module and `main` should construct an
//! adapter directly.

pub mod config;
pub mod logging;
pub mod setup;
