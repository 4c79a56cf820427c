//! `Session` adapter: the single authenticated bidirectional gRPC stream to
//! the control plane, plus its wire codec and reconnect backoff.

pub mod backoff;
pub mod codec;
mod grpc;

pub use grpc::{GrpcSession, SessionConfig};
