//! Generated gRPC/protobuf types for the `AgentSession` service
//! (`proto/conductor_agent.proto`), compiled by `build.rs` via `tonic-build`.

tonic::include_proto!("conductor.agent.v1");
