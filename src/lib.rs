pub mod action;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod grpc;
pub mod node;
pub mod operations;
pub mod pidfile;
pub mod shutdown;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("remote_worker");
}
