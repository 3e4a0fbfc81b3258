//! Network surface: gRPC ingest service and HTTP admin/push routes.

pub mod admin;
pub mod grpc;
pub mod push;

/// Generated protobuf/tonic types for the ingest service.
pub mod proto {
    tonic::include_proto!("monitor.ingest.v1");
}
