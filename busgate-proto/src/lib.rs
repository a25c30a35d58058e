//! Generated protobuf/gRPC types shared by the busgate crates.

pub mod v1 {
    tonic::include_proto!("busgate.v1");
}

pub use v1::*;
