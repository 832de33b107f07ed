pub mod api;
pub mod application;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod metrics;
pub mod reporter;
pub mod service;
pub mod task;
pub mod util;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("convoy.api");
}
