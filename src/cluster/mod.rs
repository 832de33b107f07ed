pub mod api;
pub mod client;

pub use api::{ClusterApi, KubeClusterApi, ObjectEvent, PodUsage};
pub use client::KubeClientProvider;
